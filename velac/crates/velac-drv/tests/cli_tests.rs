//! CLI tests for the `velac` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn write_script(dir: &tempfile::TempDir, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create script");
    file.write_all(source.as_bytes()).expect("write script");
    path
}

#[test]
fn test_run_hello() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(&dir, "hello.vl", r#"fn main() { printf("hello\n") }"#);

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg(&script)
        .assert()
        .success()
        .stdout("hello\n");
}

#[test]
fn test_compile_error_exits_1() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(&dir, "bad.vl", "fn main() { x := }");

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg(&script)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_runtime_error_exits_1() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(&dir, "oob.vl", "fn main() { var a: [3]int; a[5] = 1 }");

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg(&script)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Index 5 is out of range 0...2"));
}

#[test]
fn test_exit_code_passthrough() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(&dir, "exit.vl", r#"fn main() { exit(7, "bye") }"#);

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg(&script)
        .assert()
        .code(7);
}

#[test]
fn test_check_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(&dir, "ok.vl", r#"fn main() { printf("never runs") }"#);

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg("-check")
        .arg(&script)
        .assert()
        .success()
        .stdout("");
}

#[test]
fn test_asm_listing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(&dir, "asm.vl", "fn main() { }");

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg("-asm")
        .arg("-check")
        .arg(&script)
        .assert()
        .success()
        .stdout(predicate::str::contains("ENTER_FRAME"))
        .stdout(predicate::str::contains("RETURN"));
}

#[test]
fn test_missing_file() {
    Command::cargo_bin("velac")
        .expect("binary exists")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_imports_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(&dir, "lib.vl", "fn twice*(x: int): int { return 2 * x }\n");
    let script = write_script(
        &dir,
        "main.vl",
        "import \"lib.vl\"\nfn main() { printf(\"%d\", lib::twice(21)) }\n",
    );

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg(&script)
        .assert()
        .success()
        .stdout("42");
}

#[test]
fn test_sandbox_blocks_imports() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(&dir, "lib.vl", "fn twice*(x: int): int { return 2 * x }\n");
    let script = write_script(
        &dir,
        "main.vl",
        "import \"lib.vl\"\nfn main() { printf(\"%d\", lib::twice(21)) }\n",
    );

    Command::cargo_bin("velac")
        .expect("binary exists")
        .arg("-sandbox")
        .arg(&script)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unable to load module"));
}
