//! The `velac` command-line driver.
//!
//! `velac [flags] [file.vl] [script args...]` with flags `-stack <n>`,
//! `-asm`, `-check`, `-warn`, `-sandbox`. The exit code is 1 on any
//! compilation or runtime error, otherwise the value passed to the
//! script's `exit()` (default 0).

use std::cell::RefCell;
use std::path::Path;
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{bail, Context, Result};

use velac_drv::{exit_code_for, Config, Vela, DEFAULT_STACK_SIZE};
use velac_util::Warning;

struct Options {
    stack_size: usize,
    dump_asm: bool,
    check_only: bool,
    warnings: bool,
    sandbox: bool,
    file: String,
    script_args: Vec<String>,
}

fn parse_args(mut args: Vec<String>) -> Result<Options> {
    let mut options = Options {
        stack_size: DEFAULT_STACK_SIZE,
        dump_asm: false,
        check_only: false,
        warnings: false,
        sandbox: false,
        file: String::new(),
        script_args: Vec::new(),
    };
    args.reverse();
    while let Some(arg) = args.pop() {
        match arg.as_str() {
            "-stack" => {
                let value = args.pop().context("-stack requires a size in slots")?;
                options.stack_size = value.parse().context("-stack requires a size in slots")?;
            }
            "-asm" => options.dump_asm = true,
            "-check" => options.check_only = true,
            "-warn" => options.warnings = true,
            "-sandbox" => options.sandbox = true,
            _ => {
                options.file = arg;
                args.reverse();
                options.script_args = args;
                break;
            }
        }
    }
    if options.file.is_empty() {
        bail!("Usage: velac [-stack <n>] [-asm] [-check] [-warn] [-sandbox] <file.vl> [args...]");
    }
    Ok(options)
}

fn run(options: Options) -> Result<i32> {
    let source = std::fs::read_to_string(&options.file)
        .with_context(|| format!("Cannot open file {}", options.file))?;

    let base_dir = Path::new(&options.file)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let sandbox = options.sandbox;

    let mut config = Config::from_source(&options.file, source);
    config.stack_size = options.stack_size;
    config.args = options.script_args.clone();
    config.file_system_enabled = !sandbox;
    config.impl_libs_enabled = !sandbox;
    if !sandbox {
        config.loader = Some(Box::new(move |path: &str| {
            std::fs::read_to_string(base_dir.join(path)).ok()
        }));
    }
    if options.warnings {
        config.warning_handler = Some(Rc::new(RefCell::new(|warning: &Warning| {
            eprintln!(
                "{}:{}: warning: {}",
                warning.file_name, warning.line, warning.msg
            );
        })));
    }

    let mut engine = Vela::new(config);
    if let Err(report) = engine.compile() {
        eprintln!(
            "Error {}:{}:{}: {}",
            report.file_name, report.line, report.pos, report.msg
        );
        return Ok(1);
    }

    if options.dump_asm {
        print!("{}", engine.asm().unwrap_or_default());
    }
    if options.check_only {
        return Ok(0);
    }

    match engine.run() {
        Ok(()) => Ok(0),
        Err(report) => {
            if !report.msg.is_empty() {
                eprintln!(
                    "Runtime error {}: {}: {}: {}",
                    report.file_name, report.fn_name, report.line, report.msg
                );
            }
            Ok(exit_code_for(&report))
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(args).and_then(run) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}
