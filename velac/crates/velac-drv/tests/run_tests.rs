//! End-to-end tests: compile and run whole programs through the embedding
//! API, asserting on captured stdout and on error reports.

use velac_drv::run_source;

fn expect_output(source: &str, expected: &str) {
    let (result, output) = run_source(source);
    assert!(result.is_ok(), "unexpected error: {:?}", result.err());
    assert_eq!(output, expected);
}

fn expect_runtime_error(source: &str, expected_msg: &str) {
    let (result, _) = run_source(source);
    let report = result.expect_err("expected a runtime error");
    assert_eq!(report.msg, expected_msg);
}

fn expect_compile_error(source: &str) {
    let mut engine = velac_drv::Vela::new(velac_drv::Config::from_source("main.vl", source));
    assert!(engine.compile().is_err(), "expected a compile error");
}

#[test]
fn test_arithmetic_printf() {
    expect_output(r#"fn main() { printf("%d\n", 2 + 3) }"#, "5\n");
}

#[test]
fn test_sort_with_comparator() {
    expect_output(
        r#"fn main() { a := []int{3,1,2}; sort(a, fn(x, y: ^int): int {return x^ - y^}); printf("%d %d %d", a[0], a[1], a[2]) }"#,
        "1 2 3",
    );
}

#[test]
fn test_map_store_and_load() {
    expect_output(
        r#"fn main() { m := make(map[str]int); m["x"] = 7; printf("%d", m["x"]) }"#,
        "7",
    );
}

#[test]
fn test_array_index_out_of_range() {
    expect_runtime_error(
        r#"fn main() { var a: [3]int; a[5] = 1 }"#,
        "Index 5 is out of range 0...2",
    );
}

#[test]
fn test_fiber_child_writes_through_pointer() {
    expect_output(
        r#"
fn child(parent: ^fiber, p: ^int) { p^ = 42; resume(parent) }
fn main() { x := 0; f := make(fiber, child, &x); resume(f); printf("%d", x) }
"#,
        "42",
    );
}

#[test]
fn test_string_concat_and_len() {
    expect_output(
        r#"fn main() { s := "ab"; s += "cd"; printf("%s(%d)", s, len(s)) }"#,
        "abcd(4)",
    );
}

#[test]
fn test_real_arithmetic() {
    expect_output(r#"fn main() { printf("%.2f", 1.5 * 4.0) }"#, "6.00");
}

#[test]
fn test_mixed_int_real() {
    expect_output(r#"fn main() { printf("%.1f", 1 + 0.5) }"#, "1.5");
}

#[test]
fn test_if_else() {
    expect_output(
        r#"fn main() { x := 5; if x > 3 { printf("big") } else { printf("small") } }"#,
        "big",
    );
}

#[test]
fn test_for_loop_sum() {
    expect_output(
        r#"fn main() { sum := 0; for i := 0; i < 5; i++ { sum += i }; printf("%d", sum) }"#,
        "10",
    );
}

#[test]
fn test_break_and_continue() {
    expect_output(
        r#"
fn main() {
    sum := 0
    for i := 0; i < 10; i++ {
        if i == 3 { continue };
        if i == 6 { break };
        sum += i
    }
    printf("%d", sum)
}
"#,
        "12",
    );
}

#[test]
fn test_nested_loops() {
    expect_output(
        r#"
fn main() {
    n := 0
    for i := 0; i < 3; i++ {
        for j := 0; j < 3; j++ {
            n++
        }
    }
    printf("%d", n)
}
"#,
        "9",
    );
}

#[test]
fn test_switch() {
    expect_output(
        r#"
fn main() {
    for i := 0; i < 4; i++ {
        switch i {
        case 0: printf("zero ")
        case 1, 2: printf("mid ")
        default: printf("big ")
        }
    }
}
"#,
        "zero mid mid big ",
    );
}

#[test]
fn test_recursion() {
    expect_output(
        r#"
fn fact(n: int): int {
    if n <= 1 { return 1 };
    return n * fact(n - 1)
}
fn main() { printf("%d", fact(6)) }
"#,
        "720",
    );
}

#[test]
fn test_struct_and_method() {
    expect_output(
        r#"
type Point = struct { x, y: int }
fn (p: ^Point) sum(): int { return p.x + p.y }
fn main() {
    pt := Point{x: 3, y: 4}
    printf("%d", pt.sum())
}
"#,
        "7",
    );
}

#[test]
fn test_interface_dispatch() {
    expect_output(
        r#"
type Shape = interface { area(): int }
type Square = struct { side: int }
fn (s: ^Square) area(): int { return s.side * s.side }
fn main() {
    var sh: Shape = Square{side: 5}
    printf("%d", sh.area())
}
"#,
        "25",
    );
}

#[test]
fn test_closure_capture() {
    expect_output(
        r#"
fn main() {
    k := 10
    add := fn (x: int): int |k| { return x + k }
    printf("%d", add(32))
}
"#,
        "42",
    );
}

#[test]
fn test_fn_value_passed_around() {
    expect_output(
        r#"
fn double(x: int): int { return 2 * x }
fn apply(f: fn (x: int): int, v: int): int { return f(v) }
fn main() { printf("%d", apply(double, 21)) }
"#,
        "42",
    );
}

#[test]
fn test_pointers_and_new() {
    expect_output(
        r#"fn main() { p := new(int, 5); p^ = p^ + 2; printf("%d", p^) }"#,
        "7",
    );
}

#[test]
fn test_weak_pointer_strengthens_while_alive() {
    expect_output(
        r#"
fn main() {
    p := new(int, 5)
    var w: weak ^int
    w = p
    var q: ^int
    q = w
    printf("%d", q^)
}
"#,
        "5",
    );
}

#[test]
fn test_weak_pointer_nulls_after_release() {
    expect_output(
        r#"
fn main() {
    var w: weak ^int
    {
        p := new(int, 7)
        w = p
    }
    var q: ^int
    q = w
    if q == null { printf("gone") } else { printf("alive") }
}
"#,
        "gone",
    );
}

#[test]
fn test_division_by_zero() {
    expect_runtime_error(
        r#"fn main() { d := 0; printf("%d", 7 / d) }"#,
        "Division by zero",
    );
}

#[test]
fn test_overflow_on_assignment() {
    expect_runtime_error(
        r#"fn main() { var b: int8; n := 200; b = n; printf("%d", b) }"#,
        "Overflow of int8",
    );
}

#[test]
fn test_dynamic_array_append_and_delete() {
    expect_output(
        r#"
fn main() {
    a := []int{1, 2}
    a = append(a, 3)
    a = delete(a, 0)
    printf("%d %d %d", len(a), a[0], a[1])
}
"#,
        "2 2 3",
    );
}

#[test]
fn test_slice() {
    expect_output(
        r#"
fn main() {
    s := "abcdef"
    printf("%s", slice(s, 1, 4))
}
"#,
        "bcd",
    );
}

#[test]
fn test_map_len_and_keys() {
    expect_output(
        r#"
fn main() {
    m := make(map[str]int)
    m["a"] = 1; m["b"] = 2; m["c"] = 3
    ks := keys(m)
    printf("%d %d %v %v", len(m), len(ks), validkey(m, "b"), validkey(m, "zz"))
}
"#,
        "3 3 true false",
    );
}

#[test]
fn test_map_delete() {
    expect_output(
        r#"
fn main() {
    m := make(map[int]int)
    m[1] = 10; m[2] = 20; m[3] = 30
    m = delete(m, 2)
    printf("%d %v", len(m), validkey(m, 2))
}
"#,
        "2 false",
    );
}

#[test]
fn test_sortfast() {
    expect_output(
        r#"
fn main() {
    a := []int{5, 3, 9, 1}
    sortfast(a, true)
    printf("%d %d %d %d", a[0], a[1], a[2], a[3])
}
"#,
        "1 3 5 9",
    );
}

#[test]
fn test_sortfast_descending() {
    expect_output(
        r#"
fn main() {
    a := []int{5, 3, 9, 1}
    sortfast(a, false)
    printf("%d %d %d %d", a[0], a[1], a[2], a[3])
}
"#,
        "9 5 3 1",
    );
}

#[test]
fn test_string_compare() {
    expect_output(
        r#"fn main() { printf("%v %v %v", "abc" < "abd", "x" == "x", "b" > "c") }"#,
        "true true false",
    );
}

#[test]
fn test_repr_of_values() {
    expect_output(r#"fn main() { printf("%v %v %v", 42, true, 2.5) }"#, "42 true 2.5");
}

#[test]
fn test_math_builtins() {
    expect_output(
        r#"fn main() { printf("%d %d %.1f", round(2.6), abs(-5), sqrt(6.25)) }"#,
        "3 5 2.5",
    );
}

#[test]
fn test_const_folding() {
    expect_output(
        r#"
const (
    width = 6
    area = width * width
)
fn main() { printf("%d", area) }
"#,
        "36",
    );
}

#[test]
fn test_global_var_initializer_runs_before_main() {
    expect_output(
        r#"
var greeting: str = "hi"
fn main() { printf("%s", greeting) }
"#,
        "hi",
    );
}

#[test]
fn test_char_and_escapes() {
    expect_output(r#"fn main() { c := 'A'; printf("%c%c", c, '\x42') }"#, "AB");
}

#[test]
fn test_bitwise_ops() {
    expect_output(
        r#"fn main() { printf("%d %d %d %d", 6 & 3, 6 | 3, 6 ~ 3, 1 << 4) }"#,
        "2 7 5 16",
    );
}

#[test]
fn test_short_circuit_evaluation() {
    // The right-hand side must not run when the left side decides.
    expect_output(
        r#"
fn boom(): bool { exit(9, "must not run"); return true }
fn main() {
    if false && boom() { printf("bad") }
    if true || boom() { printf("ok") }
}
"#,
        "ok",
    );
}

#[test]
fn test_exit_with_code() {
    let (result, _) = run_source(r#"fn main() { exit(5, "stop") }"#);
    let report = result.expect_err("exit raises through the error channel");
    assert_eq!(report.code, 5);
    assert_eq!(report.msg, "stop");
}

#[test]
fn test_sprintf_and_sscanf() {
    expect_output(
        r#"
fn main() {
    s := sprintf("%d-%d", 4, 2)
    a := 0
    b := 0
    sscanf(s, "%d-%d", &a, &b)
    printf("%s %d %d", s, a, b)
}
"#,
        "4-2 4 2",
    );
}

#[test]
fn test_modules() {
    let mut engine = velac_drv::Vela::new(velac_drv::Config::from_source(
        "main.vl",
        r#"
import "mathx.vl"
fn main() { printf("%d", mathx::double(21)) }
"#,
    ));
    engine.add_module("mathx.vl", "fn double*(x: int): int { return 2 * x }\n");
    engine.compile().expect("modules compile");
    let output = engine.capture_output();
    engine.run().expect("modules run");
    assert_eq!(String::from_utf8_lossy(&output.borrow()), "42");
}

#[test]
fn test_module_visibility_enforced() {
    let mut engine = velac_drv::Vela::new(velac_drv::Config::from_source(
        "main.vl",
        r#"
import "m.vl"
fn main() { printf("%d", m::hidden(1)) }
"#,
    ));
    engine.add_module("m.vl", "fn hidden(x: int): int { return x }\n");
    assert!(engine.compile().is_err(), "unexported identifiers are invisible");
}

#[test]
fn test_host_function() {
    use std::rc::Rc;
    let mut engine = velac_drv::Vela::new(velac_drv::Config::from_source(
        "main.vl",
        r#"
fn host_add(a, b: int): int;
fn main() { printf("%d", host_add(40, 2)) }
"#,
    ));
    engine.add_func(
        "host_add",
        Rc::new(|vm: &mut velac_vm::Vm| {
            let a = vm.extern_arg(0).int_val();
            let b = vm.extern_arg(1).int_val();
            vm.set_extern_result(velac_drv::Slot::from_int(a + b));
            Ok(())
        }),
    );
    engine.compile().expect("host function compiles");
    let output = engine.capture_output();
    engine.run().expect("host function runs");
    assert_eq!(String::from_utf8_lossy(&output.borrow()), "42");
}

#[test]
fn test_call_api() {
    let mut engine = velac_drv::Vela::new(velac_drv::Config::from_source(
        "main.vl",
        r#"
fn triple(x: int): int { return 3 * x }
fn main() { }
"#,
    ));
    engine.compile().expect("compiles");
    let ctx = engine.get_func("triple").expect("triple is callable");
    let result = engine
        .call(&ctx, &[velac_drv::Slot::from_int(14)])
        .expect("call succeeds");
    assert_eq!(result.int_val(), 42);
}

#[test]
fn test_no_leaks_after_run() {
    let mut engine = velac_drv::Vela::new(velac_drv::Config::from_source(
        "main.vl",
        r#"
fn main() {
    s := "grow"
    s += " and grow"
    a := []int{1, 2, 3}
    a = append(a, 4)
    m := make(map[str]int)
    m["k"] = 1
    printf("%d %d %d", len(s), len(a), len(m))
}
"#,
    ));
    engine.compile().expect("compiles");
    let _output = engine.capture_output();
    engine.run().expect("runs");

    let vm = engine.vm().expect("vm exists");
    assert!(vm.heap.check_page_ref_counts(), "page counts stay consistent");
    // Only the main fiber's handle survives the run.
    assert_eq!(vm.heap.leaks().len(), 1, "leaks: {:?}", vm.heap.leaks());
    assert!(!engine.alive(), "main fiber has terminated");
}

#[test]
fn test_unused_variable_warning() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let warnings: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&warnings);
    let mut config = velac_drv::Config::from_source(
        "main.vl",
        r#"fn main() { orphan := 1; used := 2; printf("%d", used) }"#,
    );
    config.warning_handler = Some(Rc::new(RefCell::new(move |w: &velac_drv::Warning| {
        sink.borrow_mut().push(w.msg.clone());
    })));
    let mut engine = velac_drv::Vela::new(config);
    engine.compile().expect("compiles");
    let collected = warnings.borrow().clone();
    assert_eq!(collected.len(), 1, "warnings: {collected:?}");
    assert!(collected[0].contains("orphan"), "warnings: {collected:?}");
}

#[test]
fn test_compile_errors() {
    expect_compile_error("fn main() { x := }");
    expect_compile_error("fn main() { y = 1 }");
    expect_compile_error("fn notmain() { }");
}

#[test]
fn test_printf_type_mismatch() {
    expect_runtime_error(
        r#"fn main() { printf("%d", "text") }"#,
        "Incompatible types int and str in printf",
    );
}

#[test]
fn test_pointer_escape_detected() {
    expect_runtime_error(
        r#"
fn leak(): ^int {
    x := 5
    return &x
}
fn main() { p := leak(); printf("%d", p^) }
"#,
        "Pointer to a local variable escapes from the function",
    );
}

#[test]
fn test_fiber_runs_to_completion() {
    // A child that returns dies; valid() observes the transition.
    expect_output(
        r#"
fn child(parent: ^fiber, p: ^int) {
    p^ = 1
}
fn main() {
    x := 0
    f := make(fiber, child, &x)
    before := valid(f)
    resume(f)
    printf("%v %v %d", before, valid(f), x)
}
"#,
        "true false 1",
    );
}
