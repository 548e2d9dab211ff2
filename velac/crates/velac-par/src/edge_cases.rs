//! Edge case tests for velac-par

#[cfg(test)]
mod tests {
    use velac_gen::{Opcode, Program};

    use crate::{Compiler, CompilerConfig};

    fn compile_source(source: &str) -> Result<Program, String> {
        let compiler = Compiler::new(CompilerConfig {
            file_name: "test.vl".to_string(),
            source: source.to_string(),
            extern_names: Vec::new(),
            modules: Vec::new(),
            loader: None,
            warning_handler: None,
        });
        compiler.compile().map_err(|err| err.msg)
    }

    fn compiles(source: &str) -> Program {
        compile_source(source).unwrap_or_else(|msg| panic!("compile failed: {msg}"))
    }

    fn fails(source: &str) -> String {
        compile_source(source).expect_err("expected a compile error")
    }

    // ==================== EDGE CASES ====================

    /// EDGE CASE: Smallest valid program
    #[test]
    fn test_edge_empty_main() {
        let program = compiles("fn main() { }");
        assert!(program.main_entry.is_some());
        let entry = program.main_entry.unwrap();
        assert_eq!(program.code[entry].opcode, Opcode::EnterFrame);
    }

    /// EDGE CASE: Missing main
    #[test]
    fn test_edge_missing_main() {
        let msg = fails("fn helper() { }");
        assert_eq!(msg, "Function main() is not defined");
    }

    /// EDGE CASE: main must take no parameters
    #[test]
    fn test_edge_main_with_params() {
        let msg = fails("fn main(x: int) { }");
        assert_eq!(msg, "Function main() is not defined");
    }

    /// EDGE CASE: Duplicate identifiers in one scope
    #[test]
    fn test_edge_duplicate_identifier() {
        let msg = fails("fn main() { x := 1; x := 2 }");
        assert_eq!(msg, "Duplicate identifier");
    }

    /// EDGE CASE: Unknown identifier
    #[test]
    fn test_edge_unknown_identifier() {
        let msg = fails("fn main() { y = 1 }");
        assert_eq!(msg, "Unknown identifier y");
    }

    /// EDGE CASE: Type mismatch on assignment
    #[test]
    fn test_edge_incompatible_assignment() {
        let msg = fails(r#"fn main() { x := 1; x = "text" }"#);
        assert!(msg.starts_with("Incompatible types"), "got: {msg}");
    }

    /// EDGE CASE: break outside a loop
    #[test]
    fn test_edge_break_outside_loop() {
        let msg = fails("fn main() { break }");
        assert_eq!(msg, "No loop to break");
    }

    /// EDGE CASE: return with a value in a void function
    #[test]
    fn test_edge_missing_return() {
        let msg = fails("fn f(): int { }\nfn main() { x := f(); printf(\"%d\", x) }");
        assert_eq!(msg, "Function must return a value");
    }

    /// EDGE CASE: Shadowing in a nested block is allowed
    #[test]
    fn test_edge_shadowing() {
        compiles("fn main() { x := 1; { x := 2; printf(\"%d\", x) }; printf(\"%d\", x) }");
    }

    /// EDGE CASE: Forward type declarations resolve within a group
    #[test]
    fn test_edge_forward_types() {
        compiles(
            r#"
type (
    Node = struct { value: int; next: ^Node; peer: ^Other }
    Other = struct { owner: ^Node }
)
fn main() { var n: Node; n.value = 1; printf("%d", n.value) }
"#,
        );
    }

    /// EDGE CASE: Unresolved forward type is fatal
    #[test]
    fn test_edge_unresolved_forward() {
        let msg = fails("type Broken = struct { next: ^Missing }\nfn main() { }");
        assert_eq!(msg, "Unresolved forward type declaration Missing");
    }

    /// EDGE CASE: Const division by zero folds to an error
    #[test]
    fn test_edge_const_division_by_zero() {
        let msg = fails("const bad = 1 / 0\nfn main() { }");
        assert_eq!(msg, "Division by zero");
    }

    /// EDGE CASE: Constant overflow against a declared type
    #[test]
    fn test_edge_const_overflow() {
        let msg = fails("const tiny: int8 = 200\nfn main() { }");
        assert_eq!(msg, "Overflow of int8");
    }

    /// EDGE CASE: Array literal arity
    #[test]
    fn test_edge_array_literal_too_long() {
        let msg = fails("fn main() { a := [2]int{1, 2, 3}; printf(\"%d\", a[0]) }");
        assert_eq!(msg, "Too many elements in the literal");
    }

    /// EDGE CASE: Struct literal field order
    #[test]
    fn test_edge_struct_literal_out_of_order() {
        let msg = fails(
            r#"
type P = struct { x, y: int }
fn main() { p := P{y: 1, x: 2}; printf("%d", p.x) }
"#,
        );
        assert_eq!(msg, "Fields must appear in declaration order");
    }

    /// EDGE CASE: Calling a non-function
    #[test]
    fn test_edge_calling_non_function() {
        let msg = fails("fn main() { x := 1; x() }");
        assert!(msg.ends_with("is not callable"), "got: {msg}");
    }

    /// EDGE CASE: Peephole fusion shows up in emitted code
    #[test]
    fn test_edge_push_deref_fused() {
        let program = compiles("fn main() { p := new(int, 3); printf(\"%d\", p^) }");
        let fused = program
            .code
            .iter()
            .any(|i| i.opcode == Opcode::PushLocal || i.inline_opcode == Opcode::Deref);
        assert!(fused, "expected a fused load in the instruction stream");
    }

    /// EDGE CASE: Debug info stays in lockstep with the code
    #[test]
    fn test_edge_debug_stream_lockstep() {
        let program = compiles("fn main() { printf(\"%d\", 1) }");
        assert_eq!(program.code.len(), program.debug.len());
        assert!(program.debug.iter().any(|d| &*d.fn_name == "main"));
    }

    /// EDGE CASE: Prototype without a body or host binding
    #[test]
    fn test_edge_undefined_prototype() {
        let msg = fails("fn ghost(x: int): int;\nfn main() { printf(\"%d\", ghost(1)) }");
        assert_eq!(msg, "Function ghost is not defined");
    }

    /// EDGE CASE: Exported locals are rejected
    #[test]
    fn test_edge_local_export() {
        let msg = fails("fn main() { var x*: int; x = 1 }");
        assert_eq!(msg, "Local identifier cannot be exported");
    }

    /// EDGE CASE: Weak pointer of a weak pointer still parses
    #[test]
    fn test_edge_weak_pointer_type() {
        compiles("fn main() { var w: weak ^int; p := new(int, 1); w = p; printf(\"%d\", p^) }");
    }

    /// EDGE CASE: Placeholder cannot be declared
    #[test]
    fn test_edge_placeholder() {
        let msg = fails("fn main() { var _: int }");
        assert_eq!(msg, "Placeholder cannot be declared");
    }
}
