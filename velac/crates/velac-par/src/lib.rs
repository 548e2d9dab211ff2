//! velac-par - Recursive-descent parser for Vela.
//!
//! The parser drives the code generator directly: type checks, implicit
//! conversions, constant folding, and code emission all happen in one
//! traversal of the token stream. There is no AST.

mod builtin_call;
mod compiler;
mod decl;
mod edge_cases;
mod expr;
mod stmt;

pub use compiler::{Compiler, CompilerConfig, SourceLoader};
