//! velac-sem - Semantic tables of the Vela compiler.
//!
//! The single-pass parser leans on four tables while it emits code:
//!
//! - [`Types`]: the structural type graph (arena-indexed, cycle-safe)
//! - [`Idents`] + [`Blocks`]: the scoped identifier table
//! - [`consts`]: compile-time evaluation of scalar and string operators
//! - [`Modules`]: the module registry with import visibility
//!
//! Fallible operations return `Result<_, String>`; the parser attaches the
//! current source position when it converts them into compile errors.

pub mod builtin;
pub mod consts;
pub mod ident;
pub mod module;
pub mod types;

pub use builtin::BuiltinFn;
pub use consts::Const;
pub use ident::{Blocks, Ident, IdentKind, Idents};
pub use module::Modules;
pub use types::{Field, Param, PrimTypes, Signature, Type, TypeKind, Types};
