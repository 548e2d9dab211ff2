//! velac-util - Shared infrastructure for the Vela compiler and VM.
//!
//! This crate holds the pieces every other crate leans on:
//!
//! - [`Storage`]: the compiler-owned bump arena (source of all interned bytes)
//! - [`Symbol`] / [`Interner`]: interned identifier names
//! - [`SrcPos`] / [`DebugInfo`]: source locations and the per-instruction
//!   debug records used for stack traces
//! - [`CompileError`] / [`RuntimeError`] / [`ErrorReport`]: the two error
//!   classes of the engine and the report shape shown to embedders
//! - [`Ptr`]: the 64-bit address handle interpreted by the VM and the heap

pub mod error;
pub mod handle;
pub mod ids;
pub mod pos;
pub mod storage;
pub mod symbol;

pub use error::{
    CompileError, CompileResult, ErrorReport, RuntimeError, RuntimeResult, Warning, WarningHandler,
    ERR_RUNTIME,
};
pub use handle::{Ptr, PtrRegion};
pub use ids::TypeId;
pub use pos::{DebugInfo, SrcPos};
pub use storage::Storage;
pub use symbol::{Interner, Symbol};
