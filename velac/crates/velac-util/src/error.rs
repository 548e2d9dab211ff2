//! Error and warning types.
//!
//! Two error classes exist, matching the two phases of the engine:
//!
//! - [`CompileError`]: fatal, carries file/line/column of the faulty token.
//! - [`RuntimeError`]: carries file/function/line plus the fiber call stack
//!   depth; the VM marks the main fiber dead and unwinds to the outermost
//!   `run`/`call` invocation.
//!
//! Both propagate as ordinary `Result` values to the API boundary, where
//! they are rendered into an [`ErrorReport`]. Warnings are non-fatal and
//! flow through a caller-supplied [`WarningHandler`].

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

/// The runtime error code reserved for engine-raised errors. Scripts may
/// raise their own codes via `exit(code, msg)`.
pub const ERR_RUNTIME: i64 = -1;

/// A fatal compile-time error.
#[derive(Clone, Debug, Error)]
#[error("{file_name}:{line}:{pos}: {msg}")]
pub struct CompileError {
    pub file_name: String,
    pub fn_name: String,
    pub line: u32,
    pub pos: u32,
    pub msg: String,
}

impl CompileError {
    pub fn new(file_name: impl Into<String>, fn_name: impl Into<String>, line: u32, pos: u32, msg: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            fn_name: fn_name.into(),
            line,
            pos,
            msg: msg.into(),
        }
    }
}

/// A runtime error raised by the VM or by a script's `exit()`.
#[derive(Clone, Debug, Error)]
#[error("{file_name}: {fn_name}: {line}: {msg}")]
pub struct RuntimeError {
    pub file_name: String,
    pub fn_name: String,
    pub line: u32,
    pub code: i64,
    pub call_depth: usize,
    pub msg: String,
}

impl RuntimeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            file_name: String::new(),
            fn_name: String::new(),
            line: 0,
            code: ERR_RUNTIME,
            call_depth: 0,
            msg: msg.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// The most recent error, in the shape exposed to embedders.
#[derive(Clone, Debug, Default)]
pub struct ErrorReport {
    pub file_name: String,
    pub fn_name: String,
    pub line: u32,
    pub pos: u32,
    pub code: i64,
    pub msg: String,
}

impl From<CompileError> for ErrorReport {
    fn from(err: CompileError) -> Self {
        Self {
            file_name: err.file_name,
            fn_name: err.fn_name,
            line: err.line,
            pos: err.pos,
            code: 0,
            msg: err.msg,
        }
    }
}

impl From<RuntimeError> for ErrorReport {
    fn from(err: RuntimeError) -> Self {
        Self {
            file_name: err.file_name,
            fn_name: err.fn_name,
            line: err.line,
            pos: 1,
            code: err.code,
            msg: err.msg,
        }
    }
}

/// A non-fatal diagnostic, delivered through the warning callback.
#[derive(Clone, Debug)]
pub struct Warning {
    pub file_name: String,
    pub fn_name: String,
    pub line: u32,
    pub pos: u32,
    pub msg: String,
}

/// Caller-supplied warning sink, shared by the compiler and the VM.
pub type WarningHandler = Rc<RefCell<dyn FnMut(&Warning)>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = CompileError::new("main.vl", "main", 3, 7, "Unexpected token");
        assert_eq!(err.to_string(), "main.vl:3:7: Unexpected token");
    }

    #[test]
    fn test_runtime_error_default_code() {
        let err = RuntimeError::new("Index 5 is out of range 0...2");
        assert_eq!(err.code, ERR_RUNTIME);
    }

    #[test]
    fn test_report_from_runtime() {
        let report: ErrorReport = RuntimeError::new("Out of memory").with_code(-1).into();
        assert_eq!(report.code, ERR_RUNTIME);
        assert_eq!(report.msg, "Out of memory");
    }
}
