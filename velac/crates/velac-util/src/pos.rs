//! Source positions and per-instruction debug records.

use std::rc::Rc;

/// Line/column location of a token (both 1-based).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SrcPos {
    pub line: u32,
    pub pos: u32,
}

impl SrcPos {
    #[inline]
    pub fn new(line: u32, pos: u32) -> Self {
        Self { line, pos }
    }
}

/// Debug record attached to every emitted instruction.
///
/// The lexer keeps one of these current while scanning; the code generator
/// snapshots it per instruction so the VM's error reporter and the hook
/// callbacks can render stack traces without any extra tables.
#[derive(Clone, Debug)]
pub struct DebugInfo {
    pub file_name: Rc<str>,
    pub fn_name: Rc<str>,
    pub line: u32,
}

impl DebugInfo {
    pub fn new(file_name: Rc<str>) -> Self {
        Self {
            file_name,
            fn_name: Rc::from("<unknown>"),
            line: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_info_starts_unknown() {
        let debug = DebugInfo::new(Rc::from("main.vl"));
        assert_eq!(&*debug.fn_name, "<unknown>");
        assert_eq!(debug.line, 1);
    }
}
