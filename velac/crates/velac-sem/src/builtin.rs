//! Built-in function selectors.
//!
//! Built-ins are dispatched by this enum, carried in the operand of a
//! `CALL_BUILTIN` instruction. A few of them (`sizeof`, `typeptr`, and the
//! math folders over constant arguments) never reach the VM at all.

/// Selector for a built-in function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BuiltinFn {
    // I/O
    Printf,
    Fprintf,
    Sprintf,
    Scanf,
    Fscanf,
    Sscanf,

    // Math
    Real,
    RealLhs,
    Round,
    Trunc,
    Ceil,
    Floor,
    Abs,
    Fabs,
    Sqrt,
    Sin,
    Cos,
    Atan,
    Atan2,
    Exp,
    Log,

    // Memory
    New,
    Make,
    Makefromarr,
    Makefromstr,
    Maketoarr,
    Maketostr,
    Copy,
    Append,
    Insert,
    Delete,
    Slice,
    Sort,
    Sortfast,
    Len,
    Cap,
    Sizeof,
    Sizeofself,
    Selfptr,
    Selfhasptr,
    Selftypeeq,
    Typeptr,
    Valid,

    // Maps
    Validkey,
    Keys,

    // Fibers
    Resume,

    // Misc
    Memusage,
    Exit,
}

impl BuiltinFn {
    pub fn spelling(self) -> &'static str {
        match self {
            BuiltinFn::Printf => "printf",
            BuiltinFn::Fprintf => "fprintf",
            BuiltinFn::Sprintf => "sprintf",
            BuiltinFn::Scanf => "scanf",
            BuiltinFn::Fscanf => "fscanf",
            BuiltinFn::Sscanf => "sscanf",
            BuiltinFn::Real => "real",
            BuiltinFn::RealLhs => "real_lhs",
            BuiltinFn::Round => "round",
            BuiltinFn::Trunc => "trunc",
            BuiltinFn::Ceil => "ceil",
            BuiltinFn::Floor => "floor",
            BuiltinFn::Abs => "abs",
            BuiltinFn::Fabs => "fabs",
            BuiltinFn::Sqrt => "sqrt",
            BuiltinFn::Sin => "sin",
            BuiltinFn::Cos => "cos",
            BuiltinFn::Atan => "atan",
            BuiltinFn::Atan2 => "atan2",
            BuiltinFn::Exp => "exp",
            BuiltinFn::Log => "log",
            BuiltinFn::New => "new",
            BuiltinFn::Make => "make",
            BuiltinFn::Makefromarr => "makefromarr",
            BuiltinFn::Makefromstr => "makefromstr",
            BuiltinFn::Maketoarr => "maketoarr",
            BuiltinFn::Maketostr => "maketostr",
            BuiltinFn::Copy => "copy",
            BuiltinFn::Append => "append",
            BuiltinFn::Insert => "insert",
            BuiltinFn::Delete => "delete",
            BuiltinFn::Slice => "slice",
            BuiltinFn::Sort => "sort",
            BuiltinFn::Sortfast => "sortfast",
            BuiltinFn::Len => "len",
            BuiltinFn::Cap => "cap",
            BuiltinFn::Sizeof => "sizeof",
            BuiltinFn::Sizeofself => "sizeofself",
            BuiltinFn::Selfptr => "selfptr",
            BuiltinFn::Selfhasptr => "selfhasptr",
            BuiltinFn::Selftypeeq => "selftypeeq",
            BuiltinFn::Typeptr => "typeptr",
            BuiltinFn::Valid => "valid",
            BuiltinFn::Validkey => "validkey",
            BuiltinFn::Keys => "keys",
            BuiltinFn::Resume => "resume",
            BuiltinFn::Memusage => "memusage",
            BuiltinFn::Exit => "exit",
        }
    }

    /// Decodes a selector from an instruction operand.
    pub fn from_operand(value: u64) -> Option<BuiltinFn> {
        if value <= BuiltinFn::Exit as u64 {
            // Safe by the bound check above; the enum is a dense u8 range.
            Some(unsafe { std::mem::transmute::<u8, BuiltinFn>(value as u8) })
        } else {
            None
        }
    }

    /// True for the built-ins the constant folder can evaluate.
    pub fn foldable(self) -> bool {
        matches!(
            self,
            BuiltinFn::Real
                | BuiltinFn::RealLhs
                | BuiltinFn::Round
                | BuiltinFn::Trunc
                | BuiltinFn::Ceil
                | BuiltinFn::Floor
                | BuiltinFn::Abs
                | BuiltinFn::Fabs
                | BuiltinFn::Sqrt
                | BuiltinFn::Sin
                | BuiltinFn::Cos
                | BuiltinFn::Atan
                | BuiltinFn::Atan2
                | BuiltinFn::Exp
                | BuiltinFn::Log
                | BuiltinFn::Len
                | BuiltinFn::Sizeof
                | BuiltinFn::Sizeofself
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_roundtrip() {
        for b in [BuiltinFn::Printf, BuiltinFn::Make, BuiltinFn::Exit] {
            assert_eq!(BuiltinFn::from_operand(b as u64), Some(b));
        }
        assert_eq!(BuiltinFn::from_operand(10_000), None);
    }

    #[test]
    fn test_foldable() {
        assert!(BuiltinFn::Sqrt.foldable());
        assert!(BuiltinFn::Len.foldable());
        assert!(!BuiltinFn::Printf.foldable());
        assert!(!BuiltinFn::Resume.foldable());
    }
}
