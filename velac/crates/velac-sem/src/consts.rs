//! Compile-time constant evaluation.
//!
//! The parser folds constant expressions while it walks them; the operator
//! semantics here must match what the VM's `UNARY`/`BINARY` handlers do at
//! run time, including the division-by-zero and domain errors.

use velac_lex::Tok;
use velac_util::Ptr;

use crate::builtin::BuiltinFn;
use crate::types::TypeKind;

/// A compile-time value.
#[derive(Clone, Debug, PartialEq)]
pub enum Const {
    Int(i64),
    UInt(u64),
    Real(f64),
    Ptr(Ptr),
    Str(String),
}

impl Const {
    #[inline]
    pub fn int_val(&self) -> i64 {
        match self {
            Const::Int(v) => *v,
            Const::UInt(v) => *v as i64,
            Const::Real(v) => *v as i64,
            Const::Ptr(p) => p.0 as i64,
            Const::Str(_) => 0,
        }
    }

    #[inline]
    pub fn uint_val(&self) -> u64 {
        self.int_val() as u64
    }

    #[inline]
    pub fn real_val(&self) -> f64 {
        match self {
            Const::Real(v) => *v,
            Const::Int(v) => *v as f64,
            Const::UInt(v) => *v as f64,
            _ => 0.0,
        }
    }

    pub fn str_val(&self) -> &str {
        match self {
            Const::Str(s) => s,
            _ => "",
        }
    }

    pub fn bool_val(&self) -> bool {
        self.int_val() != 0
    }
}

/// Applies a unary operator in place.
pub fn unary(arg: &mut Const, op: Tok, kind: TypeKind) -> Result<(), String> {
    if kind.is_real() {
        match op {
            Tok::Minus => *arg = Const::Real(-arg.real_val()),
            _ => return Err("Illegal operator".to_string()),
        }
    } else {
        match op {
            Tok::Minus => *arg = Const::Int(arg.int_val().wrapping_neg()),
            Tok::Not => *arg = Const::Int((arg.int_val() == 0) as i64),
            Tok::Xor => *arg = Const::Int(!arg.int_val()),
            _ => return Err("Illegal operator".to_string()),
        }
    }
    Ok(())
}

/// Applies a binary operator, leaving the result in `lhs`.
pub fn binary(lhs: &mut Const, rhs: &Const, op: Tok, kind: TypeKind) -> Result<(), String> {
    if kind == TypeKind::Str {
        let l = lhs.str_val();
        let r = rhs.str_val();
        let result = match op {
            Tok::Plus => {
                let mut cat = String::with_capacity(l.len() + r.len());
                cat.push_str(l);
                cat.push_str(r);
                Const::Str(cat)
            }
            Tok::EqEq => Const::Int((l == r) as i64),
            Tok::NotEq => Const::Int((l != r) as i64),
            Tok::Greater => Const::Int((l > r) as i64),
            Tok::Less => Const::Int((l < r) as i64),
            Tok::GreaterEq => Const::Int((l >= r) as i64),
            Tok::LessEq => Const::Int((l <= r) as i64),
            _ => return Err("Illegal operator".to_string()),
        };
        *lhs = result;
    } else if kind.is_real() {
        let l = lhs.real_val();
        let r = rhs.real_val();
        let result = match op {
            Tok::Plus => Const::Real(l + r),
            Tok::Minus => Const::Real(l - r),
            Tok::Mul => Const::Real(l * r),
            Tok::Div => {
                if r == 0.0 {
                    return Err("Division by zero".to_string());
                }
                Const::Real(l / r)
            }
            Tok::Mod => {
                if r == 0.0 {
                    return Err("Division by zero".to_string());
                }
                Const::Real(l % r)
            }
            Tok::EqEq => Const::Int((l == r) as i64),
            Tok::NotEq => Const::Int((l != r) as i64),
            Tok::Greater => Const::Int((l > r) as i64),
            Tok::Less => Const::Int((l < r) as i64),
            Tok::GreaterEq => Const::Int((l >= r) as i64),
            Tok::LessEq => Const::Int((l <= r) as i64),
            _ => return Err("Illegal operator".to_string()),
        };
        *lhs = result;
    } else if kind == TypeKind::UInt {
        let l = lhs.uint_val();
        let r = rhs.uint_val();
        let result = match op {
            Tok::Plus => Const::UInt(l.wrapping_add(r)),
            Tok::Minus => Const::UInt(l.wrapping_sub(r)),
            Tok::Mul => Const::UInt(l.wrapping_mul(r)),
            Tok::Div => {
                if r == 0 {
                    return Err("Division by zero".to_string());
                }
                Const::UInt(l / r)
            }
            Tok::Mod => {
                if r == 0 {
                    return Err("Division by zero".to_string());
                }
                Const::UInt(l % r)
            }
            Tok::Shl => Const::UInt(l.wrapping_shl(r as u32)),
            Tok::Shr => Const::UInt(l.wrapping_shr(r as u32)),
            Tok::And => Const::UInt(l & r),
            Tok::Or => Const::UInt(l | r),
            Tok::Xor => Const::UInt(l ^ r),
            Tok::EqEq => Const::Int((l == r) as i64),
            Tok::NotEq => Const::Int((l != r) as i64),
            Tok::Greater => Const::Int((l > r) as i64),
            Tok::Less => Const::Int((l < r) as i64),
            Tok::GreaterEq => Const::Int((l >= r) as i64),
            Tok::LessEq => Const::Int((l <= r) as i64),
            _ => return Err("Illegal operator".to_string()),
        };
        *lhs = result;
    } else {
        let l = lhs.int_val();
        let r = rhs.int_val();
        let result = match op {
            Tok::Plus => Const::Int(l.wrapping_add(r)),
            Tok::Minus => Const::Int(l.wrapping_sub(r)),
            Tok::Mul => Const::Int(l.wrapping_mul(r)),
            Tok::Div => {
                if r == 0 {
                    return Err("Division by zero".to_string());
                }
                if l == i64::MIN && r == -1 {
                    return Err("Overflow of int".to_string());
                }
                Const::Int(l / r)
            }
            Tok::Mod => {
                if r == 0 {
                    return Err("Division by zero".to_string());
                }
                if l == i64::MIN && r == -1 {
                    return Err("Overflow of int".to_string());
                }
                Const::Int(l % r)
            }
            Tok::Shl => Const::Int(l.wrapping_shl(r as u32)),
            Tok::Shr => Const::Int(l.wrapping_shr(r as u32)),
            Tok::And => Const::Int(l & r),
            Tok::Or => Const::Int(l | r),
            Tok::Xor => Const::Int(l ^ r),
            Tok::AndAnd => Const::Int(((l != 0) && (r != 0)) as i64),
            Tok::OrOr => Const::Int(((l != 0) || (r != 0)) as i64),
            Tok::EqEq => Const::Int((l == r) as i64),
            Tok::NotEq => Const::Int((l != r) as i64),
            Tok::Greater => Const::Int((l > r) as i64),
            Tok::Less => Const::Int((l < r) as i64),
            Tok::GreaterEq => Const::Int((l >= r) as i64),
            Tok::LessEq => Const::Int((l <= r) as i64),
            _ => return Err("Illegal operator".to_string()),
        };
        *lhs = result;
    }
    Ok(())
}

/// Folds a built-in call over a constant argument. `arg2` is only used by
/// the two-argument built-ins (`atan2`).
pub fn call_builtin(arg: &mut Const, arg2: Option<&Const>, builtin: BuiltinFn) -> Result<(), String> {
    match builtin {
        BuiltinFn::Real | BuiltinFn::RealLhs => *arg = Const::Real(arg.real_val()),
        BuiltinFn::Round => *arg = Const::Int(arg.real_val().round() as i64),
        BuiltinFn::Trunc => *arg = Const::Int(arg.real_val().trunc() as i64),
        BuiltinFn::Ceil => *arg = Const::Int(arg.real_val().ceil() as i64),
        BuiltinFn::Floor => *arg = Const::Int(arg.real_val().floor() as i64),
        BuiltinFn::Abs => {
            if arg.int_val() == i64::MIN {
                return Err("abs() domain error".to_string());
            }
            *arg = Const::Int(arg.int_val().abs());
        }
        BuiltinFn::Fabs => *arg = Const::Real(arg.real_val().abs()),
        BuiltinFn::Sqrt => {
            if arg.real_val() < 0.0 {
                return Err("sqrt() domain error".to_string());
            }
            *arg = Const::Real(arg.real_val().sqrt());
        }
        BuiltinFn::Sin => *arg = Const::Real(arg.real_val().sin()),
        BuiltinFn::Cos => *arg = Const::Real(arg.real_val().cos()),
        BuiltinFn::Atan => *arg = Const::Real(arg.real_val().atan()),
        BuiltinFn::Atan2 => {
            let x = arg2.expect("atan2 takes two arguments").real_val();
            let y = arg.real_val();
            if x == 0.0 && y == 0.0 {
                return Err("atan2() domain error".to_string());
            }
            *arg = Const::Real(y.atan2(x));
        }
        BuiltinFn::Exp => *arg = Const::Real(arg.real_val().exp()),
        BuiltinFn::Log => {
            if arg.real_val() <= 0.0 {
                return Err("log() domain error".to_string());
            }
            *arg = Const::Real(arg.real_val().ln());
        }
        BuiltinFn::Len => *arg = Const::Int(arg.str_val().len() as i64),
        _ => return Err("Illegal function".to_string()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic() {
        let mut lhs = Const::Int(7);
        binary(&mut lhs, &Const::Int(3), Tok::Mod, TypeKind::Int).unwrap();
        assert_eq!(lhs, Const::Int(1));
    }

    #[test]
    fn test_division_by_zero() {
        let mut lhs = Const::Int(1);
        let err = binary(&mut lhs, &Const::Int(0), Tok::Div, TypeKind::Int).unwrap_err();
        assert_eq!(err, "Division by zero");

        let mut lhs = Const::Real(1.0);
        let err = binary(&mut lhs, &Const::Real(0.0), Tok::Div, TypeKind::Real).unwrap_err();
        assert_eq!(err, "Division by zero");
    }

    #[test]
    fn test_str_concat_and_compare() {
        let mut lhs = Const::Str("ab".to_string());
        binary(&mut lhs, &Const::Str("cd".to_string()), Tok::Plus, TypeKind::Str).unwrap();
        assert_eq!(lhs, Const::Str("abcd".to_string()));

        let mut cmp = Const::Str("abc".to_string());
        binary(&mut cmp, &Const::Str("abd".to_string()), Tok::Less, TypeKind::Str).unwrap();
        assert_eq!(cmp, Const::Int(1));
    }

    #[test]
    fn test_unary() {
        let mut v = Const::Int(5);
        unary(&mut v, Tok::Minus, TypeKind::Int).unwrap();
        assert_eq!(v, Const::Int(-5));

        let mut b = Const::Int(0);
        unary(&mut b, Tok::Not, TypeKind::Bool).unwrap();
        assert_eq!(b, Const::Int(1));

        let mut r = Const::Real(2.5);
        unary(&mut r, Tok::Minus, TypeKind::Real).unwrap();
        assert_eq!(r, Const::Real(-2.5));
    }

    #[test]
    fn test_sqrt_domain_error() {
        let mut v = Const::Real(-1.0);
        let err = call_builtin(&mut v, None, BuiltinFn::Sqrt).unwrap_err();
        assert_eq!(err, "sqrt() domain error");
    }

    #[test]
    fn test_log_is_natural_logarithm() {
        let mut v = Const::Real(std::f64::consts::E);
        call_builtin(&mut v, None, BuiltinFn::Log).unwrap();
        assert!((v.real_val() - 1.0).abs() < 1e-12);

        let mut bad = Const::Real(0.0);
        let err = call_builtin(&mut bad, None, BuiltinFn::Log).unwrap_err();
        assert_eq!(err, "log() domain error");
    }

    #[test]
    fn test_len_of_str() {
        let mut v = Const::Str("hello".to_string());
        call_builtin(&mut v, None, BuiltinFn::Len).unwrap();
        assert_eq!(v, Const::Int(5));
    }

    #[test]
    fn test_atan2() {
        let mut y = Const::Real(1.0);
        call_builtin(&mut y, Some(&Const::Real(1.0)), BuiltinFn::Atan2).unwrap();
        assert!((y.real_val() - std::f64::consts::FRAC_PI_4).abs() < 1e-12);

        let mut bad = Const::Real(0.0);
        let err = call_builtin(&mut bad, Some(&Const::Real(0.0)), BuiltinFn::Atan2).unwrap_err();
        assert_eq!(err, "atan2() domain error");
    }
}
