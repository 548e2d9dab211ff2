//! Value comparison and the `BINARY` operator table.
//!
//! Strings compare by content; static arrays and structs recurse per
//! item/field; dynamic arrays compare lexicographically.

use velac_gen::Slot;
use velac_lex::Tok;
use velac_sem::TypeKind;
use velac_util::{Ptr, RuntimeResult, TypeId};

use crate::objects;
use crate::vm::Vm;

/// Three-way comparison of two values of one type.
pub fn compare_values(vm: &Vm, lhs: Slot, rhs: Slot, type_id: TypeId) -> RuntimeResult<i64> {
    let kind = vm.program.types.kind(type_id);
    match kind {
        TypeKind::Int8
        | TypeKind::Int16
        | TypeKind::Int32
        | TypeKind::Int
        | TypeKind::UInt8
        | TypeKind::UInt16
        | TypeKind::UInt32
        | TypeKind::Bool
        | TypeKind::Char => Ok(lhs.int_val().cmp(&rhs.int_val()) as i64),
        TypeKind::UInt => Ok(lhs.uint_val().cmp(&rhs.uint_val()) as i64),
        TypeKind::Real32 | TypeKind::Real => {
            let diff = lhs.real_val() - rhs.real_val();
            Ok(if diff == 0.0 {
                0
            } else if diff > 0.0 {
                1
            } else {
                -1
            })
        }
        TypeKind::Ptr | TypeKind::WeakPtr | TypeKind::Fiber | TypeKind::Fn => {
            Ok(lhs.uint_val().cmp(&rhs.uint_val()) as i64)
        }
        TypeKind::Str => {
            let l = objects::read_str(vm, lhs.ptr_val())?;
            let r = objects::read_str(vm, rhs.ptr_val())?;
            Ok(l.cmp(&r) as i64)
        }
        TypeKind::Array => {
            let base = vm.program.types.base(type_id);
            let item_size = vm.program.types.size(base).map_err(|e| vm.error(e))?;
            let num_items = vm.program.types.get(type_id).num_items;
            compare_items(vm, lhs.ptr_val(), rhs.ptr_val(), base, item_size, num_items, num_items)
        }
        TypeKind::Struct => {
            let fields: Vec<(i64, TypeId)> = vm
                .program
                .types
                .get(type_id)
                .fields
                .iter()
                .map(|f| (f.offset, f.type_id))
                .collect();
            for (offset, field_type) in fields {
                let field_kind = vm.program.types.kind(field_type);
                let l = vm.load(lhs.ptr_val().add(offset), field_kind)?;
                let r = vm.load(rhs.ptr_val().add(offset), field_kind)?;
                let diff = compare_values(vm, l, r, field_type)?;
                if diff != 0 {
                    return Ok(diff);
                }
            }
            Ok(0)
        }
        TypeKind::DynArray => {
            let larr = lhs.ptr_val();
            let rarr = rhs.ptr_val();
            if larr.is_null() || rarr.is_null() {
                return Err(vm.error("Dynamic array is null"));
            }
            let base = vm.program.types.base(type_id);
            let item_size = vm.program.types.size(base).map_err(|e| vm.error(e))?;
            let llen = objects::dyn_array_len(vm, larr)?;
            let rlen = objects::dyn_array_len(vm, rarr)?;
            let ldata = objects::dyn_array_data(vm, larr)?;
            let rdata = objects::dyn_array_data(vm, rarr)?;
            compare_items(vm, ldata, rdata, base, item_size, llen, rlen)
        }
        _ => Err(vm.error("Illegal type")),
    }
}

fn compare_items(
    vm: &Vm,
    lhs: Ptr,
    rhs: Ptr,
    item_type: TypeId,
    item_size: i64,
    llen: i64,
    rlen: i64,
) -> RuntimeResult<i64> {
    let kind = vm.program.types.kind(item_type);
    let mut i = 0;
    loop {
        if i == llen && i == rlen {
            return Ok(0);
        }
        if i == llen {
            return Ok(-1);
        }
        if i == rlen {
            return Ok(1);
        }
        let l = vm.load(lhs.add(i * item_size), kind)?;
        let r = vm.load(rhs.add(i * item_size), kind)?;
        let diff = compare_values(vm, l, r, item_type)?;
        if diff != 0 {
            return Ok(diff);
        }
        i += 1;
    }
}

fn ordering_result(op: Tok, diff: i64) -> Slot {
    let result = match op {
        Tok::EqEq => diff == 0,
        Tok::NotEq => diff != 0,
        Tok::Greater => diff > 0,
        Tok::Less => diff < 0,
        Tok::GreaterEq => diff >= 0,
        Tok::LessEq => diff <= 0,
        _ => unreachable!("not a comparison"),
    };
    Slot::from_int(result as i64)
}

/// Executes a `BINARY` instruction over popped operands.
pub fn binary_op(vm: &mut Vm, op: Tok, lhs: Slot, rhs: Slot, type_id: TypeId) -> RuntimeResult<Slot> {
    let kind = vm.program.types.kind(type_id);
    match kind {
        TypeKind::Ptr | TypeKind::WeakPtr | TypeKind::Fiber | TypeKind::Fn => {
            if !op.is_comparison() {
                return Err(vm.error("Illegal instruction"));
            }
            Ok(ordering_result(op, compare_values(vm, lhs, rhs, type_id)?))
        }
        TypeKind::Str => match op {
            Tok::Plus | Tok::PlusEq => str_concat(vm, op, lhs.ptr_val(), rhs.ptr_val()),
            _ if op.is_comparison() => Ok(ordering_result(op, compare_values(vm, lhs, rhs, type_id)?)),
            _ => Err(vm.error("Illegal instruction")),
        },
        TypeKind::Array | TypeKind::DynArray | TypeKind::Struct => {
            if !op.is_comparison() {
                return Err(vm.error("Illegal instruction"));
            }
            Ok(ordering_result(op, compare_values(vm, lhs, rhs, type_id)?))
        }
        TypeKind::Real | TypeKind::Real32 => {
            let l = lhs.real_val();
            let r = rhs.real_val();
            Ok(match op {
                Tok::Plus => Slot::from_real(l + r),
                Tok::Minus => Slot::from_real(l - r),
                Tok::Mul => Slot::from_real(l * r),
                Tok::Div => {
                    if r == 0.0 {
                        return Err(vm.error("Division by zero"));
                    }
                    Slot::from_real(l / r)
                }
                Tok::Mod => {
                    if r == 0.0 {
                        return Err(vm.error("Division by zero"));
                    }
                    Slot::from_real(l % r)
                }
                _ if op.is_comparison() => {
                    let diff = if l == r {
                        0
                    } else if l > r {
                        1
                    } else {
                        -1
                    };
                    ordering_result(op, diff)
                }
                _ => return Err(vm.error("Illegal instruction")),
            })
        }
        TypeKind::UInt => {
            let l = lhs.uint_val();
            let r = rhs.uint_val();
            Ok(match op {
                Tok::Plus => Slot::from_uint(l.wrapping_add(r)),
                Tok::Minus => Slot::from_uint(l.wrapping_sub(r)),
                Tok::Mul => Slot::from_uint(l.wrapping_mul(r)),
                Tok::Div => {
                    if r == 0 {
                        return Err(vm.error("Division by zero"));
                    }
                    Slot::from_uint(l / r)
                }
                Tok::Mod => {
                    if r == 0 {
                        return Err(vm.error("Division by zero"));
                    }
                    Slot::from_uint(l % r)
                }
                Tok::Shl => Slot::from_uint(l.wrapping_shl(r as u32)),
                Tok::Shr => Slot::from_uint(l.wrapping_shr(r as u32)),
                Tok::And => Slot::from_uint(l & r),
                Tok::Or => Slot::from_uint(l | r),
                Tok::Xor => Slot::from_uint(l ^ r),
                _ if op.is_comparison() => ordering_result(op, l.cmp(&r) as i64),
                _ => return Err(vm.error("Illegal instruction")),
            })
        }
        _ => {
            // All ordinal types except uint
            let l = lhs.int_val();
            let r = rhs.int_val();
            Ok(match op {
                Tok::Plus => Slot::from_int(l.wrapping_add(r)),
                Tok::Minus => Slot::from_int(l.wrapping_sub(r)),
                Tok::Mul => Slot::from_int(l.wrapping_mul(r)),
                Tok::Div => {
                    if r == 0 {
                        return Err(vm.error("Division by zero"));
                    }
                    if l == i64::MIN && r == -1 {
                        return Err(vm.error("Overflow of int"));
                    }
                    Slot::from_int(l / r)
                }
                Tok::Mod => {
                    if r == 0 {
                        return Err(vm.error("Division by zero"));
                    }
                    if l == i64::MIN && r == -1 {
                        return Err(vm.error("Overflow of int"));
                    }
                    Slot::from_int(l % r)
                }
                Tok::Shl => Slot::from_int(l.wrapping_shl(r as u32)),
                Tok::Shr => Slot::from_int(l.wrapping_shr(r as u32)),
                Tok::And => Slot::from_int(l & r),
                Tok::Or => Slot::from_int(l | r),
                Tok::Xor => Slot::from_int(l ^ r),
                Tok::AndAnd => Slot::from_int(((l != 0) && (r != 0)) as i64),
                Tok::OrOr => Slot::from_int(((l != 0) || (r != 0)) as i64),
                _ if op.is_comparison() => ordering_result(op, l.cmp(&r) as i64),
                _ => return Err(vm.error("Illegal instruction")),
            })
        }
    }
}

/// String `+` / `+=`. `+=` reuses the left operand's buffer when its
/// capacity suffices; otherwise a fresh string is allocated.
fn str_concat(vm: &mut Vm, op: Tok, lhs: Ptr, rhs: Ptr) -> RuntimeResult<Slot> {
    let lhs_len = objects::str_len(vm, lhs)?;
    let rhs_len = objects::str_len(vm, rhs)?;
    let rhs_bytes = objects::read_str(vm, rhs)?;

    let in_place = op == Tok::PlusEq && !lhs.is_null() && objects::str_capacity(vm, lhs)? >= lhs_len + rhs_len + 1;

    let buf = if in_place {
        // The result is one more reference to the same chunk.
        vm.change_ref_cnt_typed(Slot::from_ptr(lhs), vm.program.str_type, 1)?;
        vm.write_i64(lhs.add(-16), lhs_len + rhs_len)?;
        lhs
    } else {
        let lhs_bytes = objects::read_str(vm, lhs)?;
        let buf = objects::alloc_str(vm, lhs_len + rhs_len)?;
        vm.write_bytes(buf, &lhs_bytes)?;
        buf
    };
    vm.write_bytes(buf.add(lhs_len), &rhs_bytes)?;
    vm.write_bytes(buf.add(lhs_len + rhs_len), &[0])?;
    Ok(Slot::from_ptr(buf))
}
