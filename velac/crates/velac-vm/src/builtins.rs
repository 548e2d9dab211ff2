//! The built-in runtime.
//!
//! Built-ins share the VM stack: the generator pushes the arguments in
//! declaration order, with a result-destination pointer last for the
//! built-ins that produce structured values. The conventions mirror the
//! instruction stream the parser emits; both sides must agree exactly.

use velac_gen::{Instruction, Register, Slot};
use velac_sem::{BuiltinFn, TypeKind};
use velac_util::{Ptr, RuntimeResult, TypeId};

use crate::compare;
use crate::fmt;
use crate::objects;
use crate::vm::Vm;

/// Executes one `CALL_BUILTIN`. Returns `true` to continue dispatching.
pub fn dispatch(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<bool> {
    let fiber_id = vm.cur;
    let ip0 = vm.fibers[fiber_id].ip;
    let builtin = BuiltinFn::from_operand(instr.operand.uint_val())
        .ok_or_else(|| vm.error("Illegal instruction"))?;

    match builtin {
        BuiltinFn::Printf
        | BuiltinFn::Fprintf
        | BuiltinFn::Sprintf
        | BuiltinFn::Scanf
        | BuiltinFn::Fscanf
        | BuiltinFn::Sscanf => fmt::io_builtin(vm, builtin, instr.type_id)?,

        BuiltinFn::Real | BuiltinFn::RealLhs => {
            let depth = if builtin == BuiltinFn::RealLhs { 2 } else { 1 };
            let fiber = vm.fiber_mut();
            let index = fiber.top - depth;
            let slot = fiber.slot(index);
            let converted = if instr.type_kind == TypeKind::UInt {
                Slot::from_real(slot.uint_val() as f64)
            } else {
                Slot::from_real(slot.int_val() as f64)
            };
            fiber.set_slot(index, converted);
        }
        BuiltinFn::Round => map_top(vm, |s| Slot::from_int(s.real_val().round() as i64)),
        BuiltinFn::Trunc => map_top(vm, |s| Slot::from_int(s.real_val().trunc() as i64)),
        BuiltinFn::Ceil => map_top(vm, |s| Slot::from_int(s.real_val().ceil() as i64)),
        BuiltinFn::Floor => map_top(vm, |s| Slot::from_int(s.real_val().floor() as i64)),
        BuiltinFn::Abs => {
            let value = vm.fiber().top_slot().int_val();
            if value == i64::MIN {
                return Err(vm.error("abs() domain error"));
            }
            vm.fiber_mut().set_top_slot(Slot::from_int(value.abs()));
        }
        BuiltinFn::Fabs => map_top(vm, |s| Slot::from_real(s.real_val().abs())),
        BuiltinFn::Sqrt => {
            let value = vm.fiber().top_slot().real_val();
            if value < 0.0 {
                return Err(vm.error("sqrt() domain error"));
            }
            vm.fiber_mut().set_top_slot(Slot::from_real(value.sqrt()));
        }
        BuiltinFn::Sin => map_top(vm, |s| Slot::from_real(s.real_val().sin())),
        BuiltinFn::Cos => map_top(vm, |s| Slot::from_real(s.real_val().cos())),
        BuiltinFn::Atan => map_top(vm, |s| Slot::from_real(s.real_val().atan())),
        BuiltinFn::Atan2 => {
            let x = vm.pop().real_val();
            let y = vm.fiber().top_slot().real_val();
            if x == 0.0 && y == 0.0 {
                return Err(vm.error("atan2() domain error"));
            }
            vm.fiber_mut().set_top_slot(Slot::from_real(y.atan2(x)));
        }
        BuiltinFn::Exp => map_top(vm, |s| Slot::from_real(s.real_val().exp())),
        BuiltinFn::Log => {
            let value = vm.fiber().top_slot().real_val();
            if value <= 0.0 {
                return Err(vm.error("log() domain error"));
            }
            vm.fiber_mut().set_top_slot(Slot::from_real(value.ln()));
        }

        BuiltinFn::New => {
            let size = vm.pop().int_val();
            // Dynamic arrays are traced through their data chunk, so the
            // holder chunk stays untyped.
            let chunk_type = instr.type_id.filter(|&t| vm.program.types.kind(t) != TypeKind::DynArray);
            let ip = vm.fiber().ip;
            let chunk = vm
                .heap
                .alloc(size, chunk_type, None, ip)
                .map_err(|e| vm.error(e.to_string()))?;
            vm.push(Slot::from_ptr(chunk))?;
        }
        BuiltinFn::Make => builtin_make(vm, instr)?,
        BuiltinFn::Makefromarr => {
            let result = vm.pop().ptr_val();
            let len = vm.pop().int_val();
            let src = vm.pop().ptr_val();
            let type_id = instr.type_id.expect("make carries the result type");
            objects::alloc_dyn_array(vm, result, type_id, len)?;
            let item_size = objects::dyn_array_item_size(vm, result)?;
            let data = objects::dyn_array_data(vm, result)?;
            let bytes = vm.read_vec(src, (len * item_size) as usize)?;
            vm.write_bytes(data, &bytes)?;
            let base = vm.program.types.base(type_id);
            vm.change_ref_cnt_items(data, base, len, 1)?;
            vm.push(Slot::from_ptr(result))?;
        }
        BuiltinFn::Makefromstr => {
            let result = vm.pop().ptr_val();
            let src = vm.pop().ptr_val();
            let type_id = instr.type_id.expect("make carries the result type");
            let len = objects::str_len(vm, src)?;
            objects::alloc_dyn_array(vm, result, type_id, len)?;
            let data = objects::dyn_array_data(vm, result)?;
            let bytes = objects::read_str(vm, src)?;
            vm.write_bytes(data, &bytes)?;
            vm.push(Slot::from_ptr(result))?;
        }
        BuiltinFn::Maketoarr => {
            let dest = vm.pop().ptr_val();
            let src = vm.pop().ptr_val();
            if src.is_null() {
                return Err(vm.error("Dynamic array is null"));
            }
            let type_id = instr.type_id.expect("make carries the result type");
            let dest_size = vm.program.types.size(type_id).map_err(|e| vm.error(e))?;
            vm.write_bytes(dest, &vec![0u8; dest_size as usize])?;
            let data = objects::dyn_array_data(vm, src)?;
            if !data.is_null() {
                let len = objects::dyn_array_len(vm, src)?;
                if len > vm.program.types.get(type_id).num_items {
                    return Err(vm.error("Dynamic array is too long"));
                }
                let item_size = objects::dyn_array_item_size(vm, src)?;
                let bytes = vm.read_vec(data, (len * item_size) as usize)?;
                vm.write_bytes(dest, &bytes)?;
                vm.change_ref_cnt_typed(Slot::from_ptr(dest), type_id, 1)?;
            }
            vm.push(Slot::from_ptr(dest))?;
        }
        BuiltinFn::Maketostr => {
            let result = if instr.type_kind == TypeKind::Char {
                let ch = vm.pop().int_val() as u8;
                if ch == 0 {
                    objects::empty_sentinel()
                } else {
                    objects::make_str(vm, &[ch])?
                }
            } else {
                let src = vm.pop().ptr_val();
                if src.is_null() {
                    return Err(vm.error("Dynamic array is null"));
                }
                let data = objects::dyn_array_data(vm, src)?;
                if data.is_null() {
                    objects::empty_sentinel()
                } else {
                    let max_len = objects::dyn_array_len(vm, src)?;
                    let bytes = vm.read_vec(data, max_len as usize)?;
                    let len = bytes.iter().position(|&b| b == 0).map_or(max_len as usize, |p| p);
                    objects::make_str(vm, &bytes[..len])?
                }
            };
            vm.push(Slot::from_ptr(result))?;
        }
        BuiltinFn::Copy => builtin_copy(vm, instr)?,
        BuiltinFn::Append => builtin_append(vm, instr)?,
        BuiltinFn::Insert => builtin_insert(vm, instr)?,
        BuiltinFn::Delete => {
            if instr.type_kind == TypeKind::DynArray {
                builtin_delete_dyn_array(vm, instr)?
            } else {
                builtin_delete_map(vm, instr)?
            }
        }
        BuiltinFn::Slice => builtin_slice(vm, instr)?,
        BuiltinFn::Sort => builtin_sort(vm, instr)?,
        BuiltinFn::Sortfast => builtin_sortfast(vm, instr)?,

        BuiltinFn::Len => {
            let value = vm.fiber().top_slot().ptr_val();
            let len = match instr.type_kind {
                TypeKind::DynArray => {
                    if value.is_null() {
                        return Err(vm.error("Dynamic array is null"));
                    }
                    objects::dyn_array_len(vm, value)?
                }
                TypeKind::Str => objects::str_len(vm, value)?,
                TypeKind::Map => {
                    if value.is_null() {
                        return Err(vm.error("Map is null"));
                    }
                    objects::map_len(vm, value)?
                }
                _ => return Err(vm.error("Illegal type")),
            };
            vm.fiber_mut().set_top_slot(Slot::from_int(len));
        }
        BuiltinFn::Cap => {
            let value = vm.fiber().top_slot().ptr_val();
            if value.is_null() {
                return Err(vm.error("Dynamic array is null"));
            }
            let capacity = objects::dyn_array_capacity(vm, value)?;
            vm.fiber_mut().set_top_slot(Slot::from_int(capacity));
        }
        BuiltinFn::Sizeof | BuiltinFn::Typeptr => return Err(vm.error("Illegal instruction")),
        BuiltinFn::Sizeofself => {
            let iface = vm.fiber().top_slot().ptr_val();
            if iface.is_null() {
                return Err(vm.error("Interface is null"));
            }
            let self_type = objects::slot_to_type(Slot(vm.read_u64(iface.add(8))?));
            let size = match self_type {
                Some(t) => {
                    let base = vm.program.types.base(t);
                    vm.program.types.size(base).map_err(|e| vm.error(e))?
                }
                None => 0,
            };
            vm.fiber_mut().set_top_slot(Slot::from_int(size));
        }
        BuiltinFn::Selfptr => {
            let iface = vm.fiber().top_slot().ptr_val();
            if iface.is_null() {
                return Err(vm.error("Interface is null"));
            }
            let self_ptr = Ptr(vm.read_u64(iface)?);
            vm.fiber_mut().set_top_slot(Slot::from_ptr(self_ptr));
        }
        BuiltinFn::Selfhasptr => {
            let iface = vm.fiber().top_slot().ptr_val();
            if iface.is_null() {
                return Err(vm.error("Interface is null"));
            }
            let self_type = objects::slot_to_type(Slot(vm.read_u64(iface.add(8))?));
            let has_ptr = match self_type {
                Some(t) => {
                    let base = vm.program.types.base(t);
                    type_has_ptr(vm, base, &mut Vec::new())
                }
                None => false,
            };
            vm.fiber_mut().set_top_slot(Slot::from_int(has_ptr as i64));
        }
        BuiltinFn::Selftypeeq => {
            let right = vm.pop().ptr_val();
            let left = vm.fiber().top_slot().ptr_val();
            if left.is_null() || right.is_null() {
                return Err(vm.error("Interface is null"));
            }
            let lt = objects::slot_to_type(Slot(vm.read_u64(left.add(8))?));
            let rt = objects::slot_to_type(Slot(vm.read_u64(right.add(8))?));
            let eq = match (lt, rt) {
                (Some(lt), Some(rt)) => {
                    let lb = vm.program.types.base(lt);
                    let rb = vm.program.types.base(rt);
                    vm.program.types.equivalent(lb, rb)
                }
                _ => false,
            };
            vm.fiber_mut().set_top_slot(Slot::from_int(eq as i64));
        }
        BuiltinFn::Valid => builtin_valid(vm, instr)?,
        BuiltinFn::Validkey => {
            let key = vm.pop();
            let map = vm.pop().ptr_val();
            if map.is_null() {
                return Err(vm.error("Map is null"));
            }
            let map_type = instr.type_id.expect("map built-in carries the map type");
            let valid = if vm.read_ptr(map.add(8))?.is_null() {
                false
            } else {
                let node = objects::map_find_node(vm, map, map_type, key, false)?;
                !node.is_null() && !vm.read_ptr(node.add(objects::NODE_DATA))?.is_null()
            };
            vm.push(Slot::from_int(valid as i64))?;
        }
        BuiltinFn::Keys => {
            let result = vm.pop().ptr_val();
            let map = vm.pop().ptr_val();
            if map.is_null() {
                return Err(vm.error("Map is null"));
            }
            let result_type = instr.type_id.expect("keys carries the result type");
            let map_type =
                objects::slot_to_type(Slot(vm.read_u64(map)?)).ok_or_else(|| vm.error("Map is null"))?;
            let len = objects::map_len(vm, map)?;
            objects::alloc_dyn_array(vm, result, result_type, len)?;
            let mut keys = Vec::new();
            objects::map_keys(vm, map, map_type, &mut keys)?;
            let key_type = vm.program.types.map_key(map_type);
            let key_kind = vm.program.types.kind(key_type);
            let key_size = vm.program.types.size(key_type).map_err(|e| vm.error(e))?;
            let data = objects::dyn_array_data(vm, result)?;
            for (i, key) in keys.iter().enumerate() {
                vm.store(data.add(i as i64 * key_size), key_kind, *key, key_size)?;
            }
            vm.change_ref_cnt_items(data, key_type, len, 1)?;
            vm.push(Slot::from_ptr(result))?;
        }

        BuiltinFn::Resume => {
            let child = vm.pop().ptr_val();
            if !child.is_null() {
                let id = vm.read_u64(child)? as usize;
                if vm.fibers.get(id).is_some_and(|f| f.alive) {
                    vm.fibers[fiber_id].ip = ip0 + 1;
                    vm.cur = id;
                    return Ok(true);
                }
            } else if let Some(parent) = vm.fiber().parent {
                vm.fibers[fiber_id].ip = ip0 + 1;
                vm.cur = parent;
                return Ok(true);
            }
        }
        BuiltinFn::Memusage => {
            let usage = vm.heap.mem_usage();
            vm.push(Slot::from_int(usage))?;
        }
        BuiltinFn::Exit => {
            let msg_ptr = vm.pop().ptr_val();
            let code = vm.fiber().top_slot().int_val();
            let msg = String::from_utf8_lossy(&objects::read_str(vm, msg_ptr)?).into_owned();
            vm.fiber_mut().alive = false;
            vm.fibers[0].alive = false;
            return Err(vm.error(msg).with_code(code));
        }
    }

    vm.fibers[fiber_id].ip = ip0 + 1;
    Ok(true)
}

fn map_top(vm: &mut Vm, f: impl FnOnce(Slot) -> Slot) {
    let top = vm.fiber().top_slot();
    vm.fiber_mut().set_top_slot(f(top));
}

fn builtin_make(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    match instr.type_kind {
        TypeKind::DynArray => {
            let result = vm.pop().ptr_val();
            let len = vm.pop().int_val();
            let type_id = instr.type_id.expect("make carries the result type");
            objects::alloc_dyn_array(vm, result, type_id, len)?;
            vm.push(Slot::from_ptr(result))
        }
        TypeKind::Map => {
            let result = vm.pop().ptr_val();
            let type_id = instr.type_id.expect("make carries the result type");
            objects::alloc_map(vm, result, type_id)?;
            vm.push(Slot::from_ptr(result))
        }
        TypeKind::Fiber => {
            let arg = vm.pop().ptr_val();
            let closure = vm.pop().ptr_val();
            if closure.is_null() {
                return Err(vm.error("Called function is not defined"));
            }
            let arg_type = instr.type_id.expect("fiber make carries the argument type");
            let chunk = objects::spawn_fiber(vm, closure, arg, arg_type)?;
            vm.push(Slot::from_ptr(chunk))
        }
        _ => Err(vm.error("Illegal type")),
    }
}

fn builtin_copy(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let result = vm.pop().ptr_val();
    let src = vm.pop().ptr_val();
    if instr.type_kind == TypeKind::DynArray {
        if src.is_null() {
            return Err(vm.error("Dynamic array is null"));
        }
        let data = objects::dyn_array_data(vm, src)?;
        if data.is_null() {
            let bytes = vm.read_vec(src, 24)?;
            vm.write_bytes(result, &bytes)?;
        } else {
            let type_id = objects::slot_to_type(Slot(vm.read_u64(src)?))
                .ok_or_else(|| vm.error("Dynamic array is null"))?;
            let len = objects::dyn_array_len(vm, src)?;
            objects::alloc_dyn_array(vm, result, type_id, len)?;
            let item_size = objects::dyn_array_item_size(vm, src)?;
            let dest_data = objects::dyn_array_data(vm, result)?;
            let bytes = vm.read_vec(data, (len * item_size) as usize)?;
            vm.write_bytes(dest_data, &bytes)?;
            let base = vm.program.types.base(type_id);
            vm.change_ref_cnt_items(dest_data, base, len, 1)?;
        }
    } else {
        if src.is_null() {
            return Err(vm.error("Map is null"));
        }
        let root = vm.read_ptr(src.add(8))?;
        if root.is_null() {
            let bytes = vm.read_vec(src, 16)?;
            vm.write_bytes(result, &bytes)?;
        } else {
            let map_type =
                objects::slot_to_type(Slot(vm.read_u64(src)?)).ok_or_else(|| vm.error("Map is null"))?;
            let new_root = copy_map_node(vm, root, map_type)?;
            vm.write_bytes(result, &Slot(vm.read_u64(src)?).0.to_le_bytes())?;
            vm.write_bytes(result.add(8), &new_root.0.to_le_bytes())?;
        }
    }
    vm.push(Slot::from_ptr(result))
}

fn copy_map_node(vm: &mut Vm, node: Ptr, map_type: TypeId) -> RuntimeResult<Ptr> {
    let node_type = vm.program.types.base(map_type);
    let node_size = vm.program.types.size(node_type).map_err(|e| vm.error(e))?;
    let ip = vm.fiber().ip;
    let result = vm
        .heap
        .alloc(node_size, Some(node_type), None, ip)
        .map_err(|e| vm.error(e.to_string()))?;

    let len = vm.read_i64(node.add(objects::NODE_LEN))?;
    vm.write_i64(result.add(objects::NODE_LEN), len)?;

    let key_ptr = vm.read_ptr(node.add(objects::NODE_KEY))?;
    if !key_ptr.is_null() {
        let key_type = vm.program.types.map_key(map_type);
        let key_kind = vm.program.types.kind(key_type);
        let key_size = vm.program.types.size(key_type).map_err(|e| vm.error(e))?;
        let chunk_type = if key_kind == TypeKind::DynArray { None } else { Some(key_type) };
        let new_key = vm
            .heap
            .alloc(key_size, chunk_type, None, ip)
            .map_err(|e| vm.error(e.to_string()))?;
        let key = vm.load(key_ptr, key_kind)?;
        if key_kind.is_garbage_collected() {
            vm.change_ref_cnt_typed(key, key_type, 1)?;
        }
        vm.store(new_key, key_kind, key, key_size)?;
        vm.write_bytes(result.add(objects::NODE_KEY), &new_key.0.to_le_bytes())?;
    }

    let data_ptr = vm.read_ptr(node.add(objects::NODE_DATA))?;
    if !data_ptr.is_null() {
        let item_type = vm.program.types.map_item(map_type);
        let item_kind = vm.program.types.kind(item_type);
        let item_size = vm.program.types.size(item_type).map_err(|e| vm.error(e))?;
        let chunk_type = if item_kind == TypeKind::DynArray { None } else { Some(item_type) };
        let new_data = vm
            .heap
            .alloc(item_size, chunk_type, None, ip)
            .map_err(|e| vm.error(e.to_string()))?;
        let item = vm.load(data_ptr, item_kind)?;
        if item_kind.is_garbage_collected() {
            vm.change_ref_cnt_typed(item, item_type, 1)?;
        }
        vm.store(new_data, item_kind, item, item_size)?;
        vm.write_bytes(result.add(objects::NODE_DATA), &new_data.0.to_le_bytes())?;
    }

    let left = vm.read_ptr(node.add(objects::NODE_LEFT))?;
    if !left.is_null() {
        let new_left = copy_map_node(vm, left, map_type)?;
        vm.write_bytes(result.add(objects::NODE_LEFT), &new_left.0.to_le_bytes())?;
    }
    let right = vm.read_ptr(node.add(objects::NODE_RIGHT))?;
    if !right.is_null() {
        let new_right = copy_map_node(vm, right, map_type)?;
        vm.write_bytes(result.add(objects::NODE_RIGHT), &new_right.0.to_le_bytes())?;
    }
    Ok(result)
}

fn builtin_append(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let result = vm.pop().ptr_val();
    let single = vm.pop().bool_val();
    let item = vm.pop().ptr_val();
    let array = vm.pop().ptr_val();
    let type_id = instr.type_id.expect("append carries the array type");
    if array.is_null() {
        return Err(vm.error("Dynamic array is null"));
    }
    if objects::dyn_array_data(vm, array)?.is_null() {
        objects::empty_dyn_array(vm, array, type_id)?;
    }
    let item_size = objects::dyn_array_item_size(vm, array)?;
    let len = objects::dyn_array_len(vm, array)?;

    let (rhs, rhs_len) = if single {
        (item, 1)
    } else {
        if item.is_null() {
            return Err(vm.error("Dynamic array is null"));
        }
        if objects::dyn_array_data(vm, item)?.is_null() {
            objects::empty_dyn_array(vm, item, type_id)?;
        }
        (objects::dyn_array_data(vm, item)?, objects::dyn_array_len(vm, item)?)
    };

    let new_len = len + rhs_len;
    let base = vm.program.types.base(type_id);

    if new_len <= objects::dyn_array_capacity(vm, array)? {
        // Capacity suffices: the result shares the existing storage.
        vm.change_ref_cnt_typed(Slot::from_ptr(array), type_id, 1)?;
        let bytes = vm.read_vec(array, 24)?;
        vm.write_bytes(result, &bytes)?;
        let data = objects::dyn_array_data(vm, result)?;
        let appended = vm.read_vec(rhs, (rhs_len * item_size) as usize)?;
        vm.write_bytes(data.add(len * item_size), &appended)?;
        vm.change_ref_cnt_items(data.add(len * item_size), base, rhs_len, 1)?;
        vm.write_i64(data.add(-16), new_len)?;
    } else {
        objects::alloc_dyn_array(vm, result, type_id, new_len)?;
        let data = objects::dyn_array_data(vm, result)?;
        let old_data = objects::dyn_array_data(vm, array)?;
        let old = vm.read_vec(old_data, (len * item_size) as usize)?;
        vm.write_bytes(data, &old)?;
        let appended = vm.read_vec(rhs, (rhs_len * item_size) as usize)?;
        vm.write_bytes(data.add(len * item_size), &appended)?;
        vm.change_ref_cnt_items(data, base, new_len, 1)?;
    }
    vm.push(Slot::from_ptr(result))
}

fn builtin_insert(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let result = vm.pop().ptr_val();
    let item = vm.pop().ptr_val();
    let index = vm.pop().int_val();
    let array = vm.pop().ptr_val();
    let type_id = instr.type_id.expect("insert carries the array type");
    if array.is_null() {
        return Err(vm.error("Dynamic array is null"));
    }
    if objects::dyn_array_data(vm, array)?.is_null() {
        objects::empty_dyn_array(vm, array, type_id)?;
    }
    let item_size = objects::dyn_array_item_size(vm, array)?;
    let len = objects::dyn_array_len(vm, array)?;
    if index < 0 || index > len {
        return Err(vm.error(format!("Index {index} is out of range 0...{len}")));
    }
    let base = vm.program.types.base(type_id);
    let item_bytes = vm.read_vec(item, item_size as usize)?;

    if len + 1 <= objects::dyn_array_capacity(vm, array)? {
        vm.change_ref_cnt_typed(Slot::from_ptr(array), type_id, 1)?;
        let header = vm.read_vec(array, 24)?;
        vm.write_bytes(result, &header)?;
        let data = objects::dyn_array_data(vm, result)?;
        let tail = vm.read_vec(data.add(index * item_size), ((len - index) * item_size) as usize)?;
        vm.write_bytes(data.add((index + 1) * item_size), &tail)?;
        vm.write_bytes(data.add(index * item_size), &item_bytes)?;
        vm.change_ref_cnt_items(data.add(index * item_size), base, 1, 1)?;
        vm.write_i64(data.add(-16), len + 1)?;
    } else {
        objects::alloc_dyn_array(vm, result, type_id, len + 1)?;
        let data = objects::dyn_array_data(vm, result)?;
        let old_data = objects::dyn_array_data(vm, array)?;
        let head = vm.read_vec(old_data, (index * item_size) as usize)?;
        vm.write_bytes(data, &head)?;
        let tail = vm.read_vec(old_data.add(index * item_size), ((len - index) * item_size) as usize)?;
        vm.write_bytes(data.add((index + 1) * item_size), &tail)?;
        vm.write_bytes(data.add(index * item_size), &item_bytes)?;
        vm.change_ref_cnt_items(data, base, len + 1, 1)?;
    }
    vm.push(Slot::from_ptr(result))
}

fn builtin_delete_dyn_array(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let result = vm.pop().ptr_val();
    let index = vm.pop().int_val();
    let array = vm.pop().ptr_val();
    let type_id = instr.type_id.expect("delete carries the array type");
    if array.is_null() || objects::dyn_array_data(vm, array)?.is_null() {
        return Err(vm.error("Dynamic array is null"));
    }
    let item_size = objects::dyn_array_item_size(vm, array)?;
    let len = objects::dyn_array_len(vm, array)?;
    if index < 0 || index > len - 1 {
        return Err(vm.error(format!("Index {index} is out of range 0...{}", len - 1)));
    }
    vm.change_ref_cnt_typed(Slot::from_ptr(array), type_id, 1)?;
    let header = vm.read_vec(array, 24)?;
    vm.write_bytes(result, &header)?;

    let base = vm.program.types.base(type_id);
    let data = objects::dyn_array_data(vm, result)?;
    vm.change_ref_cnt_items(data.add(index * item_size), base, 1, -1)?;
    let tail = vm.read_vec(
        data.add((index + 1) * item_size),
        ((len - index - 1) * item_size) as usize,
    )?;
    vm.write_bytes(data.add(index * item_size), &tail)?;
    vm.write_i64(data.add(-16), len - 1)?;
    vm.push(Slot::from_ptr(result))
}

fn builtin_delete_map(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let result = vm.pop().ptr_val();
    let key = vm.pop();
    let map = vm.pop().ptr_val();
    let map_type = instr.type_id.expect("delete carries the map type");
    if map.is_null() || vm.read_ptr(map.add(8))?.is_null() {
        return Err(vm.error("Map is null"));
    }
    let (cell, node) = objects::map_find_cell(vm, map, map_type, key, false)?;
    if !node.is_null() {
        let left = vm.read_ptr(node.add(objects::NODE_LEFT))?;
        let right = vm.read_ptr(node.add(objects::NODE_RIGHT))?;
        let replacement = match (left.is_null(), right.is_null()) {
            (false, true) => left,
            (true, false) => right,
            (true, true) => Ptr::NULL,
            (false, false) => {
                // Replace with the in-order successor.
                let mut successor_cell = node.add(objects::NODE_RIGHT);
                let mut successor = right;
                loop {
                    let next = vm.read_ptr(successor.add(objects::NODE_LEFT))?;
                    if next.is_null() {
                        break;
                    }
                    successor_cell = successor.add(objects::NODE_LEFT);
                    successor = next;
                }
                let successor_right = vm.read_ptr(successor.add(objects::NODE_RIGHT))?;
                vm.write_bytes(successor_cell, &successor_right.0.to_le_bytes())?;
                vm.write_bytes(successor.add(objects::NODE_LEFT), &left.0.to_le_bytes())?;
                let node_right = vm.read_ptr(node.add(objects::NODE_RIGHT))?;
                vm.write_bytes(successor.add(objects::NODE_RIGHT), &node_right.0.to_le_bytes())?;
                successor
            }
        };
        vm.write_bytes(cell, &replacement.0.to_le_bytes())?;
        vm.write_bytes(node.add(objects::NODE_LEFT), &0u64.to_le_bytes())?;
        vm.write_bytes(node.add(objects::NODE_RIGHT), &0u64.to_le_bytes())?;
        let node_ptr_type = vm.program.types.map_node_ptr(map_type);
        vm.change_ref_cnt_typed(Slot::from_ptr(node), node_ptr_type, -1)?;

        let root = vm.read_ptr(map.add(8))?;
        let len = vm.read_i64(root.add(objects::NODE_LEN))?;
        if len - 1 < 0 {
            return Err(vm.error("Map length is negative"));
        }
        vm.write_i64(root.add(objects::NODE_LEN), len - 1)?;
    }

    let root = vm.read_ptr(map.add(8))?;
    let node_ptr_type = vm.program.types.map_node_ptr(map_type);
    vm.change_ref_cnt_typed(Slot::from_ptr(root), node_ptr_type, 1)?;
    let header = vm.read_vec(map, 16)?;
    vm.write_bytes(result, &header)?;
    vm.push(Slot::from_ptr(result))
}

fn builtin_slice(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let result = vm.pop().ptr_val();
    let mut end = vm.pop().int_val();
    let start = vm.pop().int_val();
    let arg = vm.pop().ptr_val();
    let type_id = instr.type_id;

    let len = if result.is_null() {
        objects::str_len(vm, arg)?
    } else {
        if arg.is_null() {
            return Err(vm.error("Dynamic array is null"));
        }
        if objects::dyn_array_data(vm, arg)?.is_null() {
            let t = type_id.expect("slice carries the array type");
            objects::empty_dyn_array(vm, arg, t)?;
        }
        objects::dyn_array_len(vm, arg)?
    };

    // A missing end index means the end of the array; a negative one is
    // counted from the end.
    if end == i64::MIN {
        end = len;
    }
    if end < 0 {
        end += len;
    }
    if start < 0 {
        return Err(vm.error(format!("Index {start} is out of range 0...{len}")));
    }
    if end < start || end > len {
        return Err(vm.error(format!("Index {end} is out of range {start}...{len}")));
    }

    if result.is_null() {
        let bytes = objects::read_str(vm, arg)?;
        let substr = objects::make_str(vm, &bytes[start as usize..end as usize])?;
        vm.push(Slot::from_ptr(substr))
    } else {
        let t = type_id.expect("slice carries the array type");
        let item_size = objects::dyn_array_item_size(vm, arg)?;
        objects::alloc_dyn_array(vm, result, t, end - start)?;
        let src = objects::dyn_array_data(vm, arg)?;
        let dest = objects::dyn_array_data(vm, result)?;
        let bytes = vm.read_vec(src.add(start * item_size), ((end - start) * item_size) as usize)?;
        vm.write_bytes(dest, &bytes)?;
        let base = vm.program.types.base(t);
        vm.change_ref_cnt_items(dest, base, end - start, 1)?;
        vm.push(Slot::from_ptr(result))
    }
}

fn builtin_sort(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let compare_closure = vm.pop().ptr_val();
    let array = vm.pop().ptr_val();
    if array.is_null() {
        return Err(vm.error("Dynamic array is null"));
    }
    if compare_closure.is_null() {
        return Err(vm.error("Called function is not defined"));
    }
    let entry = vm.read_i64(compare_closure)?;
    if entry <= 0 {
        return Err(vm.error("Called function is not defined"));
    }
    let closure_type = instr.type_id.expect("sort carries the comparator type");
    let sig = vm.program.types.closure_sig(closure_type);
    let a_type = sig.params[1].type_id;
    let b_type = sig.params[2].type_id;

    let data = objects::dyn_array_data(vm, array)?;
    if data.is_null() {
        return Ok(());
    }
    let len = objects::dyn_array_len(vm, array)?;
    let item_size = objects::dyn_array_item_size(vm, array)?;
    if len <= 1 {
        return Ok(());
    }
    let upv_self = Slot(vm.read_u64(compare_closure.add(8))?);
    let upv_type = Slot(vm.read_u64(compare_closure.add(16))?);

    quicksort(vm, data, item_size, 0, len - 1, &mut |vm, a, b| {
        // Re-enter the dispatch loop with the comparator frame set up the
        // same way an ordinary indirect call would.
        if let Some(t) = objects::slot_to_type(upv_type) {
            vm.change_ref_cnt_typed(upv_self, t, 1)?;
        }
        vm.change_ref_cnt_typed(Slot::from_ptr(a), a_type, 1)?;
        vm.change_ref_cnt_typed(Slot::from_ptr(b), b_type, 1)?;
        vm.push(upv_self)?;
        vm.push(upv_type)?;
        vm.push(Slot::from_ptr(a))?;
        vm.push(Slot::from_ptr(b))?;
        vm.call_reentrant(entry as usize)?;
        Ok(vm.fiber().reg[Register::Result as usize].int_val())
    })
}

fn builtin_sortfast(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let offset = vm.pop().int_val();
    let ascending = vm.pop().bool_val();
    let array = vm.pop().ptr_val();
    if array.is_null() {
        return Err(vm.error("Dynamic array is null"));
    }
    let item_type = instr.type_id.expect("sortfast carries the item type");
    let item_kind = vm.program.types.kind(item_type);
    let sign = if ascending { 1 } else { -1 };

    let data = objects::dyn_array_data(vm, array)?;
    if data.is_null() {
        return Ok(());
    }
    let len = objects::dyn_array_len(vm, array)?;
    let item_size = objects::dyn_array_item_size(vm, array)?;
    if len <= 1 {
        return Ok(());
    }

    quicksort(vm, data, item_size, 0, len - 1, &mut |vm, a, b| {
        let lhs = vm.load(a.add(offset), item_kind)?;
        let rhs = vm.load(b.add(offset), item_kind)?;
        let diff = compare::compare_values(vm, lhs, rhs, item_type)?;
        Ok(diff * sign)
    })
}

/// In-place quicksort over fixed-size byte blocks with a Lomuto-style
/// partition; the comparator may re-enter the VM.
fn quicksort(
    vm: &mut Vm,
    data: Ptr,
    item_size: i64,
    lo: i64,
    hi: i64,
    cmp: &mut dyn FnMut(&mut Vm, Ptr, Ptr) -> RuntimeResult<i64>,
) -> RuntimeResult<()> {
    let mut ranges = vec![(lo, hi)];
    while let Some((lo, hi)) = ranges.pop() {
        if lo >= hi {
            continue;
        }
        let pivot = data.add(hi * item_size);
        let mut i = lo - 1;
        for j in lo..hi {
            let item = data.add(j * item_size);
            if cmp(vm, item, pivot)? <= 0 {
                i += 1;
                swap_items(vm, data, item_size, i, j)?;
            }
        }
        swap_items(vm, data, item_size, i + 1, hi)?;
        ranges.push((lo, i));
        ranges.push((i + 2, hi));
    }
    Ok(())
}

fn swap_items(vm: &mut Vm, data: Ptr, item_size: i64, i: i64, j: i64) -> RuntimeResult<()> {
    if i == j {
        return Ok(());
    }
    let a = vm.read_vec(data.add(i * item_size), item_size as usize)?;
    let b = vm.read_vec(data.add(j * item_size), item_size as usize)?;
    vm.write_bytes(data.add(i * item_size), &b)?;
    vm.write_bytes(data.add(j * item_size), &a)?;
    Ok(())
}

fn builtin_valid(vm: &mut Vm, instr: &Instruction) -> RuntimeResult<()> {
    let top = vm.fiber().top_slot();
    let valid = match instr.type_kind {
        TypeKind::DynArray => {
            let array = top.ptr_val();
            !array.is_null() && !objects::dyn_array_data(vm, array)?.is_null()
        }
        TypeKind::Map => {
            let map = top.ptr_val();
            !map.is_null() && !vm.read_ptr(map.add(8))?.is_null()
        }
        TypeKind::Interface => {
            let iface = top.ptr_val();
            !iface.is_null() && vm.read_u64(iface)? != 0
        }
        TypeKind::Fn => top.int_val() > 0,
        TypeKind::Closure => {
            let closure = top.ptr_val();
            !closure.is_null() && vm.read_i64(closure)? > 0
        }
        TypeKind::Fiber => {
            let chunk = top.ptr_val();
            if chunk.is_null() {
                false
            } else {
                let id = vm.read_u64(chunk)? as usize;
                vm.fibers.get(id).is_some_and(|f| f.alive)
            }
        }
        _ => return Err(vm.error("Illegal type")),
    };
    vm.fiber_mut().set_top_slot(Slot::from_int(valid as i64));
    Ok(())
}

fn type_has_ptr(vm: &Vm, type_id: TypeId, visited: &mut Vec<TypeId>) -> bool {
    if visited.contains(&type_id) {
        return false;
    }
    visited.push(type_id);
    let types = &vm.program.types;
    match types.kind(type_id) {
        TypeKind::Ptr
        | TypeKind::WeakPtr
        | TypeKind::Str
        | TypeKind::DynArray
        | TypeKind::Map
        | TypeKind::Interface
        | TypeKind::Fiber => true,
        TypeKind::Array => type_has_ptr(vm, types.base(type_id), visited),
        TypeKind::Struct | TypeKind::Closure => types
            .get(type_id)
            .fields
            .iter()
            .map(|f| f.type_id)
            .collect::<Vec<_>>()
            .into_iter()
            .any(|f| type_has_ptr(vm, f, visited)),
        _ => false,
    }
}
