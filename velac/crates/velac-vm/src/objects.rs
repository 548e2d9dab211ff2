//! Runtime object layouts: strings, dynamic arrays, maps, interfaces,
//! closures, and fibers.
//!
//! All layouts are byte-exact so handle arithmetic matches the offsets the
//! compiler bakes into instructions:
//!
//! - string: `{len, capacity}` in the 16 bytes below the NUL-terminated data
//! - dynamic array value: `{type, item size, data}` (24 bytes); the data
//!   block carries `{len, capacity}` below it like a string
//! - map value: `{type, root}` (16 bytes); tree nodes are
//!   `{len-or-priority, key, data, left, right}` (40 bytes)
//! - interface: `{self, self type, methods...}`
//! - closure: `{entry, upvalue interface}` (24 bytes)
//! - fiber value: a heap chunk holding the fiber's table index

use rand::Rng;

use velac_gen::{Slot, RETURN_FROM_FIBER};
use velac_sem::TypeKind;
use velac_util::{Ptr, RuntimeResult, TypeId};

use crate::compare;
use crate::fiber::Fiber;
use crate::vm::Vm;

/// Byte offsets inside a map tree node.
pub const NODE_LEN: i64 = 0;
pub const NODE_KEY: i64 = 8;
pub const NODE_DATA: i64 = 16;
pub const NODE_LEFT: i64 = 24;
pub const NODE_RIGHT: i64 = 32;

/// Type descriptors stored in memory are `TypeId + 1`; zero means "none",
/// mirroring a null descriptor pointer.
pub fn type_to_slot(type_id: Option<TypeId>) -> Slot {
    Slot::from_uint(type_id.map_or(0, |t| t.0 as u64 + 1))
}

pub fn slot_to_type(slot: Slot) -> Option<TypeId> {
    if slot.0 == 0 {
        None
    } else {
        Some(TypeId((slot.0 - 1) as u32))
    }
}

/// The shared zero-length sentinel in the data section.
pub fn empty_sentinel() -> Ptr {
    Ptr::data(velac_gen::EMPTY_SENTINEL)
}

/// String length; a null handle counts as the empty string.
pub fn str_len(vm: &Vm, s: Ptr) -> RuntimeResult<i64> {
    if s.is_null() {
        return Ok(0);
    }
    vm.read_i64(s.add(-16))
}

pub fn str_capacity(vm: &Vm, s: Ptr) -> RuntimeResult<i64> {
    if s.is_null() {
        return Ok(0);
    }
    vm.read_i64(s.add(-8))
}

pub fn read_str(vm: &Vm, s: Ptr) -> RuntimeResult<Vec<u8>> {
    let len = str_len(vm, s)?;
    if len == 0 {
        return Ok(Vec::new());
    }
    vm.read_vec(s, len as usize)
}

/// Reads a NUL-terminated byte sequence. Unlike [`read_str`], this works
/// for interior pointers (a scan source advanced into a string) where the
/// dimension block is not at `ptr - 16`.
pub fn read_cstr(vm: &Vm, s: Ptr) -> RuntimeResult<Vec<u8>> {
    let mut bytes = Vec::new();
    if s.is_null() {
        return Ok(bytes);
    }
    let mut cursor = s;
    loop {
        let mut byte = [0u8; 1];
        vm.read_into(cursor, &mut byte)?;
        if byte[0] == 0 {
            return Ok(bytes);
        }
        bytes.push(byte[0]);
        cursor = cursor.add(1);
    }
}

/// Allocates a string of `len` bytes (plus dimensions and NUL), returning
/// the data handle. Capacity is `2 * (len + 1)`, clamped to the heap cap.
pub fn alloc_str(vm: &mut Vm, len: i64) -> RuntimeResult<Ptr> {
    let mut capacity = 2 * (len + 1);
    let limit = i32::MAX as i64 - vgc::MEM_MIN_FREE_HEAP;
    if capacity > limit {
        capacity = limit;
    }
    if capacity < len {
        capacity = len;
    }
    let ip = vm.fiber().ip;
    let chunk = vm
        .heap
        .alloc(16 + capacity, None, None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    let data = chunk.add(16);
    vm.write_i64(chunk, len)?;
    vm.write_i64(chunk.add(8), capacity)?;
    vm.write_bytes(data.add(len), &[0])?;
    Ok(data)
}

pub fn make_str(vm: &mut Vm, bytes: &[u8]) -> RuntimeResult<Ptr> {
    let data = alloc_str(vm, bytes.len() as i64)?;
    vm.write_bytes(data, bytes)?;
    Ok(data)
}

/// Dynamic array field reads; `array` is the 24-byte value address.
pub fn dyn_array_data(vm: &Vm, array: Ptr) -> RuntimeResult<Ptr> {
    vm.read_ptr(array.add(16))
}

pub fn dyn_array_item_size(vm: &Vm, array: Ptr) -> RuntimeResult<i64> {
    vm.read_i64(array.add(8))
}

pub fn dyn_array_len(vm: &Vm, array: Ptr) -> RuntimeResult<i64> {
    let data = dyn_array_data(vm, array)?;
    if data.is_null() {
        return Ok(0);
    }
    vm.read_i64(data.add(-16))
}

pub fn dyn_array_capacity(vm: &Vm, array: Ptr) -> RuntimeResult<i64> {
    let data = dyn_array_data(vm, array)?;
    if data.is_null() {
        return Ok(0);
    }
    vm.read_i64(data.add(-8))
}

/// Fills a dynamic array value with freshly allocated storage for `len`
/// items. The data chunk is tagged with the array type so the collector
/// can trace the items.
pub fn alloc_dyn_array(vm: &mut Vm, array: Ptr, type_id: TypeId, len: i64) -> RuntimeResult<()> {
    let base = vm.program.types.base(type_id);
    let item_size = vm.program.types.size(base).map_err(|e| vm.error(e))?;

    let mut capacity = 2 * (len + 1);
    let limit = (i32::MAX as i64 - vgc::MEM_MIN_FREE_HEAP) / item_size.max(1);
    if capacity > limit {
        capacity = limit;
    }
    if capacity < len {
        capacity = len;
    }

    let ip = vm.fiber().ip;
    let chunk = vm
        .heap
        .alloc(16 + capacity * item_size, Some(type_id), None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    vm.write_i64(chunk, len)?;
    vm.write_i64(chunk.add(8), capacity)?;

    vm.write_bytes(array, &type_to_slot(Some(type_id)).0.to_le_bytes())?;
    vm.write_i64(array.add(8), item_size)?;
    vm.write_bytes(array.add(16), &chunk.add(16).0.to_le_bytes())?;
    Ok(())
}

/// Points an array value at the shared empty sentinel.
pub fn empty_dyn_array(vm: &mut Vm, array: Ptr, type_id: TypeId) -> RuntimeResult<()> {
    let base = vm.program.types.base(type_id);
    let item_size = vm.program.types.size(base).map_err(|e| vm.error(e))?;
    vm.write_bytes(array, &type_to_slot(Some(type_id)).0.to_le_bytes())?;
    vm.write_i64(array.add(8), item_size)?;
    vm.write_bytes(array.add(16), &empty_sentinel().0.to_le_bytes())?;
    Ok(())
}

/// Map length; reads the root node's length field.
pub fn map_len(vm: &Vm, map: Ptr) -> RuntimeResult<i64> {
    let root = vm.read_ptr(map.add(8))?;
    if root.is_null() {
        return Ok(0);
    }
    vm.read_i64(root.add(NODE_LEN))
}

/// Allocates the root node of a map.
pub fn alloc_map(vm: &mut Vm, map: Ptr, map_type: TypeId) -> RuntimeResult<()> {
    let node_type = vm.program.types.base(map_type);
    let node_size = vm.program.types.size(node_type).map_err(|e| vm.error(e))?;
    let ip = vm.fiber().ip;
    let root = vm
        .heap
        .alloc(node_size, Some(node_type), None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    vm.write_bytes(map, &type_to_slot(Some(map_type)).0.to_le_bytes())?;
    vm.write_bytes(map.add(8), &root.0.to_le_bytes())?;
    Ok(())
}

/// Rotates `child` above the node held in `node_cell` (treap rebalance).
fn rebalance(vm: &mut Vm, node_cell: Ptr, node: Ptr, child: Ptr) -> RuntimeResult<()> {
    let right = vm.read_ptr(node.add(NODE_RIGHT))?;
    let left = vm.read_ptr(node.add(NODE_LEFT))?;
    if child == right {
        let grandchild = vm.read_ptr(child.add(NODE_LEFT))?;
        vm.write_bytes(node.add(NODE_RIGHT), &grandchild.0.to_le_bytes())?;
        vm.write_bytes(child.add(NODE_LEFT), &node.0.to_le_bytes())?;
    } else if child == left {
        let grandchild = vm.read_ptr(child.add(NODE_RIGHT))?;
        vm.write_bytes(node.add(NODE_LEFT), &grandchild.0.to_le_bytes())?;
        vm.write_bytes(child.add(NODE_RIGHT), &node.0.to_le_bytes())?;
    } else {
        return Ok(());
    }
    vm.write_bytes(node_cell, &child.0.to_le_bytes())
}

/// Finds the cell holding the node for `key` (the parent's child slot, or
/// the map's root slot). With `create_missing`, empty cells get a fresh
/// node. Returns `(cell, node)`; the node is null when absent and not
/// created.
pub fn map_find_cell(
    vm: &mut Vm,
    map: Ptr,
    map_type: TypeId,
    key: Slot,
    create_missing: bool,
) -> RuntimeResult<(Ptr, Ptr)> {
    let root = vm.read_ptr(map.add(8))?;
    if map.is_null() || root.is_null() {
        return Err(vm.error("Map is null"));
    }
    let key_type = vm.program.types.map_key(map_type);
    let key_kind = vm.program.types.kind(key_type);

    let mut node_cell = map.add(8);
    let mut at_root = true;
    loop {
        let node = vm.read_ptr(node_cell)?;
        if node.is_null() {
            break;
        }
        let key_ptr = vm.read_ptr(node.add(NODE_KEY))?;
        let key_diff = if key_ptr.is_null() {
            1
        } else {
            let node_key = vm.load(key_ptr, key_kind)?;
            compare::compare_values(vm, key, node_key, key_type)?
        };
        if key_diff == 0 {
            return Ok((node_cell, node));
        }
        let child_cell = node.add(if key_diff > 0 { NODE_RIGHT } else { NODE_LEFT });
        let child = vm.read_ptr(child_cell)?;

        // Treap rebalancing; the root sentinel holds the length in the
        // priority field and never rotates.
        let priority = vm.read_i64(node.add(NODE_LEN))?;
        let child_priority = if child.is_null() { 0 } else { vm.read_i64(child.add(NODE_LEN))? };
        if !at_root && priority > 0 && !child.is_null() && child_priority > priority {
            rebalance(vm, node_cell, node, child)?;
        } else {
            node_cell = child_cell;
        }
        at_root = false;
    }

    if !create_missing {
        return Ok((node_cell, Ptr::NULL));
    }

    let node_type = vm.program.types.base(map_type);
    let node_size = vm.program.types.size(node_type).map_err(|e| vm.error(e))?;
    let ip = vm.fiber().ip;
    let node = vm
        .heap
        .alloc(node_size, Some(node_type), None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    vm.write_bytes(node_cell, &node.0.to_le_bytes())?;
    Ok((node_cell, node))
}

pub fn map_find_node(
    vm: &mut Vm,
    map: Ptr,
    map_type: TypeId,
    key: Slot,
    create_missing: bool,
) -> RuntimeResult<Ptr> {
    map_find_cell(vm, map, map_type, key, create_missing).map(|(_, node)| node)
}

/// `GET_MAP_PTR`: the address of the value for `key`, creating the entry
/// (with a randomized treap priority) when missing.
pub fn map_item_ptr(vm: &mut Vm, map: Ptr, map_type: TypeId, key: Slot, create: bool) -> RuntimeResult<Ptr> {
    if map.is_null() {
        return Err(vm.error("Map is null"));
    }
    if vm.read_ptr(map.add(8))?.is_null() {
        alloc_map(vm, map, map_type)?;
    }
    let node = map_find_node(vm, map, map_type, key, create)?;
    if node.is_null() {
        return Ok(Ptr::NULL);
    }
    let data = vm.read_ptr(node.add(NODE_DATA))?;
    if !data.is_null() {
        return Ok(data);
    }

    let key_type = vm.program.types.map_key(map_type);
    let item_type = vm.program.types.map_item(map_type);
    let key_kind = vm.program.types.kind(key_type);
    let key_size = vm.program.types.size(key_type).map_err(|e| vm.error(e))?;
    let item_size = vm.program.types.size(item_type).map_err(|e| vm.error(e))?;

    let priority = vm.rng.gen_range(1..i64::MAX);
    vm.write_i64(node.add(NODE_LEN), priority)?;

    // Dynamic-array values are traced through their data chunk, so the
    // holder chunk itself stays untyped.
    let key_chunk_type = if key_kind == TypeKind::DynArray { None } else { Some(key_type) };
    let item_chunk_type = if vm.program.types.kind(item_type) == TypeKind::DynArray {
        None
    } else {
        Some(item_type)
    };

    let ip = vm.fiber().ip;
    let key_chunk = vm
        .heap
        .alloc(key_size, key_chunk_type, None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    let data_chunk = vm
        .heap
        .alloc(item_size, item_chunk_type, None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    vm.write_bytes(node.add(NODE_KEY), &key_chunk.0.to_le_bytes())?;
    vm.write_bytes(node.add(NODE_DATA), &data_chunk.0.to_le_bytes())?;

    if vm.program.types.kind(key_type).is_garbage_collected() {
        vm.change_ref_cnt_typed(key, key_type, 1)?;
    }
    vm.store(key_chunk, key_kind, key, key_size)?;

    let root = vm.read_ptr(map.add(8))?;
    let len = vm.read_i64(root.add(NODE_LEN))?;
    vm.write_i64(root.add(NODE_LEN), len + 1)?;
    Ok(data_chunk)
}

/// In-order key collection for the `keys` built-in.
pub fn map_keys(vm: &Vm, map: Ptr, map_type: TypeId, keys: &mut Vec<Slot>) -> RuntimeResult<()> {
    let root = vm.read_ptr(map.add(8))?;
    if root.is_null() {
        return Ok(());
    }
    let key_kind = vm.program.types.kind(vm.program.types.map_key(map_type));
    collect_keys(vm, root, key_kind, keys)
}

fn collect_keys(vm: &Vm, node: Ptr, key_kind: TypeKind, keys: &mut Vec<Slot>) -> RuntimeResult<()> {
    let left = vm.read_ptr(node.add(NODE_LEFT))?;
    if !left.is_null() {
        collect_keys(vm, left, key_kind, keys)?;
    }
    let key_ptr = vm.read_ptr(node.add(NODE_KEY))?;
    if !key_ptr.is_null() {
        keys.push(vm.load(key_ptr, key_kind)?);
    }
    let right = vm.read_ptr(node.add(NODE_RIGHT))?;
    if !right.is_null() {
        collect_keys(vm, right, key_kind, keys)?;
    }
    Ok(())
}

/// Spawns a child fiber running a closure of shape
/// `fn (parent: ^fiber, arg: ^T)`. Returns the fiber value handle.
pub fn spawn_fiber(vm: &mut Vm, closure: Ptr, arg: Ptr, arg_type: TypeId) -> RuntimeResult<Ptr> {
    let entry = vm.read_i64(closure)?;
    if entry <= 0 {
        return Err(vm.error("Called function is not defined"));
    }
    let upv_self = Slot(vm.read_u64(closure.add(8))?);
    let upv_type = Slot(vm.read_u64(closure.add(16))?);

    let parent_id = vm.cur;
    let parent_chunk = vm.fibers[parent_id].chunk;
    let stack_size = vm.fibers[parent_id].stack_size;

    let fiber_type = vm.program.fiber_type;
    let child_id = vm.fibers.len();
    let ip = vm.fiber().ip;

    // The fiber's script value is a chunk holding its table index.
    let chunk = vm
        .heap
        .alloc(8, Some(fiber_type), None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    vm.write_u64(chunk, child_id as u64)?;

    // The parent parameter points at a chunk holding the parent's value,
    // which keeps the parent alive for the child's lifetime.
    let parent_ref = vm
        .heap
        .alloc(8, Some(fiber_type), None, ip)
        .map_err(|e| vm.error(e.to_string()))?;
    vm.write_bytes(parent_ref, &parent_chunk.0.to_le_bytes())?;
    vm.heap
        .change_ref_cnt(parent_chunk, 1)
        .map_err(|e| vm.error(e.to_string()))?;

    // References passed into the child live until its last frame returns.
    // Pointers into the parent's stack are exempt: frame accounting is
    // per-fiber, and the child's epilog cannot reach the parent's frames.
    if let Some(type_id) = slot_to_type(upv_type) {
        if upv_self.ptr_val().region() != velac_util::PtrRegion::Stack {
            vm.change_ref_cnt_typed(upv_self, type_id, 1)?;
        }
    }
    if arg.region() != velac_util::PtrRegion::Stack {
        vm.change_ref_cnt_typed(Slot::from_ptr(arg), arg_type, 1)?;
    }

    let mut child = Fiber::new(stack_size);
    child.parent = Some(parent_id);
    child.chunk = chunk;
    child.push(upv_self);
    child.push(upv_type);
    child.push(Slot::from_ptr(parent_ref));
    child.push(Slot::from_ptr(arg));
    child.push(Slot::from_int(RETURN_FROM_FIBER));
    child.ip = entry as usize;
    vm.fibers.push(child);

    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_slot_encoding() {
        assert_eq!(type_to_slot(None).0, 0);
        let t = TypeId(0);
        assert_eq!(slot_to_type(type_to_slot(Some(t))), Some(t));
        let t = TypeId(41);
        assert_eq!(slot_to_type(type_to_slot(Some(t))), Some(t));
    }

    #[test]
    fn test_empty_sentinel_is_data_region() {
        assert_eq!(empty_sentinel().region(), velac_util::PtrRegion::Data);
    }
}
