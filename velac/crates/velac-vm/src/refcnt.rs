//! The typed reference-count engine.
//!
//! A work stack of `(value, type, deferred)` records drains the update:
//! decrementing a chunk's last reference defers the parent and pushes the
//! typed children first, giving a post-order traversal without recursion.

use velac_gen::Slot;
use velac_sem::TypeKind;
use velac_util::{Ptr, PtrRegion, RuntimeResult, TypeId};

use crate::objects;
use crate::vm::Vm;

struct Candidate {
    value: Slot,
    type_id: TypeId,
    deferred: bool,
}

impl Vm {
    /// Applies a reference-count delta (+1/-1) to a value of a
    /// garbage-collected type, recursing through its children when the
    /// last reference to a chunk is dropped.
    pub fn change_ref_cnt_typed(&mut self, value: Slot, type_id: TypeId, delta: i64) -> RuntimeResult<()> {
        let mut work = vec![Candidate {
            value,
            type_id,
            deferred: false,
        }];

        while let Some(candidate) = work.pop() {
            if candidate.deferred {
                self.chunk_ref_change(candidate.value.ptr_val(), delta)?;
                continue;
            }
            let kind = self.program.types.kind(candidate.type_id);
            match kind {
                TypeKind::Ptr => {
                    let ptr = candidate.value.ptr_val();
                    match ptr.region() {
                        PtrRegion::Stack => {
                            self.stack_change_frame_ref_cnt(ptr, delta)?;
                        }
                        PtrRegion::Heap => {
                            if delta > 0 {
                                self.chunk_ref_change(ptr, delta)?;
                            } else if self.heap.ref_cnt(ptr) > 1 {
                                self.chunk_ref_change(ptr, delta)?;
                            } else if self.heap.ref_cnt(ptr) == 1 {
                                // Last reference: release the children
                                // before the chunk itself goes.
                                work.push(Candidate {
                                    value: candidate.value,
                                    type_id: candidate.type_id,
                                    deferred: true,
                                });
                                self.push_chunk_children(ptr, candidate.type_id, &mut work)?;
                            }
                        }
                        _ => {}
                    }
                }
                TypeKind::WeakPtr => {}
                TypeKind::Str => {
                    let ptr = candidate.value.ptr_val();
                    if ptr.region() == PtrRegion::Heap {
                        self.chunk_ref_change(ptr, delta)?;
                    }
                }
                TypeKind::Array => {
                    let base = self.program.types.base(candidate.type_id);
                    let len = self.program.types.get(candidate.type_id).num_items;
                    self.push_item_children(candidate.value.ptr_val(), base, len, &mut work)?;
                }
                TypeKind::DynArray => {
                    let array = candidate.value.ptr_val();
                    if array.is_null() {
                        continue;
                    }
                    let data = objects::dyn_array_data(self, array)?;
                    if data.region() != PtrRegion::Heap {
                        continue;
                    }
                    if delta > 0 {
                        self.chunk_ref_change(data, delta)?;
                    } else if self.heap.ref_cnt(data) > 1 {
                        self.chunk_ref_change(data, delta)?;
                    } else if self.heap.ref_cnt(data) == 1 {
                        work.push(Candidate {
                            value: Slot::from_ptr(data),
                            type_id: candidate.type_id,
                            deferred: true,
                        });
                        let base = self.program.types.base(candidate.type_id);
                        let len = self.read_i64(data.add(-16))?;
                        self.push_item_children(data, base, len, &mut work)?;
                    }
                }
                TypeKind::Map => {
                    let map = candidate.value.ptr_val();
                    if map.is_null() {
                        continue;
                    }
                    let root = self.read_ptr(map.add(8))?;
                    let node_ptr_type = self.program.types.map_node_ptr(candidate.type_id);
                    work.push(Candidate {
                        value: Slot::from_ptr(root),
                        type_id: node_ptr_type,
                        deferred: false,
                    });
                }
                TypeKind::Struct | TypeKind::Closure => {
                    self.push_field_children(candidate.value.ptr_val(), candidate.type_id, &mut work)?;
                }
                TypeKind::Interface => {
                    let iface = candidate.value.ptr_val();
                    if iface.is_null() {
                        continue;
                    }
                    let self_ptr = Ptr(self.read_u64(iface)?);
                    let self_type = objects::slot_to_type(Slot(self.read_u64(iface.add(8))?));
                    if let (false, Some(self_type)) = (self_ptr.is_null(), self_type) {
                        work.push(Candidate {
                            value: Slot::from_ptr(self_ptr),
                            type_id: self_type,
                            deferred: false,
                        });
                    }
                }
                TypeKind::Fiber => {
                    let ptr = candidate.value.ptr_val();
                    if ptr.region() != PtrRegion::Heap {
                        continue;
                    }
                    if delta > 0 || self.heap.ref_cnt(ptr) > 1 {
                        self.chunk_ref_change(ptr, delta)?;
                    } else if self.heap.ref_cnt(ptr) == 1 {
                        let fiber_id = self.read_u64(ptr)? as usize;
                        // Busy means on the running resume chain; a parked
                        // fiber dies with its last reference.
                        let mut busy = false;
                        let mut walk = Some(self.cur);
                        while let Some(id) = walk {
                            if id == fiber_id {
                                busy = true;
                                break;
                            }
                            walk = self.fibers[id].parent;
                        }
                        if busy && fiber_id != 0 {
                            return Err(self.error("Cannot destroy a busy fiber"));
                        }
                        if fiber_id != 0 {
                            if let Some(fiber) = self.fibers.get_mut(fiber_id) {
                                // Return the dead fiber's stack region.
                                *fiber = crate::fiber::Fiber::new(0);
                                fiber.alive = false;
                            }
                        }
                        self.chunk_ref_change(ptr, delta)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Applies a reference-count delta to `len` items of a detached array
    /// (freshly copied storage whose items were "assigned one by one").
    pub fn change_ref_cnt_items(&mut self, data: Ptr, item_type: TypeId, len: i64, delta: i64) -> RuntimeResult<()> {
        if !self.program.types.kind(item_type).is_garbage_collected() {
            return Ok(());
        }
        let item_size = self.program.types.size(item_type).map_err(|e| self.error(e))?;
        let kind = self.program.types.kind(item_type);
        for i in 0..len {
            let item_addr = data.add(i * item_size);
            let value = if matches!(kind, TypeKind::Ptr | TypeKind::Str | TypeKind::Fiber) {
                Slot(self.read_u64(item_addr)?)
            } else {
                Slot::from_ptr(item_addr)
            };
            self.change_ref_cnt_typed(value, item_type, delta)?;
        }
        Ok(())
    }

    /// Single-chunk (or stack frame) count change, firing the on-free
    /// callback at the 1 -> 0 transition.
    pub(crate) fn chunk_ref_change(&mut self, ptr: Ptr, delta: i64) -> RuntimeResult<i64> {
        match ptr.region() {
            PtrRegion::Heap => {
                if delta < 0 && self.heap.ref_cnt(ptr) == 1 {
                    if let Some(id) = self.heap.take_on_free(ptr) {
                        if let Some(f) = self.on_free_fns.get(id as usize).cloned() {
                            f(self, ptr);
                        }
                    }
                }
                self.heap.change_ref_cnt(ptr, delta).map_err(|e| self.error(e.to_string()))
            }
            PtrRegion::Stack => {
                self.stack_change_frame_ref_cnt(ptr, delta)?;
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    /// Children of a chunk that is about to be freed through a pointer.
    /// An interior pointer may be the last reference to a composite chunk,
    /// so the chunk's own type wins over the pointer's base type.
    fn push_chunk_children(&mut self, ptr: Ptr, ptr_type: TypeId, work: &mut Vec<Candidate>) -> RuntimeResult<()> {
        let chunk_type = self.heap.chunk(ptr).and_then(|c| c.type_id);
        let chunk_start = self.heap.chunk_start(ptr).unwrap_or(ptr);
        match chunk_type {
            Some(t) => match self.program.types.kind(t) {
                TypeKind::Array | TypeKind::Map | TypeKind::Struct | TypeKind::Interface | TypeKind::Closure => {
                    work.push(Candidate {
                        value: Slot::from_ptr(chunk_start),
                        type_id: t,
                        deferred: false,
                    });
                    Ok(())
                }
                TypeKind::DynArray => {
                    // Dynamic array data chunks carry the array type; the
                    // dimensions sit at the chunk start.
                    let len = self.read_i64(chunk_start)?;
                    let base = self.program.types.base(t);
                    self.push_item_children(chunk_start.add(16), base, len, work)
                }
                _ => self.push_pointee_child(ptr, ptr_type, work),
            },
            None => self.push_pointee_child(ptr, ptr_type, work),
        }
    }

    fn push_pointee_child(&mut self, ptr: Ptr, ptr_type: TypeId, work: &mut Vec<Candidate>) -> RuntimeResult<()> {
        if self.program.types.kind(ptr_type) != TypeKind::Ptr {
            return Ok(());
        }
        let base = self.program.types.base(ptr_type);
        let base_kind = self.program.types.kind(base);
        if !base_kind.is_garbage_collected() {
            return Ok(());
        }
        let value = if matches!(base_kind, TypeKind::Ptr | TypeKind::Str | TypeKind::Fiber) {
            Slot(self.read_u64(ptr)?)
        } else {
            Slot::from_ptr(ptr)
        };
        work.push(Candidate {
            value,
            type_id: base,
            deferred: false,
        });
        Ok(())
    }

    fn push_item_children(&mut self, data: Ptr, item_type: TypeId, len: i64, work: &mut Vec<Candidate>) -> RuntimeResult<()> {
        let item_kind = self.program.types.kind(item_type);
        if !item_kind.is_garbage_collected() {
            return Ok(());
        }
        let item_size = self.program.types.size(item_type).map_err(|e| self.error(e))?;
        for i in 0..len {
            let item_addr = data.add(i * item_size);
            let value = if matches!(item_kind, TypeKind::Ptr | TypeKind::Str | TypeKind::Fiber) {
                Slot(self.read_u64(item_addr)?)
            } else {
                Slot::from_ptr(item_addr)
            };
            work.push(Candidate {
                value,
                type_id: item_type,
                deferred: false,
            });
        }
        Ok(())
    }

    fn push_field_children(&mut self, base: Ptr, struct_type: TypeId, work: &mut Vec<Candidate>) -> RuntimeResult<()> {
        if base.is_null() {
            return Ok(());
        }
        let fields: Vec<(i64, TypeId)> = self
            .program
            .types
            .get(struct_type)
            .fields
            .iter()
            .map(|f| (f.offset, f.type_id))
            .collect();
        for (offset, field_type) in fields {
            let field_kind = self.program.types.kind(field_type);
            if !field_kind.is_garbage_collected() {
                continue;
            }
            let field_addr = base.add(offset);
            let value = if matches!(field_kind, TypeKind::Ptr | TypeKind::Str | TypeKind::Fiber) {
                Slot(self.read_u64(field_addr)?)
            } else {
                Slot::from_ptr(field_addr)
            };
            work.push(Candidate {
                value,
                type_id: field_type,
                deferred: false,
            });
        }
        Ok(())
    }
}
