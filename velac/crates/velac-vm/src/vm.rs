//! The VM instance and its dispatch loop.

use std::io::{BufRead, Write};
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use velac_gen::{Instruction, Opcode, Program, Slot, RETURN_FROM_FIBER, RETURN_FROM_VM};
use velac_lex::Tok;
use velac_sem::consts::Const;
use velac_sem::TypeKind;
use velac_util::{Ptr, PtrRegion, RuntimeError, RuntimeResult};
use vgc::Heap;

use crate::builtins;
use crate::compare;
use crate::fiber::Fiber;
use crate::objects;

/// Safety margin of free slots kept on every fiber stack.
pub const MEM_MIN_FREE_STACK: usize = 1024;

/// Events delivered to host hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Call = 0,
    Return = 1,
}

/// Host hook: (file name, function name, line).
pub type HookFn = Box<dyn FnMut(&str, &str, u32)>;

/// Host function callable from scripts. It reads its arguments and stores
/// its result through the `extern_arg`/`set_extern_result` helpers.
pub type ExternFn = Rc<dyn Fn(&mut Vm) -> RuntimeResult<()>>;

/// Host callback fired when a chunk's reference count reaches zero.
pub type OnFreeFn = Rc<dyn Fn(&mut Vm, Ptr)>;

/// Index into the VM's stream table. 0 is stdout, 1 is stderr, 2 is stdin.
pub type StreamId = usize;

pub enum Stream {
    Writer(Box<dyn Write>),
    Reader(Box<dyn BufRead>),
}

enum Flow {
    Next,
    ReturnToHost,
}

pub struct Vm {
    pub program: Program,
    pub heap: Heap,
    /// Mutable copy of the program's data section (globals + literals).
    pub data: Vec<u8>,
    pub fibers: Vec<Fiber>,
    /// Index of the running fiber.
    pub cur: usize,
    hooks: [Option<HookFn>; 2],
    pub(crate) externs: Vec<Option<ExternFn>>,
    pub(crate) on_free_fns: Vec<OnFreeFn>,
    pub(crate) streams: Vec<Stream>,
    pub(crate) rng: SmallRng,
    pub terminated_normally: bool,
    pub(crate) file_system_enabled: bool,
}

impl Vm {
    pub fn new(program: Program, stack_size: usize, file_system_enabled: bool) -> RuntimeResult<Vm> {
        let mut vm = Vm {
            data: program.data.clone(),
            externs: program.extern_names.iter().map(|_| None).collect(),
            program,
            heap: Heap::new(),
            fibers: Vec::new(),
            cur: 0,
            hooks: [None, None],
            on_free_fns: Vec::new(),
            streams: vec![
                Stream::Writer(Box::new(std::io::stdout())),
                Stream::Writer(Box::new(std::io::stderr())),
                Stream::Reader(Box::new(std::io::BufReader::new(std::io::stdin()))),
            ],
            rng: SmallRng::seed_from_u64(0x5eed_cafe),
            terminated_normally: false,
            file_system_enabled,
        };

        let mut main = Fiber::new(stack_size);
        let chunk = vm
            .heap
            .alloc(8, Some(vm.program.fiber_type), None, 0)
            .map_err(|e| RuntimeError::new(e.to_string()))?;
        main.chunk = chunk;
        vm.fibers.push(main);
        vm.write_bytes(chunk, &0u64.to_le_bytes())?;
        Ok(vm)
    }

    #[inline]
    pub fn fiber(&self) -> &Fiber {
        &self.fibers[self.cur]
    }

    #[inline]
    pub fn fiber_mut(&mut self) -> &mut Fiber {
        &mut self.fibers[self.cur]
    }

    /// Whether the main fiber can still execute.
    pub fn alive(&self) -> bool {
        self.fibers[0].alive
    }

    /// Marks the main fiber dead; the dispatch loop hands control back to
    /// the host at the next instruction boundary.
    pub fn kill(&mut self) {
        self.fibers[0].alive = false;
    }

    /// Builds a runtime error at the current instruction.
    pub fn error(&self, msg: impl Into<String>) -> RuntimeError {
        let fiber = self.fiber();
        let mut err = RuntimeError::new(msg);
        if let Some(debug) = self.program.debug.get(fiber.ip) {
            err.file_name = debug.file_name.to_string();
            err.fn_name = debug.fn_name.to_string();
            err.line = debug.line;
        }
        err.call_depth = self.call_depth();
        err
    }

    fn call_depth(&self) -> usize {
        let mut depth = 0;
        let mut frame = Some((self.fiber().base, self.fiber().ip));
        while let Some((base, ip)) = frame {
            depth += 1;
            frame = self.unwind(base, ip);
        }
        depth
    }

    /// One step of call-stack unwinding: the caller's frame base and
    /// resume address, or `None` at the outermost frame.
    pub fn unwind(&self, base: usize, _ip: usize) -> Option<(usize, usize)> {
        let fiber = self.fiber();
        if base == 0 || base >= fiber.top {
            return None;
        }
        let ret = fiber.slot(base - 1).int_val();
        if ret == RETURN_FROM_VM || ret == RETURN_FROM_FIBER || ret <= 0 {
            return None;
        }
        let parent_base = fiber.slot(base).int_val() as usize;
        Some((parent_base, ret as usize))
    }

    pub fn set_hook(&mut self, event: HookEvent, hook: Option<HookFn>) {
        self.hooks[event as usize] = hook;
    }

    fn fire_hook(&mut self, event: HookEvent) {
        if self.hooks[event as usize].is_none() {
            return;
        }
        let ip = self.fiber().ip;
        let (file, func, line) = match self.program.debug.get(ip) {
            Some(d) => (Rc::clone(&d.file_name), Rc::clone(&d.fn_name), d.line),
            None => return,
        };
        if let Some(mut hook) = self.hooks[event as usize].take() {
            hook(&file, &func, line);
            self.hooks[event as usize] = Some(hook);
        }
    }

    /// Reads the `index`-th user argument of the host function currently
    /// executing via `CALL_EXTERN` (hidden parameters excluded).
    pub fn extern_arg(&self, index: usize) -> Slot {
        let fiber = self.fiber();
        let layout_id = fiber.slot(fiber.base + 2).int_val() as usize;
        let layout = &self.program.layouts[layout_id];
        // Skip the hidden upvalue parameter in slot position 0.
        let mut first_slot = layout.param_slots[0];
        for slots in layout.param_slots.iter().skip(1).take(index) {
            first_slot += slots;
        }
        let slot_index = fiber.base as i64 - 1 - layout.num_param_slots + first_slot;
        fiber.slot(slot_index as usize)
    }

    /// Stores the result of the currently executing host function.
    pub fn set_extern_result(&mut self, value: Slot) {
        self.fiber_mut().reg[0] = value;
    }

    /// Registers a host function under a name the compiler resolved.
    pub fn bind_extern(&mut self, name: &str, f: ExternFn) -> bool {
        match self.program.extern_names.iter().position(|n| n == name) {
            Some(index) => {
                self.externs[index] = Some(f);
                true
            }
            None => false,
        }
    }

    pub fn register_on_free(&mut self, f: OnFreeFn) -> u32 {
        self.on_free_fns.push(f);
        (self.on_free_fns.len() - 1) as u32
    }

    /// Replaces a stream (0 stdout, 1 stderr, 2 stdin) or registers a new
    /// one, returning its id.
    pub fn set_stream(&mut self, id: Option<StreamId>, stream: Stream) -> StreamId {
        match id {
            Some(id) => {
                self.streams[id] = stream;
                id
            }
            None => {
                self.streams.push(stream);
                self.streams.len() - 1
            }
        }
    }

    // --- Memory access across the three regions

    pub fn read_into(&self, ptr: Ptr, out: &mut [u8]) -> RuntimeResult<()> {
        match ptr.region() {
            PtrRegion::Null => Err(self.error("Pointer is null")),
            PtrRegion::Data => {
                let offset = ptr.data_offset() as usize;
                let slice = self
                    .data
                    .get(offset..offset + out.len())
                    .ok_or_else(|| self.error(format!("Dangling pointer at {ptr}")))?;
                out.copy_from_slice(slice);
                Ok(())
            }
            PtrRegion::Heap => {
                let bytes = self.heap.bytes(ptr).map_err(|e| self.error(e.to_string()))?;
                let slice = bytes
                    .get(..out.len())
                    .ok_or_else(|| self.error(format!("Dangling pointer at {ptr}")))?;
                out.copy_from_slice(slice);
                Ok(())
            }
            PtrRegion::Stack => {
                let fiber = self
                    .fibers
                    .get(ptr.fiber_id() as usize)
                    .ok_or_else(|| self.error(format!("Dangling pointer at {ptr}")))?;
                let slice = fiber
                    .bytes(ptr.offset() as usize, out.len())
                    .ok_or_else(|| self.error(format!("Dangling pointer at {ptr}")))?;
                out.copy_from_slice(slice);
                Ok(())
            }
        }
    }

    pub fn write_bytes(&mut self, ptr: Ptr, src: &[u8]) -> RuntimeResult<()> {
        match ptr.region() {
            PtrRegion::Null => Err(self.error("Pointer is null")),
            PtrRegion::Data => {
                let offset = ptr.data_offset() as usize;
                let slice = self
                    .data
                    .get_mut(offset..offset + src.len())
                    .ok_or_else(|| RuntimeError::new(format!("Dangling pointer at {ptr}")))?;
                slice.copy_from_slice(src);
                Ok(())
            }
            PtrRegion::Heap => {
                let bytes = match self.heap.bytes_mut(ptr) {
                    Ok(b) => b,
                    Err(e) => return Err(self.error(e.to_string())),
                };
                match bytes.get_mut(..src.len()) {
                    Some(slice) => {
                        slice.copy_from_slice(src);
                        Ok(())
                    }
                    None => Err(self.error(format!("Dangling pointer at {ptr}"))),
                }
            }
            PtrRegion::Stack => {
                let fiber = self
                    .fibers
                    .get_mut(ptr.fiber_id() as usize)
                    .ok_or_else(|| RuntimeError::new(format!("Dangling pointer at {ptr}")))?;
                match fiber.bytes_mut(ptr.offset() as usize, src.len()) {
                    Some(slice) => {
                        slice.copy_from_slice(src);
                        Ok(())
                    }
                    None => Err(self.error(format!("Dangling pointer at {ptr}"))),
                }
            }
        }
    }

    pub fn read_vec(&self, ptr: Ptr, len: usize) -> RuntimeResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_into(ptr, &mut out)?;
        Ok(out)
    }

    pub fn read_u64(&self, ptr: Ptr) -> RuntimeResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(ptr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&self, ptr: Ptr) -> RuntimeResult<i64> {
        Ok(self.read_u64(ptr)? as i64)
    }

    pub fn read_ptr(&self, ptr: Ptr) -> RuntimeResult<Ptr> {
        Ok(Ptr(self.read_u64(ptr)?))
    }

    pub fn write_u64(&mut self, ptr: Ptr, value: u64) -> RuntimeResult<()> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn write_i64(&mut self, ptr: Ptr, value: i64) -> RuntimeResult<()> {
        self.write_u64(ptr, value as u64)
    }

    /// Typed load (`DEREF`). Structured values stay represented by their
    /// address.
    pub fn load(&self, ptr: Ptr, kind: TypeKind) -> RuntimeResult<Slot> {
        if ptr.is_null() {
            return Err(self.error("Pointer is null"));
        }
        let slot = match kind {
            TypeKind::Int8 => {
                let mut b = [0u8; 1];
                self.read_into(ptr, &mut b)?;
                Slot::from_int(b[0] as i8 as i64)
            }
            TypeKind::Int16 => {
                let mut b = [0u8; 2];
                self.read_into(ptr, &mut b)?;
                Slot::from_int(i16::from_le_bytes(b) as i64)
            }
            TypeKind::Int32 => {
                let mut b = [0u8; 4];
                self.read_into(ptr, &mut b)?;
                Slot::from_int(i32::from_le_bytes(b) as i64)
            }
            TypeKind::Int | TypeKind::UInt | TypeKind::Real => Slot(self.read_u64(ptr)?),
            TypeKind::UInt8 | TypeKind::Bool | TypeKind::Char => {
                let mut b = [0u8; 1];
                self.read_into(ptr, &mut b)?;
                Slot::from_int(b[0] as i64)
            }
            TypeKind::UInt16 => {
                let mut b = [0u8; 2];
                self.read_into(ptr, &mut b)?;
                Slot::from_int(u16::from_le_bytes(b) as i64)
            }
            TypeKind::UInt32 => {
                let mut b = [0u8; 4];
                self.read_into(ptr, &mut b)?;
                Slot::from_int(u32::from_le_bytes(b) as i64)
            }
            TypeKind::Real32 => {
                let mut b = [0u8; 4];
                self.read_into(ptr, &mut b)?;
                Slot::from_real(f32::from_le_bytes(b) as f64)
            }
            TypeKind::Ptr | TypeKind::WeakPtr | TypeKind::Str | TypeKind::Fiber | TypeKind::Fn => {
                Slot(self.read_u64(ptr)?)
            }
            TypeKind::Array
            | TypeKind::DynArray
            | TypeKind::Map
            | TypeKind::Struct
            | TypeKind::Interface
            | TypeKind::Closure => Slot::from_ptr(ptr),
            _ => return Err(self.error("Illegal type")),
        };
        Ok(slot)
    }

    /// Typed store (`ASSIGN`), with the target kind's range enforced.
    pub fn store(&mut self, lhs: Ptr, kind: TypeKind, rhs: Slot, struct_size: i64) -> RuntimeResult<()> {
        if lhs.is_null() {
            return Err(self.error("Pointer is null"));
        }
        let overflow_probe = if kind.is_real() {
            Const::Real(rhs.real_val())
        } else {
            Const::Int(rhs.int_val())
        };
        if kind.overflows(&overflow_probe) && kind != TypeKind::Void {
            return Err(self.error(format!("Overflow of {}", kind.spelling())));
        }
        match kind {
            TypeKind::Int8 | TypeKind::UInt8 | TypeKind::Char => {
                self.write_bytes(lhs, &[rhs.int_val() as u8])
            }
            TypeKind::Bool => self.write_bytes(lhs, &[(rhs.int_val() != 0) as u8]),
            TypeKind::Int16 | TypeKind::UInt16 => self.write_bytes(lhs, &(rhs.int_val() as u16).to_le_bytes()),
            TypeKind::Int32 | TypeKind::UInt32 => self.write_bytes(lhs, &(rhs.int_val() as u32).to_le_bytes()),
            TypeKind::Int | TypeKind::UInt | TypeKind::Real => self.write_u64(lhs, rhs.0),
            TypeKind::Real32 => self.write_bytes(lhs, &(rhs.real_val() as f32).to_le_bytes()),
            TypeKind::Ptr | TypeKind::WeakPtr | TypeKind::Str | TypeKind::Fiber | TypeKind::Fn => {
                self.write_u64(lhs, rhs.0)
            }
            TypeKind::Array
            | TypeKind::DynArray
            | TypeKind::Map
            | TypeKind::Struct
            | TypeKind::Interface
            | TypeKind::Closure => {
                let src = rhs.ptr_val();
                if src.is_null() {
                    return Err(self.error("Pointer is null"));
                }
                let bytes = self.read_vec(src, struct_size as usize)?;
                self.write_bytes(lhs, &bytes)
            }
            _ => Err(self.error("Illegal type")),
        }
    }

    // --- Stack helpers

    pub(crate) fn check_stack(&self, extra_slots: usize) -> RuntimeResult<()> {
        if self.fiber().free_slots() < extra_slots + MEM_MIN_FREE_STACK {
            return Err(self.error("Stack overflow"));
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, slot: Slot) -> RuntimeResult<()> {
        self.check_stack(1)?;
        self.fiber_mut().push(slot);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Slot {
        self.fiber_mut().pop()
    }

    /// Handle to a byte offset in the current fiber's stack.
    #[inline]
    pub(crate) fn stack_ptr(&self, byte_offset: usize) -> Ptr {
        Ptr::stack(self.cur as u32, byte_offset as u32)
    }

    /// Adjusts the frame reference count of the frame enclosing a stack
    /// address; used by the escape detector.
    pub(crate) fn stack_change_frame_ref_cnt(&mut self, ptr: Ptr, delta: i64) -> RuntimeResult<()> {
        if ptr.region() != PtrRegion::Stack || ptr.fiber_id() as usize != self.cur {
            return Ok(());
        }
        let ptr_slot = ptr.offset() as usize / 8;
        let fiber = self.fiber();
        if ptr_slot >= fiber.top {
            return Ok(());
        }
        let mut base = fiber.base;
        loop {
            if base == 0 {
                return Err(self.error("Illegal stack pointer"));
            }
            let layout_id = fiber.slot(base + 2).int_val() as usize;
            let num_param_slots = self
                .program
                .layouts
                .get(layout_id)
                .map_or(0, |l| l.num_param_slots) as usize;
            if ptr_slot + 1 + num_param_slots >= base {
                break;
            }
            let ret = fiber.slot(base - 1).int_val();
            if ret == RETURN_FROM_VM || ret == RETURN_FROM_FIBER {
                return Err(self.error("Illegal stack pointer"));
            }
            base = fiber.slot(base).int_val() as usize;
        }
        let slot = self.fibers[self.cur].slot(base + 1).int_val() + delta;
        self.fibers[self.cur].set_slot(base + 1, Slot::from_int(slot));
        Ok(())
    }

    // --- Entry points

    /// Runs the module initializers and `main`.
    pub fn run(&mut self) -> RuntimeResult<()> {
        let entries: Vec<usize> = self.program.init_entries.clone();
        for entry in entries {
            self.call_no_args(entry)?;
        }
        if let Some(main) = self.program.main_entry {
            self.call_no_args(main)?;
        }
        self.terminated_normally = true;
        self.fibers[0].alive = false;
        Ok(())
    }

    /// Calls a function context from the embedder: scalar arguments are
    /// passed in slots, the scalar result comes back from the result
    /// register.
    pub fn call_fn(&mut self, entry: usize, args: &[Slot]) -> RuntimeResult<Slot> {
        self.check_stack(args.len() + 3)?;
        let fiber = self.fiber_mut();
        fiber.push(Slot::default()); // hidden upvalue: null interface
        fiber.push(Slot::default());
        for &arg in args {
            fiber.push(arg);
        }
        fiber.push(Slot::from_int(RETURN_FROM_VM));
        fiber.ip = entry;
        self.run_loop()?;
        Ok(self.fiber().reg[0])
    }

    /// Calls a function that takes no user arguments.
    fn call_no_args(&mut self, entry: usize) -> RuntimeResult<()> {
        self.check_stack(3)?;
        let fiber = self.fiber_mut();
        fiber.push(Slot::default()); // hidden upvalue: null interface
        fiber.push(Slot::default());
        fiber.push(Slot::from_int(RETURN_FROM_VM));
        fiber.ip = entry;
        self.run_loop()
    }

    /// Calls an arbitrary entry with pre-pushed argument slots. The caller
    /// has already pushed the hidden upvalue and the arguments; this pushes
    /// the sentinel return address and re-enters the dispatch loop.
    pub(crate) fn call_reentrant(&mut self, entry: usize) -> RuntimeResult<()> {
        self.check_stack(1)?;
        let saved_ip = self.fiber().ip;
        self.fiber_mut().push(Slot::from_int(RETURN_FROM_VM));
        self.fiber_mut().ip = entry;
        let result = self.run_loop();
        self.fiber_mut().ip = saved_ip;
        result
    }

    /// The dispatch loop. Returns when the running frame chain unwinds to
    /// a host boundary (`RETURN_FROM_VM`) or the program halts.
    pub fn run_loop(&mut self) -> RuntimeResult<()> {
        loop {
            if !self.fiber().alive && self.cur == 0 {
                return Ok(());
            }
            self.check_stack(0)?;
            let ip = self.fiber().ip;
            let instr = self.program.code[ip].clone();
            match self.step(&instr)? {
                Flow::Next => {}
                Flow::ReturnToHost => return Ok(()),
            }
        }
    }

    fn step(&mut self, instr: &Instruction) -> RuntimeResult<Flow> {
        match instr.opcode {
            Opcode::Nop => {
                self.fiber_mut().ip += 1;
            }
            Opcode::Push => {
                let mut slot = instr.operand;
                if instr.inline_opcode == Opcode::Deref {
                    slot = self.load(slot.ptr_val(), instr.type_kind)?;
                }
                self.push(slot)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::PushZero => {
                let slots = instr.operand.int_val() as usize;
                self.check_stack(slots)?;
                self.fiber_mut().push_zeroed(slots);
                self.fiber_mut().ip += 1;
            }
            Opcode::PushLocalPtr => {
                let offset = self.fiber().local_offset(instr.operand.int_val());
                let ptr = self.stack_ptr(offset);
                self.push(Slot::from_ptr(ptr))?;
                self.fiber_mut().ip += 1;
            }
            Opcode::PushLocalPtrZero => {
                let (offset, size) = instr.operand.i32_pair();
                let abs = self.fiber().local_offset(offset as i64);
                self.fiber_mut().zero_bytes(abs, size as usize);
                let ptr = self.stack_ptr(abs);
                self.push(Slot::from_ptr(ptr))?;
                self.fiber_mut().ip += 1;
            }
            Opcode::PushLocal => {
                let offset = self.fiber().local_offset(instr.operand.int_val());
                let ptr = self.stack_ptr(offset);
                let value = self.load(ptr, instr.type_kind)?;
                self.push(value)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::PushReg => {
                let reg = instr.operand.int_val() as usize;
                let value = self.fiber().reg[reg];
                self.push(value)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::PushUpvalue => {
                // Closure pointer on top becomes (entry, upvalue) with the
                // upvalue's reference acquired for the callee.
                let closure = self.pop().ptr_val();
                let entry = self.read_i64(closure)?;
                let upv_self = Slot(self.read_u64(closure.add(8))?);
                let upv_type = Slot(self.read_u64(closure.add(16))?);
                if let Some(type_id) = objects::slot_to_type(upv_type) {
                    self.change_ref_cnt_typed(upv_self, type_id, 1)?;
                }
                self.push(Slot::from_int(entry))?;
                self.push(upv_self)?;
                self.push(upv_type)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::Pop => {
                let slots = instr.operand.int_val().max(1) as usize;
                self.fiber_mut().remove(slots);
                self.fiber_mut().ip += 1;
            }
            Opcode::PopReg => {
                let reg = instr.operand.int_val() as usize;
                let value = self.pop();
                self.fiber_mut().reg[reg] = value;
                self.fiber_mut().ip += 1;
            }
            Opcode::Dup => {
                let top = self.fiber().top_slot();
                self.push(top)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::Swap => {
                let fiber = self.fiber_mut();
                let a = fiber.slot(fiber.top - 1);
                let b = fiber.slot(fiber.top - 2);
                fiber.set_slot(fiber.top - 1, b);
                fiber.set_slot(fiber.top - 2, a);
                fiber.ip += 1;
            }
            Opcode::Zero => {
                let size = instr.operand.int_val() as usize;
                let ptr = self.pop().ptr_val();
                let zeros = vec![0u8; size];
                self.write_bytes(ptr, &zeros)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::Deref => {
                let ptr = self.fiber().top_slot().ptr_val();
                let value = self.load(ptr, instr.type_kind)?;
                self.fiber_mut().set_top_slot(value);
                self.fiber_mut().ip += 1;
            }
            Opcode::Assign => {
                if instr.inline_opcode == Opcode::Swap {
                    self.swap_top();
                }
                let rhs = self.pop();
                let lhs = self.pop().ptr_val();
                self.store(lhs, instr.type_kind, rhs, instr.operand.int_val())?;
                self.fiber_mut().ip += 1;
            }
            Opcode::AssignParam => {
                let size = instr.operand.int_val();
                let slots = (size + 7) / 8;
                if slots != 1 {
                    self.check_stack(slots as usize)?;
                    let rhs = self.pop();
                    let fiber = self.fiber_mut();
                    let dest_slot = fiber.top;
                    fiber.push_zeroed(slots as usize);
                    let dest = self.stack_ptr(dest_slot * 8);
                    self.store(dest, instr.type_kind, rhs, size)?;
                } else {
                    let rhs = self.fiber().top_slot();
                    let dest_slot = self.fiber().top - 1;
                    let dest = self.stack_ptr(dest_slot * 8);
                    self.store(dest, instr.type_kind, rhs, size)?;
                }
                self.fiber_mut().ip += 1;
            }
            Opcode::ChangeRefCnt => {
                let value = self.fiber().top_slot();
                let type_id = instr.type_id.expect("ref count op carries a type");
                let delta = if instr.tok_kind == Tok::PlusPlus { 1 } else { -1 };
                self.change_ref_cnt_typed(value, type_id, delta)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::ChangeRefCntGlobal | Opcode::ChangeRefCntLocal => {
                let type_id = instr.type_id.expect("ref count op carries a type");
                let kind = self.program.types.kind(type_id);
                let var_ptr = if instr.opcode == Opcode::ChangeRefCntGlobal {
                    instr.operand.ptr_val()
                } else {
                    let offset = self.fiber().local_offset(instr.operand.int_val());
                    self.stack_ptr(offset)
                };
                let value = self.load(var_ptr, kind)?;
                let delta = if instr.tok_kind == Tok::PlusPlus { 1 } else { -1 };
                self.change_ref_cnt_typed(value, type_id, delta)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::ChangeRefCntAssign => {
                if instr.inline_opcode == Opcode::Swap {
                    self.swap_top();
                }
                let rhs = self.pop();
                let lhs = self.pop().ptr_val();
                let type_id = instr.type_id.expect("ref count op carries a type");
                let kind = self.program.types.kind(type_id);
                // `--` marks an ownership transfer: the right-hand side
                // already carries the reference being stored.
                if instr.tok_kind != Tok::MinusMinus {
                    self.change_ref_cnt_typed(rhs, type_id, 1)?;
                }
                let old = self.load(lhs, kind)?;
                self.change_ref_cnt_typed(old, type_id, -1)?;
                self.store(lhs, kind, rhs, instr.operand.int_val())?;
                self.fiber_mut().ip += 1;
            }
            Opcode::Unary => {
                self.exec_unary(instr)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::Binary => {
                self.exec_binary(instr)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::GetArrayPtr => {
                let (item_size, len) = instr.operand.i32_pair();
                let item_size = item_size as i64;
                let mut len = len as i64;
                let index = self.pop().int_val();
                let mut data = self.fiber().top_slot().ptr_val();
                if len < 0 {
                    // Negative length: index a string by its stored length.
                    if data.is_null() {
                        data = objects::empty_sentinel();
                    }
                    len = self.read_i64(data.add(-16))?;
                } else if data.is_null() {
                    return Err(self.error("Array is null"));
                }
                if index < 0 || index > len - 1 {
                    return Err(self.error(format!("Index {index} is out of range 0...{}", len - 1)));
                }
                let mut slot = Slot::from_ptr(data.add(item_size * index));
                if instr.inline_opcode == Opcode::Deref {
                    slot = self.load(slot.ptr_val(), instr.type_kind)?;
                }
                self.fiber_mut().set_top_slot(slot);
                self.fiber_mut().ip += 1;
            }
            Opcode::GetDynArrayPtr => {
                let index = self.pop().int_val();
                let array = self.pop().ptr_val();
                if array.is_null() {
                    return Err(self.error("Dynamic array is null"));
                }
                let item_size = self.read_i64(array.add(8))?;
                let data = self.read_ptr(array.add(16))?;
                if data.is_null() {
                    return Err(self.error("Dynamic array is null"));
                }
                let len = self.read_i64(data.add(-16))?;
                if index < 0 || index > len - 1 {
                    return Err(self.error(format!("Index {index} is out of range 0...{}", len - 1)));
                }
                let mut slot = Slot::from_ptr(data.add(item_size * index));
                if instr.inline_opcode == Opcode::Deref {
                    slot = self.load(slot.ptr_val(), instr.type_kind)?;
                }
                self.push(slot)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::GetMapPtr => {
                let key = self.pop();
                let map = self.pop().ptr_val();
                let map_type = instr.type_id.expect("map access carries the map type");
                let data = objects::map_item_ptr(self, map, map_type, key, true)?;
                self.push(Slot::from_ptr(data))?;
                self.fiber_mut().ip += 1;
            }
            Opcode::GetFieldPtr => {
                let ptr = self.fiber().top_slot().ptr_val();
                if ptr.is_null() {
                    return Err(self.error("Array or structure is null"));
                }
                let mut slot = Slot::from_ptr(ptr.add(instr.operand.int_val()));
                if instr.inline_opcode == Opcode::Deref {
                    slot = self.load(slot.ptr_val(), instr.type_kind)?;
                }
                self.fiber_mut().set_top_slot(slot);
                self.fiber_mut().ip += 1;
            }
            Opcode::AssertType => {
                let iface = self.pop().ptr_val();
                let target = instr.type_id.expect("type assertion carries a type");
                let self_ptr = Ptr(self.read_u64(iface)?);
                let self_type = objects::slot_to_type(Slot(self.read_u64(iface.add(8))?));
                let matches = self_type.is_some_and(|t| self.program.types.equivalent(t, target));
                self.push(Slot::from_ptr(if matches { self_ptr } else { Ptr::NULL }))?;
                self.fiber_mut().ip += 1;
            }
            Opcode::AssertRange => {
                let dest_kind = instr.type_kind;
                let value = self.fiber().top_slot();
                let probe = if dest_kind.is_real() {
                    Const::Real(value.real_val())
                } else {
                    Const::Int(value.int_val())
                };
                if dest_kind.overflows(&probe) {
                    return Err(self.error(format!("Overflow of {}", dest_kind.spelling())));
                }
                self.fiber_mut().ip += 1;
            }
            Opcode::WeakenPtr => {
                let ptr = self.fiber().top_slot().ptr_val();
                if ptr.region() == PtrRegion::Stack {
                    return Err(self.error("Pointer to a local variable cannot be weak"));
                }
                // Heap handles already carry the page id + offset encoding.
                self.fiber_mut().ip += 1;
            }
            Opcode::StrengthenPtr => {
                let weak = self.fiber().top_slot().ptr_val();
                if weak.region() == PtrRegion::Stack {
                    return Err(self.error("Pointer to a local variable cannot be weak"));
                }
                let strong = self.heap.strengthen(weak);
                self.fiber_mut().set_top_slot(Slot::from_ptr(strong));
                self.fiber_mut().ip += 1;
            }
            Opcode::Goto => {
                self.fiber_mut().ip = instr.operand.int_val() as usize;
            }
            Opcode::GotoIf => {
                let cond = self.pop();
                let fiber = self.fiber_mut();
                if cond.bool_val() {
                    fiber.ip = instr.operand.int_val() as usize;
                } else {
                    fiber.ip += 1;
                }
            }
            Opcode::GotoIfNot => {
                let cond = self.pop();
                let fiber = self.fiber_mut();
                if !cond.bool_val() {
                    fiber.ip = instr.operand.int_val() as usize;
                } else {
                    fiber.ip += 1;
                }
            }
            Opcode::Call => {
                let entry = instr.operand.int_val();
                if entry <= 0 {
                    return Err(self.error("Called function is not defined"));
                }
                let ret = self.fiber().ip + 1;
                self.push(Slot::from_int(ret as i64))?;
                self.fiber_mut().ip = entry as usize;
            }
            Opcode::CallIndirect => {
                let param_slots = instr.operand.int_val() as usize;
                let fiber = self.fiber();
                let entry = fiber.slot(fiber.top - param_slots - 1).int_val();
                if entry <= 0 {
                    return Err(self.error("Called function is not defined"));
                }
                let ret = self.fiber().ip + 1;
                self.push(Slot::from_int(ret as i64))?;
                self.fiber_mut().ip = entry as usize;
            }
            Opcode::CallExtern => {
                let index = instr.operand.int_val() as usize;
                let f = match self.externs.get(index) {
                    Some(Some(f)) => Rc::clone(f),
                    _ => return Err(self.error("Called function is not defined")),
                };
                f(self)?;
                self.fiber_mut().ip += 1;
            }
            Opcode::CallBuiltin => {
                return builtins::dispatch(self, instr).map(|flow| {
                    if flow {
                        Flow::Next
                    } else {
                        Flow::ReturnToHost
                    }
                });
            }
            Opcode::Return => {
                let ret = self.pop().int_val();
                if ret == RETURN_FROM_FIBER {
                    self.fiber_mut().alive = false;
                    let parent = self.fiber().parent.expect("fiber has a parent");
                    self.cur = parent;
                } else {
                    let param_slots = instr.operand.int_val() as usize;
                    self.fiber_mut().remove(param_slots);
                    if ret == RETURN_FROM_VM {
                        return Ok(Flow::ReturnToHost);
                    }
                    self.fiber_mut().ip = ret as usize;
                }
            }
            Opcode::EnterFrame => {
                let layout_id = instr.operand.int_val() as usize;
                let local_slots = self.program.layouts[layout_id].local_var_slots as usize;
                self.check_stack(local_slots + 3)?;
                let fiber = self.fiber_mut();
                let old_base = fiber.base;
                fiber.push(Slot::from_int(old_base as i64));
                fiber.base = fiber.top - 1;
                fiber.push(Slot::from_int(0)); // frame ref count
                fiber.push(Slot::from_int(layout_id as i64));
                fiber.push_zeroed(local_slots);
                self.fire_hook(HookEvent::Call);
                self.fiber_mut().ip += 1;
            }
            Opcode::LeaveFrame => {
                let fiber = self.fiber();
                let frame_ref_cnt = fiber.slot(fiber.base + 1).int_val();
                if frame_ref_cnt != 0 {
                    return Err(self.error("Pointer to a local variable escapes from the function"));
                }
                self.fire_hook(HookEvent::Return);
                let fiber = self.fiber_mut();
                let old_base = fiber.base;
                fiber.base = fiber.slot(old_base).int_val() as usize;
                fiber.top = old_base;
                fiber.ip += 1;
            }
            Opcode::Halt => {
                self.terminated_normally = true;
                self.fibers[0].alive = false;
                return Ok(Flow::ReturnToHost);
            }
        }
        Ok(Flow::Next)
    }

    fn swap_top(&mut self) {
        let fiber = self.fiber_mut();
        let a = fiber.slot(fiber.top - 1);
        let b = fiber.slot(fiber.top - 2);
        fiber.set_slot(fiber.top - 1, b);
        fiber.set_slot(fiber.top - 2, a);
    }

    fn exec_unary(&mut self, instr: &Instruction) -> RuntimeResult<()> {
        let kind = instr.type_kind;
        match instr.tok_kind {
            Tok::Minus => {
                let top = self.fiber().top_slot();
                let result = if kind.is_real() {
                    Slot::from_real(-top.real_val())
                } else {
                    Slot::from_int(top.int_val().wrapping_neg())
                };
                self.fiber_mut().set_top_slot(result);
            }
            Tok::Not => {
                let top = self.fiber().top_slot();
                self.fiber_mut().set_top_slot(Slot::from_int((top.int_val() == 0) as i64));
            }
            Tok::Xor => {
                let top = self.fiber().top_slot();
                self.fiber_mut().set_top_slot(Slot::from_int(!top.int_val()));
            }
            Tok::PlusPlus | Tok::MinusMinus => {
                // In-place increment through a pointer on top.
                let ptr = self.pop().ptr_val();
                let old = self.load(ptr, kind)?;
                let delta = if instr.tok_kind == Tok::PlusPlus { 1 } else { -1 };
                let new = if kind == TypeKind::UInt {
                    Slot::from_uint(old.uint_val().wrapping_add(delta as u64))
                } else {
                    Slot::from_int(old.int_val().wrapping_add(delta))
                };
                self.store(ptr, kind, new, 0)?;
            }
            _ => return Err(self.error("Illegal instruction")),
        }
        Ok(())
    }

    fn exec_binary(&mut self, instr: &Instruction) -> RuntimeResult<()> {
        let type_id = instr.type_id.expect("binary op carries a type");
        let rhs = self.pop();
        let lhs = self.fiber().top_slot();
        let result = compare::binary_op(self, instr.tok_kind, lhs, rhs, type_id)?;
        self.fiber_mut().set_top_slot(result);
        Ok(())
    }
}
