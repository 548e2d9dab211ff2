//! The code generator.
//!
//! Emits instructions as the parser walks the source, patching forward
//! jumps through a save/restore stack of instruction indices. Stubs are
//! `NOP`s overwritten once their destination is known, so the debug-info
//! stream stays in lockstep with the code.

use velac_lex::Tok;
use velac_sem::{BuiltinFn, TypeKind};
use velac_util::{DebugInfo, Ptr, TypeId};

use crate::data::DataSection;
use crate::instr::{Instruction, Opcode, ParamLayout, Register, Slot};

/// Jump contexts for `break`, `continue`, and `return`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GotosKind {
    Break,
    Continue,
    Return,
}

struct Gotos {
    stubs: Vec<usize>,
    block: usize,
}

pub struct CodeGen {
    pub code: Vec<Instruction>,
    pub debug: Vec<DebugInfo>,
    pub data: DataSection,
    pub layouts: Vec<ParamLayout>,
    save_stack: Vec<usize>,
    breaks: Vec<Gotos>,
    continues: Vec<Gotos>,
    returns: Vec<Gotos>,
    /// High-water mark of recorded jump destinations; peephole fusion must
    /// not touch an instruction a jump can land on.
    last_target: usize,
    cur_debug: DebugInfo,
}

impl CodeGen {
    pub fn new(debug: DebugInfo) -> Self {
        let mut gen = Self {
            code: Vec::with_capacity(1024),
            debug: Vec::with_capacity(1024),
            data: DataSection::new(),
            layouts: Vec::new(),
            save_stack: Vec::new(),
            breaks: Vec::new(),
            continues: Vec::new(),
            returns: Vec::new(),
            last_target: 0,
            cur_debug: debug,
        };
        // Entry offset 0 is never a valid function; an indirect call of an
        // undefined function traps here.
        gen.emit(Instruction::new(Opcode::Halt));
        gen
    }

    /// Snapshot of the lexer's debug record, taken per statement.
    pub fn set_debug(&mut self, debug: &DebugInfo) {
        self.cur_debug = debug.clone();
    }

    #[inline]
    pub fn ip(&self) -> usize {
        self.code.len()
    }

    fn emit(&mut self, instr: Instruction) {
        self.code.push(instr);
        self.debug.push(self.cur_debug.clone());
    }

    /// Overwrites a stub in place; the stub's debug record is kept.
    fn emit_at(&mut self, at: usize, instr: Instruction) {
        self.code[at] = instr;
    }

    fn fusable(&self) -> bool {
        !self.code.is_empty()
            && self.last_target < self.code.len()
            && self.code[self.code.len() - 1].inline_opcode == Opcode::Nop
    }

    fn mark_target(&mut self, dest: usize) {
        if dest > self.last_target {
            self.last_target = dest;
        }
    }

    // --- Save/restore stack for forward jump fix-ups

    pub fn save_pos(&mut self) {
        self.save_stack.push(self.ip());
    }

    pub fn restore_pos(&mut self) -> usize {
        self.save_stack.pop().expect("fix-up stack is empty")
    }

    fn stub(&mut self) -> usize {
        let at = self.ip();
        self.emit(Instruction::new(Opcode::Nop));
        at
    }

    fn fixup_goto(&mut self, at: usize, opcode: Opcode, dest: usize) {
        self.mark_target(dest);
        self.emit_at(at, Instruction::with_operand(opcode, Slot::from_int(dest as i64)));
    }

    // --- Stack manipulation

    pub fn push_int(&mut self, val: i64) {
        let mut instr = Instruction::with_operand(Opcode::Push, Slot::from_int(val));
        instr.type_kind = TypeKind::Int;
        self.emit(instr);
    }

    pub fn push_uint(&mut self, val: u64) {
        let mut instr = Instruction::with_operand(Opcode::Push, Slot::from_uint(val));
        instr.type_kind = TypeKind::UInt;
        self.emit(instr);
    }

    pub fn push_real(&mut self, val: f64) {
        let mut instr = Instruction::with_operand(Opcode::Push, Slot::from_real(val));
        instr.type_kind = TypeKind::Real;
        self.emit(instr);
    }

    pub fn push_ptr(&mut self, ptr: Ptr) {
        self.emit(Instruction::with_operand(Opcode::Push, Slot::from_ptr(ptr)));
    }

    pub fn push_global_ptr(&mut self, data_offset: u64) {
        self.push_ptr(Ptr::data(data_offset));
    }

    pub fn push_local_ptr(&mut self, offset: i64) {
        self.emit(Instruction::with_operand(Opcode::PushLocalPtr, Slot::from_int(offset)));
    }

    pub fn push_local_ptr_zero(&mut self, offset: i64, size: i64) {
        self.emit(Instruction::with_operand(
            Opcode::PushLocalPtrZero,
            Slot::from_i32_pair(offset as i32, size as i32),
        ));
    }

    pub fn push_local(&mut self, type_kind: TypeKind, offset: i64) {
        let mut instr = Instruction::with_operand(Opcode::PushLocal, Slot::from_int(offset));
        instr.type_kind = type_kind;
        self.emit(instr);
    }

    pub fn push_reg(&mut self, reg: Register) {
        self.emit(Instruction::with_operand(Opcode::PushReg, Slot::from_int(reg as i64)));
    }

    pub fn push_upvalue(&mut self, any_type: TypeId) {
        let mut instr = Instruction::new(Opcode::PushUpvalue);
        instr.type_id = Some(any_type);
        self.emit(instr);
    }

    pub fn push_zero(&mut self, slots: i64) {
        self.emit(Instruction::with_operand(Opcode::PushZero, Slot::from_int(slots)));
    }

    pub fn pop(&mut self, slots: i64) {
        self.emit(Instruction::with_operand(Opcode::Pop, Slot::from_int(slots)));
    }

    pub fn pop_reg(&mut self, reg: Register) {
        self.emit(Instruction::with_operand(Opcode::PopReg, Slot::from_int(reg as i64)));
    }

    pub fn dup(&mut self) {
        self.emit(Instruction::new(Opcode::Dup));
    }

    pub fn swap(&mut self) {
        self.emit(Instruction::new(Opcode::Swap));
    }

    pub fn zero(&mut self, size: i64) {
        self.emit(Instruction::with_operand(Opcode::Zero, Slot::from_int(size)));
    }

    // --- Memory

    /// Emits a typed load, fusing it into a preceding pointer producer
    /// where the VM supports an inline `DEREF`.
    pub fn deref(&mut self, type_kind: TypeKind) {
        if self.fusable() {
            let last = self.code.len() - 1;
            match self.code[last].opcode {
                Opcode::Push | Opcode::GetArrayPtr | Opcode::GetDynArrayPtr | Opcode::GetFieldPtr => {
                    self.code[last].inline_opcode = Opcode::Deref;
                    self.code[last].type_kind = type_kind;
                    return;
                }
                Opcode::PushLocalPtr => {
                    let offset = self.code[last].operand.int_val();
                    self.code[last] = {
                        let mut instr = Instruction::with_operand(Opcode::PushLocal, Slot::from_int(offset));
                        instr.type_kind = type_kind;
                        instr
                    };
                    return;
                }
                _ => {}
            }
        }
        let mut instr = Instruction::new(Opcode::Deref);
        instr.type_kind = type_kind;
        self.emit(instr);
    }

    /// Emits a typed store, fusing a preceding `SWAP`.
    pub fn assign(&mut self, type_kind: TypeKind, struct_size: i64) {
        let mut instr = Instruction::with_operand(Opcode::Assign, Slot::from_int(struct_size));
        instr.type_kind = type_kind;
        if self.fusable() && self.code[self.code.len() - 1].opcode == Opcode::Swap {
            instr.inline_opcode = Opcode::Swap;
            let last = self.code.len() - 1;
            self.code[last] = instr;
            return;
        }
        self.emit(instr);
    }

    /// Widens a value to slot alignment and stores it into parameter slots.
    pub fn assign_param(&mut self, type_kind: TypeKind, size: i64) {
        let mut instr = Instruction::with_operand(Opcode::AssignParam, Slot::from_int(size));
        instr.type_kind = type_kind;
        self.emit(instr);
    }

    // --- Reference counting

    pub fn change_ref_cnt(&mut self, op: Tok, type_id: TypeId) {
        let mut instr = Instruction::new(Opcode::ChangeRefCnt);
        instr.tok_kind = op;
        instr.type_id = Some(type_id);
        self.emit(instr);
    }

    pub fn change_ref_cnt_global(&mut self, op: Tok, data_offset: u64, type_id: TypeId) {
        let mut instr = Instruction::with_operand(Opcode::ChangeRefCntGlobal, Slot::from_ptr(Ptr::data(data_offset)));
        instr.tok_kind = op;
        instr.type_id = Some(type_id);
        self.emit(instr);
    }

    pub fn change_ref_cnt_local(&mut self, op: Tok, offset: i64, type_id: TypeId) {
        let mut instr = Instruction::with_operand(Opcode::ChangeRefCntLocal, Slot::from_int(offset));
        instr.tok_kind = op;
        instr.type_id = Some(type_id);
        self.emit(instr);
    }

    /// Increment the right-hand side, decrement the old left-hand side,
    /// then store. With `op == --`, the right-hand side is not incremented.
    pub fn change_ref_cnt_assign(&mut self, op: Tok, type_id: TypeId, struct_size: i64) {
        let mut instr = Instruction::with_operand(Opcode::ChangeRefCntAssign, Slot::from_int(struct_size));
        instr.tok_kind = op;
        instr.type_id = Some(type_id);
        if self.fusable() && self.code[self.code.len() - 1].opcode == Opcode::Swap {
            instr.inline_opcode = Opcode::Swap;
            let last = self.code.len() - 1;
            self.code[last] = instr;
            return;
        }
        self.emit(instr);
    }

    // --- Arithmetic

    pub fn unary(&mut self, op: Tok, type_kind: TypeKind) {
        let mut instr = Instruction::new(Opcode::Unary);
        instr.tok_kind = op;
        instr.type_kind = type_kind;
        self.emit(instr);
    }

    pub fn binary(&mut self, op: Tok, type_kind: TypeKind, type_id: TypeId) {
        let mut instr = Instruction::new(Opcode::Binary);
        instr.tok_kind = op;
        instr.type_kind = type_kind;
        instr.type_id = Some(type_id);
        self.emit(instr);
    }

    // --- Composite access

    /// `len < 0` means "use the string's stored length".
    pub fn get_array_ptr(&mut self, item_size: i64, len: i64) {
        self.emit(Instruction::with_operand(
            Opcode::GetArrayPtr,
            Slot::from_i32_pair(item_size as i32, len as i32),
        ));
    }

    pub fn get_dyn_array_ptr(&mut self) {
        self.emit(Instruction::new(Opcode::GetDynArrayPtr));
    }

    pub fn get_map_ptr(&mut self, map_type: TypeId) {
        let mut instr = Instruction::new(Opcode::GetMapPtr);
        instr.type_id = Some(map_type);
        self.emit(instr);
    }

    pub fn get_field_ptr(&mut self, field_offset: i64) {
        self.emit(Instruction::with_operand(Opcode::GetFieldPtr, Slot::from_int(field_offset)));
    }

    // --- Type assertions and weak pointers

    pub fn assert_type(&mut self, type_id: TypeId) {
        let mut instr = Instruction::new(Opcode::AssertType);
        instr.type_id = Some(type_id);
        self.emit(instr);
    }

    pub fn assert_range(&mut self, dest_kind: TypeKind, src_type: TypeId) {
        let mut instr = Instruction::new(Opcode::AssertRange);
        instr.type_kind = dest_kind;
        instr.type_id = Some(src_type);
        self.emit(instr);
    }

    pub fn weaken_ptr(&mut self) {
        self.emit(Instruction::new(Opcode::WeakenPtr));
    }

    pub fn strengthen_ptr(&mut self) {
        self.emit(Instruction::new(Opcode::StrengthenPtr));
    }

    // --- Control flow

    pub fn goto(&mut self, dest: usize) {
        self.mark_target(dest);
        self.emit(Instruction::with_operand(Opcode::Goto, Slot::from_int(dest as i64)));
    }

    pub fn goto_if(&mut self, dest: usize) {
        self.mark_target(dest);
        self.emit(Instruction::with_operand(Opcode::GotoIf, Slot::from_int(dest as i64)));
    }

    pub fn goto_if_not(&mut self, dest: usize) {
        self.mark_target(dest);
        self.emit(Instruction::with_operand(Opcode::GotoIfNot, Slot::from_int(dest as i64)));
    }

    /// Direct call. Returns the instruction index so calls to functions
    /// without a body yet can be patched once the entry is known.
    pub fn call(&mut self, entry: usize) -> usize {
        let at = self.ip();
        self.emit(Instruction::with_operand(Opcode::Call, Slot::from_int(entry as i64)));
        at
    }

    pub fn fixup_call(&mut self, at: usize, entry: usize) {
        self.code[at].operand = Slot::from_int(entry as i64);
    }

    pub fn call_indirect(&mut self, param_slots: i64) {
        self.emit(Instruction::with_operand(Opcode::CallIndirect, Slot::from_int(param_slots)));
    }

    pub fn call_extern(&mut self, extern_index: usize) {
        self.emit(Instruction::with_operand(Opcode::CallExtern, Slot::from_int(extern_index as i64)));
    }

    pub fn call_builtin(&mut self, builtin: BuiltinFn, type_kind: TypeKind, type_id: Option<TypeId>) {
        let mut instr = Instruction::with_operand(Opcode::CallBuiltin, Slot::from_uint(builtin as u64));
        instr.type_kind = type_kind;
        instr.type_id = type_id;
        self.emit(instr);
    }

    pub fn return_(&mut self, param_slots: i64) {
        self.emit(Instruction::with_operand(Opcode::Return, Slot::from_int(param_slots)));
    }

    pub fn halt(&mut self) {
        self.emit(Instruction::new(Opcode::Halt));
    }

    // --- Function frames

    /// Reserves the `ENTER_FRAME` slot; the layout is filled in by
    /// [`CodeGen::leave_frame_fixup`] once the body has been parsed.
    pub fn enter_frame_stub(&mut self) {
        self.save_pos();
        self.stub();
    }

    /// Patches the reserved `ENTER_FRAME` with the final layout and emits
    /// the matching `LEAVE_FRAME`.
    pub fn leave_frame_fixup(&mut self, layout: ParamLayout) -> usize {
        let layout_id = self.layouts.len();
        self.layouts.push(layout);
        let at = self.restore_pos();
        self.emit_at(
            at,
            Instruction::with_operand(Opcode::EnterFrame, Slot::from_int(layout_id as i64)),
        );
        self.emit(Instruction::new(Opcode::LeaveFrame));
        layout_id
    }

    /// Reserves a jump over a code region compiled out of the surrounding
    /// flow (a function literal body inside an expression).
    pub fn skip_prolog(&mut self) {
        self.save_pos();
        self.stub();
    }

    pub fn skip_epilog(&mut self) {
        let at = self.restore_pos();
        let dest = self.ip();
        self.fixup_goto(at, Opcode::Goto, dest);
    }

    // --- Conditionals

    /// cond; `GOTO_IF <then>`; stub "goto else/end"
    pub fn if_cond_epilog(&mut self) {
        let then_start = self.ip() + 2;
        self.goto_if(then_start);
        self.save_pos();
        self.stub();
    }

    pub fn else_prolog(&mut self) {
        let at = self.restore_pos();
        let else_start = self.ip() + 1;
        self.fixup_goto(at, Opcode::Goto, else_start);
        self.save_pos();
        self.stub();
    }

    pub fn if_epilog(&mut self) {
        let at = self.restore_pos();
        let end = self.ip();
        self.fixup_goto(at, Opcode::Goto, end);
    }

    pub fn if_else_epilog(&mut self) {
        self.if_epilog();
    }

    // --- Loops

    pub fn while_cond_prolog(&mut self) {
        self.mark_target(self.ip());
        self.save_pos();
    }

    pub fn while_cond_epilog(&mut self) {
        self.if_cond_epilog();
    }

    pub fn while_epilog(&mut self) {
        let end_stub = self.restore_pos();
        let cond_start = self.restore_pos();
        self.goto(cond_start);
        let end = self.ip();
        self.fixup_goto(end_stub, Opcode::Goto, end);
    }

    pub fn for_cond_prolog(&mut self) {
        self.mark_target(self.ip());
        self.save_pos();
    }

    /// Two stubs: "skip post-statement" (taken when the condition holds)
    /// and "goto statement end".
    pub fn for_cond_epilog(&mut self) {
        self.save_pos();
        self.stub();
        self.stub();
    }

    pub fn for_post_stmt_epilog(&mut self) {
        let cond_epilog = self.restore_pos();
        let cond_prolog = self.restore_pos();

        self.goto(cond_prolog);
        let body_start = self.ip();
        self.fixup_goto(cond_epilog, Opcode::GotoIf, body_start);
        self.save_stack.push(cond_epilog);
    }

    pub fn for_epilog(&mut self) {
        let cond_epilog = self.restore_pos();
        // Jump back to the post-statement, which sits right after the two
        // condition stubs.
        self.goto(cond_epilog + 2);
        let end = self.ip();
        self.fixup_goto(cond_epilog + 1, Opcode::Goto, end);
    }

    // --- Short-circuit && and ||

    /// `a && b == a ? b : a`, `a || b == (!a) ? b : a`.
    pub fn short_circuit_prolog(&mut self, op: Tok) {
        self.dup();
        self.pop_reg(Register::ExprList);
        if op == Tok::OrOr {
            self.unary(Tok::Not, TypeKind::Bool);
        }
        let rhs_start = self.ip() + 2;
        self.goto_if(rhs_start);
        self.save_pos();
        self.stub();
    }

    pub fn short_circuit_epilog(&mut self) {
        self.pop_reg(Register::ExprList);
        let at = self.restore_pos();
        let end = self.ip();
        self.fixup_goto(at, Opcode::Goto, end);
        self.push_reg(Register::ExprList);
    }

    // --- Switch

    pub fn switch_cond_epilog(&mut self) {
        self.pop_reg(Register::SwitchExpr);
    }

    /// After the selector register is loaded and a case constant has been
    /// pushed: compare and stub a jump into the case block.
    pub fn case_constant_check(&mut self, type_kind: TypeKind, type_id: TypeId) {
        self.binary(Tok::EqEq, type_kind, type_id);
        self.save_pos();
        self.stub();
    }

    /// Closes the constant list of one case: falls through to the next
    /// case, with the matching constants jumping over that goto.
    pub fn case_block_prolog(&mut self, num_case_constants: usize) {
        let mut stubs = Vec::with_capacity(num_case_constants);
        for _ in 0..num_case_constants {
            stubs.push(self.restore_pos());
        }
        self.save_pos();
        self.stub(); // goto next case
        let body_start = self.ip();
        for at in stubs {
            self.fixup_goto(at, Opcode::GotoIf, body_start);
        }
    }

    pub fn case_block_epilog(&mut self) {
        let next_case_stub = self.restore_pos();
        self.save_pos();
        self.stub(); // goto switch end
        let next_case = self.ip();
        self.fixup_goto(next_case_stub, Opcode::Goto, next_case);
    }

    pub fn switch_epilog(&mut self, num_cases: usize) {
        let end = self.ip();
        for _ in 0..num_cases {
            let at = self.restore_pos();
            self.fixup_goto(at, Opcode::Goto, end);
        }
    }

    // --- break/continue/return contexts

    fn gotos_mut(&mut self, kind: GotosKind) -> &mut Vec<Gotos> {
        match kind {
            GotosKind::Break => &mut self.breaks,
            GotosKind::Continue => &mut self.continues,
            GotosKind::Return => &mut self.returns,
        }
    }

    pub fn gotos_prolog(&mut self, kind: GotosKind, block: usize) {
        self.gotos_mut(kind).push(Gotos {
            stubs: Vec::new(),
            block,
        });
    }

    /// Emits a stub jump to be patched when the enclosing construct closes.
    pub fn gotos_add_stub(&mut self, kind: GotosKind) -> bool {
        let at = self.stub();
        match self.gotos_mut(kind).last_mut() {
            Some(gotos) => {
                gotos.stubs.push(at);
                true
            }
            None => false,
        }
    }

    pub fn gotos_block(&self, kind: GotosKind) -> Option<usize> {
        match kind {
            GotosKind::Break => &self.breaks,
            GotosKind::Continue => &self.continues,
            GotosKind::Return => &self.returns,
        }
        .last()
        .map(|g| g.block)
    }

    pub fn gotos_defined(&self, kind: GotosKind) -> bool {
        self.gotos_block(kind).is_some()
    }

    /// Patches every recorded jump of the innermost context to the current
    /// position and closes the context.
    pub fn gotos_epilog(&mut self, kind: GotosKind) {
        let dest = self.ip();
        self.gotos_epilog_to(kind, dest);
    }

    /// As [`CodeGen::gotos_epilog`], but with an explicit destination
    /// (`continue` in a `for` loop jumps to the post-statement, not to the
    /// loop end).
    pub fn gotos_epilog_to(&mut self, kind: GotosKind, dest: usize) {
        let gotos = self.gotos_mut(kind).pop().expect("gotos context is open");
        for at in gotos.stubs {
            self.fixup_goto(at, Opcode::Goto, dest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn new_gen() -> CodeGen {
        CodeGen::new(DebugInfo::new(Rc::from("test.vl")))
    }

    #[test]
    fn test_entry_guard() {
        let gen = new_gen();
        assert_eq!(gen.code[0].opcode, Opcode::Halt);
    }

    #[test]
    fn test_push_deref_fusion() {
        let mut gen = new_gen();
        gen.push_ptr(Ptr::data(24));
        gen.deref(TypeKind::Int);
        let last = gen.code.last().unwrap();
        assert_eq!(last.opcode, Opcode::Push);
        assert_eq!(last.inline_opcode, Opcode::Deref);
        assert_eq!(last.type_kind, TypeKind::Int);
    }

    #[test]
    fn test_push_local_ptr_deref_becomes_push_local() {
        let mut gen = new_gen();
        gen.push_local_ptr(24);
        gen.deref(TypeKind::Int);
        let last = gen.code.last().unwrap();
        assert_eq!(last.opcode, Opcode::PushLocal);
        assert_eq!(last.operand.int_val(), 24);
    }

    #[test]
    fn test_swap_assign_fusion() {
        let mut gen = new_gen();
        gen.push_int(1);
        gen.swap();
        gen.assign(TypeKind::Int, 0);
        let last = gen.code.last().unwrap();
        assert_eq!(last.opcode, Opcode::Assign);
        assert_eq!(last.inline_opcode, Opcode::Swap);
    }

    #[test]
    fn test_no_fusion_across_jump_target() {
        let mut gen = new_gen();
        gen.push_ptr(Ptr::data(24));
        // A loop head lands after the push; the deref must stay separate.
        gen.while_cond_prolog();
        gen.deref(TypeKind::Int);
        assert_eq!(gen.code.last().unwrap().opcode, Opcode::Deref);
        gen.restore_pos();
    }

    #[test]
    fn test_if_else_shape() {
        let mut gen = new_gen();
        // if c { push 10 } else { push 20 }
        gen.push_int(1); // pretend condition
        gen.if_cond_epilog();
        gen.push_int(10); // then
        gen.else_prolog();
        gen.push_int(20); // else
        gen.if_else_epilog();

        // GOTO_IF jumps over the else stub into the then block.
        let goto_if = &gen.code[2];
        assert_eq!(goto_if.opcode, Opcode::GotoIf);
        assert_eq!(goto_if.operand.int_val(), 4);
        // The else stub was patched to the else block.
        let to_else = &gen.code[3];
        assert_eq!(to_else.opcode, Opcode::Goto);
        assert_eq!(to_else.operand.int_val(), 6);
        // After the then block, jump to the end.
        let to_end = &gen.code[5];
        assert_eq!(to_end.opcode, Opcode::Goto);
        assert_eq!(to_end.operand.int_val(), 7);
    }

    #[test]
    fn test_while_shape() {
        let mut gen = new_gen();
        gen.while_cond_prolog();
        gen.push_int(1); // condition
        gen.while_cond_epilog();
        gen.push_int(2); // body
        gen.while_epilog();

        // cond at 1, GOTO_IF 4 (body), stub->end at 3, body at 4,
        // GOTO 1 at 5, end at 6
        assert_eq!(gen.code[2].opcode, Opcode::GotoIf);
        assert_eq!(gen.code[2].operand.int_val(), 4);
        assert_eq!(gen.code[3].opcode, Opcode::Goto);
        assert_eq!(gen.code[3].operand.int_val(), 6);
        assert_eq!(gen.code[5].opcode, Opcode::Goto);
        assert_eq!(gen.code[5].operand.int_val(), 1);
    }

    #[test]
    fn test_break_context() {
        let mut gen = new_gen();
        gen.gotos_prolog(GotosKind::Break, 1);
        assert!(gen.gotos_add_stub(GotosKind::Break));
        gen.push_int(0);
        gen.gotos_epilog(GotosKind::Break);

        assert_eq!(gen.code[1].opcode, Opcode::Goto);
        assert_eq!(gen.code[1].operand.int_val(), 3);
        assert!(!gen.gotos_defined(GotosKind::Break));
    }

    #[test]
    fn test_enter_frame_fixup() {
        let mut gen = new_gen();
        gen.enter_frame_stub();
        gen.push_int(0);
        let layout_id = gen.leave_frame_fixup(ParamLayout {
            param_slots: vec![2],
            num_param_slots: 2,
            has_result_ptr: false,
            local_var_slots: 3,
        });
        assert_eq!(layout_id, 0);
        assert_eq!(gen.code[1].opcode, Opcode::EnterFrame);
        assert_eq!(gen.code[1].operand.int_val(), 0);
        assert_eq!(gen.code.last().unwrap().opcode, Opcode::LeaveFrame);
        assert_eq!(gen.layouts[0].local_var_slots, 3);
    }

    #[test]
    fn test_short_circuit_shape() {
        let mut gen = new_gen();
        gen.push_int(1); // a
        gen.short_circuit_prolog(Tok::AndAnd);
        gen.push_int(0); // b
        gen.short_circuit_epilog();

        // DUP, POP_REG, GOTO_IF rhs, stub->end, rhs, POP_REG, PUSH_REG
        assert_eq!(gen.code[4].opcode, Opcode::GotoIf);
        assert_eq!(gen.code[4].operand.int_val(), 6);
        assert_eq!(gen.code[5].opcode, Opcode::Goto);
        assert_eq!(gen.code[5].operand.int_val(), 8);
        assert_eq!(gen.code.last().unwrap().opcode, Opcode::PushReg);
    }
}
