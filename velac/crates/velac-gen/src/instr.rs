//! Instructions, slots, frame layouts, and the compiled program.

use velac_lex::Tok;
use velac_sem::{Types, TypeKind};
use velac_util::{DebugInfo, Ptr, TypeId};

/// Return-address sentinel: the frame was pushed by the embedder's `call`
/// API; the dispatch loop returns control to the host.
pub const RETURN_FROM_VM: i64 = -2;

/// Return-address sentinel: the fiber's last frame; the fiber dies.
pub const RETURN_FROM_FIBER: i64 = -1;

/// The per-fiber register file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Register {
    Result = 0,
    Self_ = 1,
    HeapCopy = 2,
    SwitchExpr = 3,
    ExprList = 4,
}

pub const NUM_REGS: usize = 5;

/// The 64-bit tagless union used for the VM stack, registers, and
/// instruction operands.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Slot(pub u64);

impl Slot {
    #[inline]
    pub fn from_int(v: i64) -> Slot {
        Slot(v as u64)
    }

    #[inline]
    pub fn from_uint(v: u64) -> Slot {
        Slot(v)
    }

    #[inline]
    pub fn from_real(v: f64) -> Slot {
        Slot(v.to_bits())
    }

    #[inline]
    pub fn from_ptr(p: Ptr) -> Slot {
        Slot(p.0)
    }

    /// Packs two 32-bit values into one slot.
    #[inline]
    pub fn from_i32_pair(a: i32, b: i32) -> Slot {
        Slot((a as u32 as u64) | ((b as u32 as u64) << 32))
    }

    #[inline]
    pub fn int_val(self) -> i64 {
        self.0 as i64
    }

    #[inline]
    pub fn uint_val(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn real_val(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline]
    pub fn ptr_val(self) -> Ptr {
        Ptr(self.0)
    }

    #[inline]
    pub fn i32_pair(self) -> (i32, i32) {
        (self.0 as u32 as i32, (self.0 >> 32) as u32 as i32)
    }

    #[inline]
    pub fn bool_val(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slot({:#x})", self.0)
    }
}

/// VM opcodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Opcode {
    #[default]
    Nop,
    Push,
    PushZero,
    PushLocalPtr,
    PushLocalPtrZero,
    PushLocal,
    PushReg,
    PushUpvalue,
    Pop,
    PopReg,
    Dup,
    Swap,
    Zero,
    Deref,
    Assign,
    AssignParam,
    ChangeRefCnt,
    ChangeRefCntGlobal,
    ChangeRefCntLocal,
    ChangeRefCntAssign,
    Unary,
    Binary,
    GetArrayPtr,
    GetDynArrayPtr,
    GetMapPtr,
    GetFieldPtr,
    AssertType,
    AssertRange,
    WeakenPtr,
    StrengthenPtr,
    Goto,
    GotoIf,
    GotoIfNot,
    Call,
    CallIndirect,
    CallExtern,
    CallBuiltin,
    Return,
    EnterFrame,
    LeaveFrame,
    Halt,
}

impl Opcode {
    pub fn spelling(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Push => "PUSH",
            Opcode::PushZero => "PUSH_ZERO",
            Opcode::PushLocalPtr => "PUSH_LOCAL_PTR",
            Opcode::PushLocalPtrZero => "PUSH_LOCAL_PTR_ZERO",
            Opcode::PushLocal => "PUSH_LOCAL",
            Opcode::PushReg => "PUSH_REG",
            Opcode::PushUpvalue => "PUSH_UPVALUE",
            Opcode::Pop => "POP",
            Opcode::PopReg => "POP_REG",
            Opcode::Dup => "DUP",
            Opcode::Swap => "SWAP",
            Opcode::Zero => "ZERO",
            Opcode::Deref => "DEREF",
            Opcode::Assign => "ASSIGN",
            Opcode::AssignParam => "ASSIGN_PARAM",
            Opcode::ChangeRefCnt => "CHANGE_REF_CNT",
            Opcode::ChangeRefCntGlobal => "CHANGE_REF_CNT_GLOBAL",
            Opcode::ChangeRefCntLocal => "CHANGE_REF_CNT_LOCAL",
            Opcode::ChangeRefCntAssign => "CHANGE_REF_CNT_ASSIGN",
            Opcode::Unary => "UNARY",
            Opcode::Binary => "BINARY",
            Opcode::GetArrayPtr => "GET_ARRAY_PTR",
            Opcode::GetDynArrayPtr => "GET_DYNARRAY_PTR",
            Opcode::GetMapPtr => "GET_MAP_PTR",
            Opcode::GetFieldPtr => "GET_FIELD_PTR",
            Opcode::AssertType => "ASSERT_TYPE",
            Opcode::AssertRange => "ASSERT_RANGE",
            Opcode::WeakenPtr => "WEAKEN_PTR",
            Opcode::StrengthenPtr => "STRENGTHEN_PTR",
            Opcode::Goto => "GOTO",
            Opcode::GotoIf => "GOTO_IF",
            Opcode::GotoIfNot => "GOTO_IF_NOT",
            Opcode::Call => "CALL",
            Opcode::CallIndirect => "CALL_INDIRECT",
            Opcode::CallExtern => "CALL_EXTERN",
            Opcode::CallBuiltin => "CALL_BUILTIN",
            Opcode::Return => "RETURN",
            Opcode::EnterFrame => "ENTER_FRAME",
            Opcode::LeaveFrame => "LEAVE_FRAME",
            Opcode::Halt => "HALT",
        }
    }
}

/// One bytecode instruction.
///
/// `inline_opcode` holds a second fused opcode for the peephole cases
/// (`PUSH` + `DEREF`, `SWAP` + `ASSIGN`); it is `Nop` otherwise.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub inline_opcode: Opcode,
    pub tok_kind: Tok,
    pub type_kind: TypeKind,
    pub type_id: Option<TypeId>,
    pub operand: Slot,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            inline_opcode: Opcode::Nop,
            tok_kind: Tok::None,
            type_kind: TypeKind::None,
            type_id: None,
            operand: Slot::default(),
        }
    }

    pub fn with_operand(opcode: Opcode, operand: Slot) -> Self {
        Self {
            operand,
            ..Self::new(opcode)
        }
    }
}

/// Parameter-and-local frame layout, referenced by `ENTER_FRAME` operands.
#[derive(Clone, Debug, Default)]
pub struct ParamLayout {
    /// Slot count of every parameter, in declaration order (the hidden
    /// upvalue parameter included).
    pub param_slots: Vec<i64>,
    /// Total parameter slots.
    pub num_param_slots: i64,
    /// Whether the last parameter is the hidden pointer through which a
    /// structured result is returned.
    pub has_result_ptr: bool,
    /// Slots to reserve for local variables.
    pub local_var_slots: i64,
}

/// An exported function callable through the embedding API.
#[derive(Clone, Debug)]
pub struct ExportedFn {
    pub name: String,
    pub entry: usize,
    pub param_slots: usize,
    pub has_result: bool,
}

/// A compiled program: everything the VM needs to run.
#[derive(Debug)]
pub struct Program {
    pub code: Vec<Instruction>,
    pub debug: Vec<DebugInfo>,
    pub layouts: Vec<ParamLayout>,
    /// Globals and literal pool image, copied into the VM at reset.
    pub data: Vec<u8>,
    pub types: Types,
    /// The `any` interface type, needed by conversions at run time.
    pub any_type: TypeId,
    pub fiber_type: TypeId,
    pub str_type: TypeId,
    /// Hidden initializer thunks, in execution order, then `main`.
    pub init_entries: Vec<usize>,
    pub main_entry: Option<usize>,
    /// Names of host functions, in `CALL_EXTERN` operand order.
    pub extern_names: Vec<String>,
    /// Functions resolvable by name through the embedding API.
    pub exported_fns: Vec<ExportedFn>,
}

/// Renders one instruction as an assembly listing line:
/// `ip line opcode [tok] [type] [operand] [; inline]`.
pub fn asm_line(ip: usize, instr: &Instruction, debug: &DebugInfo) -> String {
    let mut line = format!("{ip:6} {:6} {:24}", debug.line, instr.opcode.spelling());
    if instr.tok_kind != Tok::None {
        line += &format!(" {:8}", instr.tok_kind.spelling());
    }
    if instr.type_kind != TypeKind::None {
        line += &format!(" {:8}", instr.type_kind.spelling());
    }
    if let Some(type_id) = instr.type_id {
        line += &format!(" t{}", type_id.0);
    }
    match instr.opcode {
        Opcode::Push if instr.type_kind == TypeKind::Real => {
            line += &format!(" {}", instr.operand.real_val());
        }
        Opcode::Nop | Opcode::Dup | Opcode::Swap | Opcode::LeaveFrame | Opcode::Halt => {}
        _ => line += &format!(" {}", instr.operand.int_val()),
    }
    if instr.inline_opcode != Opcode::Nop {
        line += &format!(" ; {}", instr.inline_opcode.spelling());
    }
    line
}

impl Program {
    /// The human-readable assembly listing written by the `-asm` flag.
    pub fn asm_listing(&self) -> String {
        let mut out = String::new();
        for (ip, instr) in self.code.iter().enumerate() {
            out.push_str(&asm_line(ip, instr, &self.debug[ip]));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_roundtrips() {
        assert_eq!(Slot::from_int(-5).int_val(), -5);
        assert_eq!(Slot::from_uint(u64::MAX).uint_val(), u64::MAX);
        assert_eq!(Slot::from_real(2.5).real_val(), 2.5);
        let p = Ptr::heap(3, 64);
        assert_eq!(Slot::from_ptr(p).ptr_val(), p);
    }

    #[test]
    fn test_slot_i32_pair() {
        let s = Slot::from_i32_pair(-7, 1000);
        assert_eq!(s.i32_pair(), (-7, 1000));
    }

    #[test]
    fn test_instruction_defaults() {
        let instr = Instruction::new(Opcode::Push);
        assert_eq!(instr.inline_opcode, Opcode::Nop);
        assert_eq!(instr.tok_kind, Tok::None);
        assert!(instr.type_id.is_none());
    }
}
