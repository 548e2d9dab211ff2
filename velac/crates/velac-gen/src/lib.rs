//! velac-gen - Bytecode instructions and the code generator.
//!
//! The generator owns the linear instruction buffer, the parallel
//! debug-info stream, the jump fix-up stack, and the data section that
//! holds globals and literals. The parser drives it directly; there is no
//! intermediate representation.

mod data;
mod gen;
mod instr;

pub use data::{DataSection, EMPTY_SENTINEL};
pub use gen::{CodeGen, GotosKind};
pub use instr::{
    asm_line, ExportedFn, Instruction, Opcode, ParamLayout, Program, Register, Slot, NUM_REGS,
    RETURN_FROM_FIBER, RETURN_FROM_VM,
};
