//! x86-64 instruction encoder and executable-memory arena for the JIT.
//!
//! The emitter is single-ISA by design: compiled functions are sequences of
//! calls into C-ABI runtime helpers plus direct branches, so the instruction
//! subset stays small.

mod code;
mod x64;

pub use code::CodeArena;
pub use x64::{Assembler, AssemblerError, Label, Reg};
