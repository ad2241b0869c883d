// Lunar Compiler Module
// Lowers resolved syntax trees to flat bytecode

mod compiler;
pub mod instruction;
pub mod opcode;

pub use compiler::Compiler;
pub use instruction::{disassemble, Instruction};
pub use opcode::OpCode;
