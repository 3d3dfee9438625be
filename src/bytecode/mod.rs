//! Bytecode model for the directive VM.
//!
//! # Architecture
//!
//! - `instruction`: opcode set, the two-field instruction encoding and `CallSpec`
//! - `module`: code objects, constant pools and module objects
//! - `disassembler`: debug output for bytecode inspection

pub mod disassembler;
pub mod instruction;
pub mod module;

pub use disassembler::disassemble_module;
pub use instruction::{CallSpec, Instruction, OpCode};
pub use module::{CodeObject, CodeRef, Constant, ModuleObject, Symbol};
