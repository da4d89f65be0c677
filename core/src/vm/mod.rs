//! The register-based stack-machine virtual machine ("terp") and everything
//! needed to feed it: instruction encoding, instruction blocks, the
//! assembler, and the foreign-function bridge.

pub mod assembler;
pub mod block;
pub mod ffi;
pub mod instruction;
pub mod terp;

pub use assembler::{Assembler, Segment, SegmentType, Symbol, SymbolType};
pub use block::{
    InstructionBlock, InstructionBlockType, Label, LabelRef, RegisterAllocator,
};
pub use ffi::{
    CallingMode, FfiType, FfiValue, ForeignFunction, SharedLibrary,
};
pub use instruction::{
    register_name, Instruction, OpCode, OpSize, Operand, OperandFlags,
    REGISTER_FP, REGISTER_FR, REGISTER_PC, REGISTER_SP, REGISTER_SR,
};
pub use terp::{HeapVector, RegisterFile, StatusFlags, Terp};
