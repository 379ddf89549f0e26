//! Disasm module - x86/x86-64 decoding
//!
//! Thin layer over iced-x86 that classifies control flow and extracts the
//! addresses an instruction references.

pub mod engine;

pub use engine::{Bitness, DisasmError, DisassembledInstruction, DisassemblyEngine, FlowKind};
