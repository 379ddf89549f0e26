//! Disassembly Engine - iced-x86 Backend
//!
//! Decodes x86/x86-64 machine code into structured instructions, classifies
//! control flow, and extracts the address an instruction refers to (branch
//! target, absolute or RIP-relative memory operand, or address-sized
//! immediate).

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, Instruction, NasmFormatter, OpKind, Register,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::memory::AddressSpace;

/// Longest possible x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Disassembly errors
#[derive(Error, Debug)]
pub enum DisasmError {
    #[error("Nothing to decode at {address:#x}")]
    EmptyInput { address: u64 },

    #[error("Unsupported bitness: {0}")]
    UnsupportedBitness(u32),
}

/// Target architecture bitness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Bitness {
    Bit16 = 16,
    Bit32 = 32,
    #[default]
    Bit64 = 64,
}

impl Bitness {
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Result<Self, DisasmError> {
        match bits {
            16 => Ok(Bitness::Bit16),
            32 => Ok(Bitness::Bit32),
            64 => Ok(Bitness::Bit64),
            other => Err(DisasmError::UnsupportedBitness(other)),
        }
    }
}

/// Control-flow class of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowKind {
    /// Falls through to the next instruction
    Sequential,
    /// Conditional/unconditional jump or loop form
    Jump,
    /// Call form
    Call,
    /// Return form
    Return,
    /// Interrupts, exceptions, transactional aborts
    Other,
}

impl From<FlowControl> for FlowKind {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::Next => FlowKind::Sequential,
            FlowControl::UnconditionalBranch
            | FlowControl::ConditionalBranch
            | FlowControl::IndirectBranch => FlowKind::Jump,
            FlowControl::Call | FlowControl::IndirectCall => FlowKind::Call,
            FlowControl::Return => FlowKind::Return,
            _ => FlowKind::Other,
        }
    }
}

/// A single disassembled instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    /// Address of the instruction
    pub address: u64,

    /// Raw bytes of the instruction
    pub bytes: Vec<u8>,

    /// Formatted instruction, e.g. `mov eax, [rbx+0x4]`
    pub text: String,

    /// Lowercase mnemonic, e.g. `jne`
    pub mnemonic: String,

    /// Control-flow class
    pub flow: FlowKind,

    /// Address referenced by an operand, if any
    pub referenced_address: Option<u64>,

    /// Whether the bytes failed to decode
    pub invalid: bool,
}

impl DisassembledInstruction {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the following instruction
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.bytes.len() as u64)
    }

    pub fn is_call(&self) -> bool {
        self.flow == FlowKind::Call
    }

}

/// Main disassembly engine
pub struct DisassemblyEngine {
    /// Target architecture bitness
    bitness: Bitness,
}

impl DisassemblyEngine {
    /// Create a new disassembly engine with default settings (64-bit)
    pub fn new() -> Self {
        Self {
            bitness: Bitness::Bit64,
        }
    }

    /// Create a new engine with specified bitness
    pub fn with_bitness(bitness: Bitness) -> Self {
        Self { bitness }
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn formatter() -> NasmFormatter {
        let mut formatter = NasmFormatter::new();
        let options = formatter.options_mut();
        options.set_hex_prefix("0x");
        options.set_hex_suffix("");
        options.set_uppercase_hex(false);
        options.set_space_after_operand_separator(true);
        formatter
    }

    /// Disassemble a buffer of bytes.
    ///
    /// Undecodable bytes come back as `invalid` one-byte entries so the
    /// stream stays aligned with the input.
    pub fn disassemble(
        &self,
        bytes: &[u8],
        base_address: u64,
    ) -> Result<Vec<DisassembledInstruction>, DisasmError> {
        if bytes.is_empty() {
            return Err(DisasmError::EmptyInput {
                address: base_address,
            });
        }

        let mut decoder = Decoder::with_ip(
            self.bitness.bits(),
            bytes,
            base_address,
            DecoderOptions::NONE,
        );
        let mut formatter = Self::formatter();
        let mut instruction = Instruction::default();
        let mut result = Vec::new();

        while decoder.can_decode() {
            let position = decoder.position();
            decoder.decode_out(&mut instruction);
            let length = instruction.len().max(1);
            let raw = &bytes[position..(position + length).min(bytes.len())];
            result.push(self.convert(&instruction, raw, &mut formatter));
            if instruction.is_invalid() && instruction.len() == 0 {
                // Never stall on a zero-length decode
                let _ = decoder.set_position(position + 1);
                decoder.set_ip(base_address.wrapping_add(position as u64 + 1));
            }
        }

        Ok(result)
    }

    fn convert(
        &self,
        instruction: &Instruction,
        raw: &[u8],
        formatter: &mut NasmFormatter,
    ) -> DisassembledInstruction {
        if instruction.is_invalid() {
            return DisassembledInstruction {
                address: instruction.ip(),
                bytes: raw.to_vec(),
                text: "(bad)".to_string(),
                mnemonic: "(bad)".to_string(),
                flow: FlowKind::Other,
                referenced_address: None,
                invalid: true,
            };
        }

        let mut text = String::new();
        formatter.format(instruction, &mut text);

        DisassembledInstruction {
            address: instruction.ip(),
            bytes: raw.to_vec(),
            text,
            mnemonic: format!("{:?}", instruction.mnemonic()).to_lowercase(),
            flow: instruction.flow_control().into(),
            referenced_address: referenced_address(instruction),
            invalid: false,
        }
    }

    /// Disassemble a single instruction at the given address
    pub fn disassemble_one(&self, bytes: &[u8], address: u64) -> Option<DisassembledInstruction> {
        let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)];
        self.disassemble(window, address).ok()?.into_iter().next()
    }

    /// Decode the instruction at `address` in live memory
    pub fn decode_at(
        &self,
        memory: &dyn AddressSpace,
        address: u64,
    ) -> Option<DisassembledInstruction> {
        let read = memory.read(address, MAX_INSTRUCTION_LEN);
        self.disassemble_one(&read.data, address)
    }

    /// Decode every instruction starting in `[start, start + length)`
    pub fn disassemble_range(
        &self,
        memory: &dyn AddressSpace,
        start: u64,
        length: usize,
    ) -> Vec<DisassembledInstruction> {
        let read = memory.read(start, length);
        self.disassemble(&read.data, start).unwrap_or_default()
    }

    /// Best-effort address of the instruction that ends at `pc`, found by
    /// decoding backwards from up to `window` bytes before it. Start offsets
    /// whose decoding lands exactly on `pc` win; otherwise the last
    /// instruction before `pc` from the widest readable window is used.
    pub fn previous_instruction(
        &self,
        memory: &dyn AddressSpace,
        pc: u64,
        window: u64,
    ) -> Option<u64> {
        let mut fallback = None;
        for back in (1..=window.min(pc)).rev() {
            let start = pc - back;
            let read = memory.read(start, back as usize);
            if !read.is_complete() {
                continue;
            }
            let Ok(instructions) = self.disassemble(&read.data, start) else {
                continue;
            };
            let Some(last) = instructions.iter().rev().find(|insn| insn.address < pc) else {
                continue;
            };
            if last.invalid {
                continue;
            }
            if last.next_address() == pc {
                return Some(last.address);
            }
            fallback.get_or_insert(last.address);
        }
        fallback
    }
}

impl Default for DisassemblyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// First address-looking operand of an instruction
fn referenced_address(instruction: &Instruction) -> Option<u64> {
    for operand in 0..instruction.op_count() {
        match instruction.op_kind(operand) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                return Some(instruction.near_branch_target());
            }
            OpKind::Memory => {
                if matches!(instruction.memory_segment(), Register::FS | Register::GS) {
                    continue;
                }
                if instruction.is_ip_rel_memory_operand() {
                    return Some(instruction.ip_rel_memory_address());
                }
                if instruction.memory_base() == Register::None
                    && instruction.memory_index() == Register::None
                {
                    return Some(instruction.memory_displacement64());
                }
            }
            OpKind::Immediate32 | OpKind::Immediate64 | OpKind::Immediate32to64 => {
                return Some(instruction.immediate(operand));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryImage;

    #[test]
    fn test_classifies_flow() {
        // call +0; jne +2; ret; nop
        let code = [0xE8, 0x00, 0x00, 0x00, 0x00, 0x75, 0x02, 0xC3, 0x90];
        let insns = DisassemblyEngine::new().disassemble(&code, 0x1000).unwrap();
        let flows: Vec<FlowKind> = insns.iter().map(|i| i.flow).collect();
        assert_eq!(
            flows,
            vec![FlowKind::Call, FlowKind::Jump, FlowKind::Return, FlowKind::Sequential]
        );
        assert_eq!(insns[0].referenced_address, Some(0x1005));
        assert_eq!(insns[1].referenced_address, Some(0x1009));
        assert_eq!(insns[1].mnemonic, "jne");
    }

    #[test]
    fn test_rip_relative_and_immediate_references() {
        // lea rdi, [rip+0x10]; mov esi, 0x3000
        let code = [0x48, 0x8D, 0x3D, 0x10, 0x00, 0x00, 0x00, 0xBE, 0x00, 0x30, 0x00, 0x00];
        let insns = DisassemblyEngine::new().disassemble(&code, 0x1000).unwrap();
        assert_eq!(insns[0].referenced_address, Some(0x1017));
        assert_eq!(insns[1].referenced_address, Some(0x3000));
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(DisassemblyEngine::new().disassemble(&[], 0).is_err());
    }

    #[test]
    fn test_previous_instruction() {
        // push rbp; mov rbp, rsp; nop
        let image = MemoryImage::new().with_segment(0x1000, &[0x55, 0x48, 0x89, 0xE5, 0x90]);
        let engine = DisassemblyEngine::new();
        assert_eq!(engine.previous_instruction(&image, 0x1004, 4), Some(0x1001));
        assert_eq!(engine.previous_instruction(&image, 0x1000, 0x2000), None);
    }
}
