//! Stack inspection
//!
//! Raw stack view (word-by-word from the stack pointer) and a frame-pointer
//! based backtrace.

use serde::{Deserialize, Serialize};

use crate::analysis::loader::SymbolTable;
use crate::core::memory::AddressSpace;
use crate::debug::types::RegisterState;

/// Bytes read at a stack word to preview what it points to
const POINTEE_PREVIEW_LEN: usize = 20;

/// Upper bound on frames walked
const MAX_FRAMES: usize = 256;

const WORD: u64 = 8;

/// Rendered when a frame's return address cannot be read
pub const UNAVAILABLE: &str = "<unavailable>";

/// One word of the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    /// `0x7ffd...(rsp+0x8)`
    pub indicator: String,
    /// The word, in hex
    pub value: String,
    /// `(ptr)symbol`, `(str)text`, or empty
    pub pointee: String,
}

/// One line of the backtrace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTraceEntry {
    /// Symbolized return address or `<unavailable>`
    pub return_address: String,
    /// `0x7ffd...(rsp+0x40)`
    pub frame_address: String,
}

/// Details of one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub index: usize,
    /// Program counter executing in this frame
    pub pc: u64,
    /// Canonical frame address (stack pointer before the call)
    pub frame_address: u64,
    /// Saved frame pointer slot
    pub saved_frame_pointer: Option<u64>,
    pub return_address: Option<u64>,
    /// Rendered summary
    pub description: String,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    pc: u64,
    frame_address: u64,
    saved_frame_pointer: Option<u64>,
    return_address: Option<u64>,
}

/// Walk saved frame pointers starting at `rbp`
fn walk(registers: &RegisterState, memory: &dyn AddressSpace) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pc = registers.rip;
    let mut fp = registers.rbp;

    while frames.len() < MAX_FRAMES && fp != 0 {
        let return_address = memory.read_u64(fp.wrapping_add(WORD));
        let next = memory.read_u64(fp);
        frames.push(Frame {
            pc,
            frame_address: fp.wrapping_add(2 * WORD),
            saved_frame_pointer: Some(fp),
            return_address,
        });
        match (return_address, next) {
            // Frames live at increasing addresses
            (Some(ret), Some(next)) if next > fp => {
                pc = ret;
                fp = next;
            }
            _ => break,
        }
    }

    if frames.is_empty() {
        frames.push(Frame {
            pc,
            frame_address: registers.rsp,
            saved_frame_pointer: None,
            return_address: None,
        });
    }
    frames
}

/// Word-by-word view of `scan_len` bytes above the stack pointer.
/// The scan stops at the first unreadable word.
pub fn stack_info(
    registers: &RegisterState,
    memory: &dyn AddressSpace,
    symbols: &SymbolTable,
    scan_len: usize,
) -> Vec<StackEntry> {
    let sp = registers.rsp;
    let mut entries = Vec::new();

    for offset in (0..scan_len as u64).step_by(WORD as usize) {
        let address = sp.wrapping_add(offset);
        let indicator = format!("{:#x}(rsp+{:#x})", address, offset);
        let Some(value) = memory.read_u64(address) else {
            log::debug!("Can't access the stack after address {}", indicator);
            break;
        };

        let preview = memory.read(value, POINTEE_PREVIEW_LEN);
        let pointee = if preview.data.is_empty() {
            String::new()
        } else if let Some(symbol) = symbols.symbolize(value) {
            format!("(ptr){}", symbol)
        } else {
            let text = String::from_utf8_lossy(&preview.data).replace('\u{FFFD}', "");
            format!("(str){}", text)
        };

        entries.push(StackEntry {
            indicator,
            value: format!("{:#x}", value),
            pointee,
        });
    }
    entries
}

/// Backtrace with frame addresses relative to the stack pointer
pub fn stack_trace(
    registers: &RegisterState,
    memory: &dyn AddressSpace,
    symbols: &SymbolTable,
) -> Vec<StackTraceEntry> {
    let sp = registers.rsp;
    walk(registers, memory)
        .into_iter()
        .map(|frame| StackTraceEntry {
            return_address: render_return(frame.return_address, symbols),
            frame_address: format!(
                "{:#x}(rsp+{:#x})",
                frame.frame_address,
                frame.frame_address.wrapping_sub(sp)
            ),
        })
        .collect()
}

/// Symbolized return address of every frame
pub fn frame_return_addresses(
    registers: &RegisterState,
    memory: &dyn AddressSpace,
    symbols: &SymbolTable,
) -> Vec<String> {
    walk(registers, memory)
        .into_iter()
        .map(|frame| render_return(frame.return_address, symbols))
        .collect()
}

/// Details of frame `index`; `None` if there is no such frame
pub fn frame_info(
    registers: &RegisterState,
    memory: &dyn AddressSpace,
    symbols: &SymbolTable,
    index: usize,
) -> Option<FrameInfo> {
    let frames = walk(registers, memory);
    let frame = frames.get(index)?;

    let mut description = format!(
        "Stack level {}, frame at {:#x}:\n rip = {}; saved rip = {}\n",
        index,
        frame.frame_address,
        symbols.describe(frame.pc),
        render_return(frame.return_address, symbols),
    );
    if index > 0 {
        description.push_str(&format!(
            " caller of frame at {:#x}\n",
            frames[index - 1].frame_address
        ));
    }
    if let Some(next) = frames.get(index + 1) {
        description.push_str(&format!(" called by frame at {:#x}\n", next.frame_address));
    }
    if let Some(fp) = frame.saved_frame_pointer {
        description.push_str(&format!(
            " Saved registers:\n  rbp at {:#x}, rip at {:#x}\n",
            fp,
            fp.wrapping_add(WORD)
        ));
    }

    Some(FrameInfo {
        index,
        pc: frame.pc,
        frame_address: frame.frame_address,
        saved_frame_pointer: frame.saved_frame_pointer,
        return_address: frame.return_address,
        description,
    })
}

fn render_return(address: Option<u64>, symbols: &SymbolTable) -> String {
    match address {
        Some(address) => symbols.describe(address),
        None => UNAVAILABLE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::loader::{FunctionKind, FunctionSymbol};
    use crate::core::memory::MemoryImage;

    fn words(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn symbols() -> SymbolTable {
        SymbolTable::from_symbols(vec![FunctionSymbol {
            name: "main".into(),
            address: 0x401000,
            size: 0x100,
            kind: FunctionKind::Defined,
        }])
    }

    /// Two frames: inner at 0x7000 (saved rbp -> 0x7020), outer at 0x7020
    /// whose saved rbp is 0, ending the chain.
    fn fixture() -> (RegisterState, MemoryImage) {
        let mut stack = words(&[0x7020, 0x401010, 0, 0]);
        stack.extend(words(&[0, 0x401080, 0, 0]));
        let image = MemoryImage::new()
            .with_segment(0x7000, &stack)
            .with_segment(0x401000, b"hello, stack world!!!");
        let registers = RegisterState {
            rip: 0x401005,
            rsp: 0x7000,
            rbp: 0x7000,
            ..Default::default()
        };
        (registers, image)
    }

    #[test]
    fn test_stack_info_stops_at_unreadable_word() {
        let (registers, image) = fixture();
        let entries = stack_info(&registers, &image, &symbols(), 4096);
        assert_eq!(entries.len(), 8);
        assert_eq!(entries[0].indicator, "0x7000(rsp+0x0)");
        assert_eq!(entries[1].value, "0x401010");
        assert_eq!(entries[1].pointee, "(ptr)main+16");
        assert_eq!(entries[2].pointee, "");
    }

    #[test]
    fn test_stack_trace_walks_frame_pointers() {
        let (registers, image) = fixture();
        let trace = stack_trace(&registers, &image, &symbols());
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].return_address, "0x401010 <main+16>");
        assert_eq!(trace[0].frame_address, "0x7010(rsp+0x10)");
        assert_eq!(trace[1].return_address, "0x401080 <main+128>");
    }

    #[test]
    fn test_frame_info_out_of_range_is_none() {
        let (registers, image) = fixture();
        assert!(frame_info(&registers, &image, &symbols(), 5).is_none());
        let frame = frame_info(&registers, &image, &symbols(), 1).unwrap();
        assert_eq!(frame.pc, 0x401010);
        assert!(frame.description.contains("caller of frame at 0x7010"));
    }

    #[test]
    fn test_missing_frame_pointer_falls_back_to_stack_pointer() {
        let registers = RegisterState {
            rsp: 0x9000,
            ..Default::default()
        };
        let trace = frame_return_addresses(&registers, &MemoryImage::new(), &symbols());
        assert_eq!(trace, vec![UNAVAILABLE.to_string()]);
    }
}
