//! Value types
//!
//! Decodes raw target memory as one of the value types offered by the
//! referenced-strings view.

use serde::{Deserialize, Serialize};

use super::memory::AddressSpace;

/// Bytes read for string and byte-array values
pub const STRING_READ_LEN: usize = 64;
pub const BYTE_ARRAY_READ_LEN: usize = 10;

/// How a referenced address should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    #[default]
    StringUtf8,
    StringUtf16,
    ByteArray,
}

impl ValueType {
    fn read_len(self) -> usize {
        match self {
            ValueType::Int8 => 1,
            ValueType::Int16 => 2,
            ValueType::Int32 | ValueType::Float32 => 4,
            ValueType::Int64 | ValueType::Float64 => 8,
            ValueType::StringUtf8 | ValueType::StringUtf16 => STRING_READ_LEN,
            ValueType::ByteArray => BYTE_ARRAY_READ_LEN,
        }
    }

    /// Read and render the value at `address`; `None` if unreadable
    pub fn read(self, memory: &dyn AddressSpace, address: u64) -> Option<String> {
        let read = memory.read(address, self.read_len());
        self.decode(&read.data)
    }

    /// Render `bytes` as this type; `None` if too short
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        let fixed = |n: usize| bytes.get(..n);
        match self {
            ValueType::Int8 => fixed(1).map(|b| (b[0] as i8).to_string()),
            ValueType::Int16 => fixed(2).map(|b| i16::from_le_bytes([b[0], b[1]]).to_string()),
            ValueType::Int32 => fixed(4)
                .and_then(|b| b.try_into().ok())
                .map(|b| i32::from_le_bytes(b).to_string()),
            ValueType::Int64 => fixed(8)
                .and_then(|b| b.try_into().ok())
                .map(|b| i64::from_le_bytes(b).to_string()),
            ValueType::Float32 => fixed(4)
                .and_then(|b| b.try_into().ok())
                .map(|b| f32::from_le_bytes(b).to_string()),
            ValueType::Float64 => fixed(8)
                .and_then(|b| b.try_into().ok())
                .map(|b| f64::from_le_bytes(b).to_string()),
            ValueType::StringUtf8 => {
                if bytes.is_empty() {
                    return None;
                }
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            ValueType::StringUtf16 => {
                if bytes.len() < 2 {
                    return None;
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .take_while(|&u| u != 0)
                    .collect();
                Some(String::from_utf16_lossy(&units))
            }
            ValueType::ByteArray => {
                if bytes.is_empty() {
                    return None;
                }
                Some(
                    bytes
                        .iter()
                        .map(|b| hex::encode([*b]))
                        .collect::<Vec<_>>()
                        .join(" "),
                )
            }
        }
    }
}
