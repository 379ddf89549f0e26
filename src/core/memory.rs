//! Memory - Process memory operations
//!
//! Provides fault-tolerant reads over a target's address space, the process
//! map, and an in-memory image used for offline analysis. A read that faults
//! part-way returns the readable prefix instead of failing the caller.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rendering of a byte that could not be read
pub const UNREADABLE_BYTE: &str = "??";

/// Largest single read; longer requests are clamped to it
pub const MAX_READ_LEN: usize = 0x100_0000;

/// Memory operation errors
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("Process map unavailable for {pid}: {reason}")]
    MapsUnavailable { pid: u32, reason: String },

    #[error("No process attached")]
    NoProcess,
}

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryProtection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MemoryProtection {
    pub const RX: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const RW: Self = Self {
        read: true,
        write: true,
        execute: false,
    };

    /// Parse the `rwxp` column of a process map line
    pub fn from_perms(perms: &str) -> Self {
        let bytes = perms.as_bytes();
        Self {
            read: bytes.first() == Some(&b'r'),
            write: bytes.get(1) == Some(&b'w'),
            execute: bytes.get(2) == Some(&b'x'),
        }
    }
}

/// Snapshot of one mapping in the target process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// Start address (inclusive)
    pub start: u64,
    /// End address (exclusive)
    pub end: u64,
    /// Permission string as shown by the process map, e.g. `r-xp`
    pub permissions: String,
    /// Backing file, pseudo path like `[heap]`, or empty
    pub backing_path: String,
    /// Offset of the mapping into the backing file
    #[serde(default)]
    pub offset: u64,
}

impl MemoryRegion {
    pub fn new(start: u64, end: u64, permissions: &str, backing_path: &str) -> Self {
        debug_assert!(start < end, "empty region {:#x}-{:#x}", start, end);
        Self {
            start,
            end,
            permissions: permissions.to_string(),
            backing_path: backing_path.to_string(),
            offset: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn protection(&self) -> MemoryProtection {
        MemoryProtection::from_perms(&self.permissions)
    }

    pub fn is_executable(&self) -> bool {
        self.protection().execute
    }

    /// `start-end` in the process map's notation
    pub fn range_label(&self) -> String {
        format!("{:x}-{:x}", self.start, self.end)
    }

    /// Parse one line of `/proc/<pid>/maps`
    pub fn parse_maps_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let permissions = fields.next()?;
        let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
        let _device = fields.next()?;
        let _inode = fields.next()?;
        let backing_path = fields.collect::<Vec<_>>().join(" ");

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        if start >= end {
            return None;
        }

        Some(Self {
            start,
            end,
            permissions: permissions.to_string(),
            backing_path,
            offset,
        })
    }
}

/// Parse the whole text of a process map
pub fn parse_maps(text: &str) -> Vec<MemoryRegion> {
    text.lines().filter_map(MemoryRegion::parse_maps_line).collect()
}

/// Result of a read that may have faulted part-way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRead {
    /// Address the read started at
    pub address: u64,
    /// Successfully read prefix
    pub data: Vec<u8>,
    /// Number of bytes requested
    pub requested: usize,
}

impl PartialRead {
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.requested
    }

    /// Bytes rendered as two hex digits, `??` past the readable prefix
    pub fn hex_bytes(&self) -> Vec<String> {
        let mut out: Vec<String> = self.data.iter().map(|b| hex::encode([*b])).collect();
        out.resize(self.requested, UNREADABLE_BYTE.to_string());
        out
    }
}

/// Byte-accurate, fault-tolerant view over a target's address space
pub trait AddressSpace {
    /// Read into `buffer`, returning how many leading bytes were readable.
    /// `Ok(0)` means the first byte already faulted.
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError>;

    /// Read `length` bytes, keeping whatever prefix was readable.
    /// `length` is clamped to [`MAX_READ_LEN`].
    fn read(&self, address: u64, length: usize) -> PartialRead {
        let length = length.min(MAX_READ_LEN);
        let mut buffer = vec![0u8; length];
        let read = match self.read_into(address, &mut buffer) {
            Ok(n) => n.min(length),
            Err(e) => {
                log::debug!("{}", e);
                0
            }
        };
        buffer.truncate(read);
        PartialRead {
            address,
            data: buffer,
            requested: length,
        }
    }

    /// Whether at least one byte at `address` is readable
    fn is_readable(&self, address: u64) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.read_into(address, &mut probe), Ok(1))
    }

    /// Hex-dump style export, one entry per byte
    fn hex_dump(&self, address: u64, length: usize) -> Vec<String> {
        self.read(address, length).hex_bytes()
    }

    /// Read a NUL-terminated string, lossily decoded
    fn read_c_string(&self, address: u64, max_len: usize) -> Option<String> {
        let read = self.read(address, max_len);
        if read.data.is_empty() {
            return None;
        }
        let end = read.data.iter().position(|&b| b == 0).unwrap_or(read.data.len());
        Some(String::from_utf8_lossy(&read.data[..end]).into_owned())
    }

    fn read_u64(&self, address: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        match self.read_into(address, &mut buf) {
            Ok(8) => Some(u64::from_le_bytes(buf)),
            _ => None,
        }
    }

    fn read_u32(&self, address: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        match self.read_into(address, &mut buf) {
            Ok(4) => Some(u32::from_le_bytes(buf)),
            _ => None,
        }
    }
}

/// Memory manager for reading/writing a live process through `/proc/<pid>/mem`
pub struct MemoryManager {
    /// Target process ID
    target_pid: Option<u32>,
}

impl MemoryManager {
    /// Create a memory manager bound to `pid`
    pub fn for_process(pid: u32) -> Self {
        Self {
            target_pid: Some(pid),
        }
    }

    fn mem_path(&self) -> Result<PathBuf, MemoryError> {
        let pid = self.target_pid.ok_or(MemoryError::NoProcess)?;
        Ok(PathBuf::from(format!("/proc/{}/mem", pid)))
    }

    /// Write memory to the target process
    pub fn write(&self, address: u64, data: &[u8]) -> Result<usize, MemoryError> {
        let mem_path = self.mem_path()?;
        let fail = |e: std::io::Error| MemoryError::WriteFailed {
            address,
            reason: e.to_string(),
        };

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(fail)?;
        file.seek(SeekFrom::Start(address)).map_err(fail)?;
        file.write(data).map_err(fail)
    }

    /// Get memory regions of the target process
    pub fn query_regions(&self) -> Result<Vec<MemoryRegion>, MemoryError> {
        let pid = self.target_pid.ok_or(MemoryError::NoProcess)?;
        let text = std::fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|e| {
            MemoryError::MapsUnavailable {
                pid,
                reason: e.to_string(),
            }
        })?;
        Ok(parse_maps(&text))
    }

    /// Regions with the execute bit set, in address order
    pub fn executable_regions(&self) -> Result<Vec<MemoryRegion>, MemoryError> {
        Ok(self
            .query_regions()?
            .into_iter()
            .filter(MemoryRegion::is_executable)
            .collect())
    }
}

impl AddressSpace for MemoryManager {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError> {
        let mem_path = self.mem_path()?;
        let fail = |e: std::io::Error| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        };

        let mut file = File::open(&mem_path).map_err(fail)?;
        file.seek(SeekFrom::Start(address)).map_err(fail)?;

        // A single read stops at the first unmapped page; keep going until
        // the kernel reports a fault so the readable prefix is as long as possible.
        let mut total = 0;
        while total < buffer.len() {
            match file.read(&mut buffer[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if total > 0 => {
                    log::trace!("Partial read at {:#x} after {} bytes: {}", address, total, e);
                    break;
                }
                Err(e) => return Err(fail(e)),
            }
        }
        Ok(total)
    }
}

/// Sparse in-memory image of an address space
///
/// Segments never overlap; bytes outside every segment are unreadable.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    segments: BTreeMap<u64, Vec<u8>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`, replacing any overlapping bytes
    pub fn map(&mut self, base: u64, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.write_byte(base + offset as u64, *byte);
        }
    }

    /// Builder form of [`MemoryImage::map`]
    pub fn with_segment(mut self, base: u64, bytes: &[u8]) -> Self {
        self.map(base, bytes);
        self
    }

    fn write_byte(&mut self, address: u64, byte: u8) {
        if let Some((base, segment)) = self.segments.range_mut(..=address).next_back() {
            let offset = (address - base) as usize;
            if offset < segment.len() {
                segment[offset] = byte;
                return;
            }
            if offset == segment.len() {
                segment.push(byte);
                self.merge_following(address + 1);
                return;
            }
        }
        self.segments.insert(address, vec![byte]);
        self.merge_following(address + 1);
    }

    fn merge_following(&mut self, next: u64) {
        if let Some(tail) = self.segments.remove(&next) {
            if let Some((_, segment)) = self.segments.range_mut(..next).next_back() {
                segment.extend_from_slice(&tail);
            }
        }
    }
}

impl AddressSpace for MemoryImage {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError> {
        let Some((base, segment)) = self.segments.range(..=address).next_back() else {
            return Ok(0);
        };
        let offset = (address - base) as usize;
        if offset >= segment.len() {
            return Ok(0);
        }
        let available = &segment[offset..];
        let n = available.len().min(buffer.len());
        buffer[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}
