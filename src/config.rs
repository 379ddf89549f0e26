//! Engine configuration
//!
//! Tunables shared by the executor and the controller. Defaults match the
//! values the engine was tuned with; a few can be overridden from the
//! environment so that a deployment can move the IPC directory without
//! rebuilding.

use std::path::PathBuf;
use std::time::Duration;

use crate::disasm::engine::Bitness;

/// Environment variable overriding [`EngineConfig::ipc_dir`]
pub const IPC_DIR_ENV: &str = "SCRYER_IPC_DIR";

/// Environment variable overriding [`EngineConfig::chunk_size`]
pub const CHUNK_SIZE_ENV: &str = "SCRYER_CHUNK_SIZE";

/// Environment variable overriding [`EngineConfig::bitness`] (16, 32 or 64)
pub const BITS_ENV: &str = "SCRYER_BITS";

/// Configuration for the executor and controller
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory of the process-keyed blob store
    pub ipc_dir: PathBuf,
    /// Bytes read and decoded per dissection chunk
    pub chunk_size: usize,
    /// Trailing instructions re-decoded at the start of the next chunk
    pub boundary_discard: usize,
    /// Bytes probed when validating a referenced string
    pub string_probe_len: usize,
    /// Bytes scanned upwards from the stack pointer by the stack view
    pub stack_scan_len: usize,
    /// Bytes disassembled before the PC to find the previous instruction
    pub previous_insn_window: u64,
    /// Bytes of disassembly stored with each watchpoint hit
    pub context_disassembly_len: usize,
    /// Longest hex dump a single request may ask for
    pub max_hex_dump_len: usize,
    /// Deadline for ordinary requests
    pub request_timeout: Duration,
    /// Deadline for dissection and other long-running requests
    pub long_request_timeout: Duration,
    /// Interval between side-channel polls and executor event polls
    pub poll_interval: Duration,
    /// Target architecture bitness
    pub bitness: Bitness,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ipc_dir: default_ipc_dir(),
            // Aligned to 2**16, empirically the best speed/size tradeoff
            chunk_size: 0x10000,
            boundary_discard: 4,
            string_probe_len: 32,
            stack_scan_len: 4096,
            previous_insn_window: 30,
            context_disassembly_len: 40,
            max_hex_dump_len: 0x10000,
            request_timeout: Duration::from_secs(30),
            long_request_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(100),
            bitness: Bitness::Bit64,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(IPC_DIR_ENV) {
            if !dir.is_empty() {
                config.ipc_dir = PathBuf::from(dir);
            }
        }

        if let Ok(size) = std::env::var(CHUNK_SIZE_ENV) {
            match parse_size(&size) {
                Some(size) if size > 0 => config.chunk_size = size,
                _ => log::warn!("Ignoring invalid {}={}", CHUNK_SIZE_ENV, size),
            }
        }

        if let Ok(bits) = std::env::var(BITS_ENV) {
            match bits.trim().parse().map(Bitness::from_bits) {
                Ok(Ok(bitness)) => config.bitness = bitness,
                _ => log::warn!("Ignoring invalid {}={}", BITS_ENV, bits),
            }
        }

        config
    }

    /// Override the blob store directory
    pub fn with_ipc_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ipc_dir = dir.into();
        self
    }

    /// Override the dissection chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

fn default_ipc_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm.join("scryer")
    } else {
        std::env::temp_dir().join("scryer")
    }
}

fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
