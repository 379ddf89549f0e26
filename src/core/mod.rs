//! Core module - Debugger backend and low-level operations
//!
//! This module contains the platform-specific debugger implementation
//! and memory access utilities.

pub mod debugger;
pub mod memory;
pub mod value;

// Re-export common types
pub use debugger::DebugError;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use debugger::PtraceDebugger;
pub use memory::{AddressSpace, MemoryError, MemoryImage, MemoryManager, MemoryRegion, PartialRead};
pub use value::ValueType;
