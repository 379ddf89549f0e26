//! Debug module - Control primitives over the inferior.
//!
//! Provides the debugger abstraction every engine component is written against:
//! - Register access (general, flag, segment, float)
//! - Software breakpoints and hardware watchpoints
//! - Step / step-over / continue / interrupt
//! - Non-blocking stop-event polling
//!
//! `core::debugger::PtraceDebugger` drives a live Linux process; `replay`
//! drives a recorded execution over an in-memory image.

pub mod expr;
pub mod replay;
pub mod stack;
pub mod types;

pub use crate::core::debugger::DebugError;
pub use types::{
    BreakpointId, FloatRegisterState, InferiorStatus, RegisterClass, RegisterSelection,
    RegisterSnapshot, RegisterState, StopEvent, WatchpointKind,
};

use crate::core::memory::{AddressSpace, MemoryRegion};

/// Platform-agnostic debugger trait
///
/// Only one control operation is ever in flight; callers hold `&mut self`
/// for anything that moves the inferior.
pub trait Debugger {
    /// Process ID of the inferior
    fn pid(&self) -> u32;

    /// Current run state
    fn status(&self) -> InferiorStatus;

    /// The inferior's address space
    fn memory(&self) -> &dyn AddressSpace;

    /// Current process map
    fn regions(&self) -> Result<Vec<MemoryRegion>, DebugError>;

    /// CPU registers (inferior must be stopped)
    fn registers(&self) -> Result<RegisterState, DebugError>;

    /// x87/SSE registers (inferior must be stopped)
    fn float_registers(&self) -> Result<FloatRegisterState, DebugError>;

    /// Execute exactly one instruction
    fn single_step(&mut self) -> Result<(), DebugError>;

    /// Execute one instruction, running called functions to completion
    fn step_over(&mut self) -> Result<(), DebugError>;

    /// Resume the inferior
    fn continue_execution(&mut self) -> Result<(), DebugError>;

    /// Stop a running inferior
    fn interrupt(&mut self) -> Result<(), DebugError>;

    /// Set a software breakpoint
    fn set_breakpoint(&mut self, address: u64) -> Result<BreakpointId, DebugError>;

    /// Set a hardware watchpoint covering `[address, address + length)`
    fn set_watchpoint(
        &mut self,
        address: u64,
        length: usize,
        kind: WatchpointKind,
    ) -> Result<BreakpointId, DebugError>;

    /// Remove a breakpoint or watchpoint
    fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), DebugError>;

    /// Non-blocking check for a stop of a running inferior
    fn poll_event(&mut self) -> Result<Option<StopEvent>, DebugError>;

    /// Detach from the inferior, leaving it running
    fn detach(&mut self) -> Result<(), DebugError>;

    /// Attach again to the process of an earlier [`Debugger::detach`].
    /// Breakpoints set before the detach are gone.
    fn reattach(&mut self) -> Result<(), DebugError>;

    /// Current program counter
    fn program_counter(&self) -> Result<u64, DebugError> {
        Ok(self.registers()?.rip)
    }

    /// Merge the selected register classes into one snapshot
    fn register_snapshot(
        &self,
        selection: RegisterSelection,
    ) -> Result<RegisterSnapshot, DebugError> {
        let mut snapshot = RegisterSnapshot::new();
        if selection.is_empty() {
            return Ok(snapshot);
        }
        let cpu = self.registers()?;
        for class in selection.classes() {
            match class {
                RegisterClass::Float => snapshot.extend(self.float_registers()?.snapshot()),
                other => snapshot.extend(cpu.snapshot(other)),
            }
        }
        Ok(snapshot)
    }

    /// Executable regions in address order
    fn executable_regions(&self) -> Result<Vec<MemoryRegion>, DebugError> {
        let mut regions: Vec<MemoryRegion> = self
            .regions()?
            .into_iter()
            .filter(MemoryRegion::is_executable)
            .collect();
        regions.sort_by_key(|r| r.start);
        Ok(regions)
    }
}
