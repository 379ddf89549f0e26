//! Debugger - ptrace backend
//!
//! Drives a live Linux x86-64 process: attach/detach, software (INT3)
//! breakpoints, hardware watchpoints through the debug registers, stepping,
//! and non-blocking stop polling.

use thiserror::Error;

use super::memory::MemoryError;
use crate::debug::types::StopEvent;

/// Debugger-specific errors
#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    #[error("Failed to detach from process {pid}: {reason}")]
    DetachFailed { pid: u32, reason: String },

    #[error("Process not found: {pid}")]
    ProcessNotFound { pid: u32 },

    #[error("Breakpoint error at {address:#x}: {reason}")]
    BreakpointError { address: u64, reason: String },

    #[error("Watchpoint error at {address:#x}: {reason}")]
    WatchpointError { address: u64, reason: String },

    #[error("No breakpoint number {0}")]
    NoSuchBreakpoint(u32),

    #[error("Register access failed: {0}")]
    RegisterAccess(String),

    #[error("Step failed: {0}")]
    StepFailed(String),

    /// A breakpoint, watchpoint or signal stopped the target before the
    /// step reached its end; the PC is left at the stop
    #[error("Step interrupted by {0:?}")]
    StepInterrupted(StopEvent),

    #[error("Debug event error: {0}")]
    EventError(String),

    #[error("The inferior is running")]
    TargetRunning,

    #[error("The inferior has exited")]
    Exited,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux::PtraceDebugger;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux {
    use std::collections::BTreeMap;
    use std::ffi::c_void;
    use std::ptr;

    use nix::libc;
    use nix::sys::ptrace;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    use super::DebugError;
    use crate::core::memory::{AddressSpace, MemoryManager, MemoryRegion};
    use crate::debug::types::{
        BreakpointId, FloatRegisterState, InferiorStatus, RegisterState, StopEvent,
        WatchpointKind,
    };
    use crate::debug::Debugger;
    use crate::disasm::engine::DisassemblyEngine;

    const INT3: u8 = 0xCC;
    const DEBUG_REGISTER_COUNT: usize = 4;
    const DR6: usize = 6;
    const DR7: usize = 7;

    /// Breakpoint types
    #[derive(Debug, Clone)]
    enum Breakpoint {
        /// Software breakpoint (INT3)
        Software { address: u64, original_byte: u8 },

        /// Hardware watchpoint, one debug register per aligned piece
        Hardware { address: u64, slots: Vec<usize> },
    }

    /// ptrace-driven debugger for one attached process
    pub struct PtraceDebugger {
        pid: Pid,
        memory: MemoryManager,
        status: InferiorStatus,
        breakpoints: BTreeMap<BreakpointId, Breakpoint>,
        next_id: BreakpointId,
        /// Debug register slot -> owning watchpoint
        slots: [Option<BreakpointId>; DEBUG_REGISTER_COUNT],
        /// Signal to re-inject on the next resume
        pending_signal: Option<Signal>,
        engine: DisassemblyEngine,
    }

    impl PtraceDebugger {
        /// Attach to an existing process by PID and wait for it to stop
        pub fn attach(pid: u32) -> Result<Self, DebugError> {
            let target = Pid::from_raw(pid as i32);
            seize(target)?;
            Ok(Self {
                pid: target,
                memory: MemoryManager::for_process(pid),
                status: InferiorStatus::Stopped,
                breakpoints: BTreeMap::new(),
                next_id: 1,
                slots: [None; DEBUG_REGISTER_COUNT],
                pending_signal: None,
                engine: DisassemblyEngine::new(),
            })
        }

        fn raw_pid(&self) -> u32 {
            self.pid.as_raw() as u32
        }

        fn ensure_stopped(&self) -> Result<(), DebugError> {
            match self.status {
                InferiorStatus::Stopped => Ok(()),
                InferiorStatus::Running => Err(DebugError::TargetRunning),
                InferiorStatus::Exited => Err(DebugError::Exited),
                InferiorStatus::Detached => Err(DebugError::ProcessNotFound {
                    pid: self.raw_pid(),
                }),
            }
        }

        fn allocate_id(&mut self) -> BreakpointId {
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        fn set_pc(&self, pc: u64) -> Result<(), DebugError> {
            let mut regs = ptrace::getregs(self.pid)
                .map_err(|e| DebugError::RegisterAccess(e.to_string()))?;
            regs.rip = pc;
            ptrace::setregs(self.pid, regs).map_err(|e| DebugError::RegisterAccess(e.to_string()))
        }

        // ==== Debug registers ====

        fn debug_register_offset(index: usize) -> usize {
            std::mem::offset_of!(libc::user, u_debugreg) + index * std::mem::size_of::<u64>()
        }

        fn read_debug_register(&self, index: usize) -> Result<u64, DebugError> {
            unsafe {
                *libc::__errno_location() = 0;
            }
            let data = unsafe {
                libc::ptrace(
                    libc::PTRACE_PEEKUSER,
                    self.pid.as_raw(),
                    Self::debug_register_offset(index) as *mut c_void,
                    ptr::null_mut::<c_void>(),
                )
            };
            let errno = unsafe { *libc::__errno_location() };
            if data == -1 && errno != 0 {
                return Err(DebugError::RegisterAccess(format!(
                    "DR{}: {}",
                    index,
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
            Ok(data as u64)
        }

        fn write_debug_register(&self, index: usize, value: u64) -> Result<(), DebugError> {
            let result = unsafe {
                libc::ptrace(
                    libc::PTRACE_POKEUSER,
                    self.pid.as_raw(),
                    Self::debug_register_offset(index) as *mut c_void,
                    value as *mut c_void,
                )
            };
            if result < 0 {
                return Err(DebugError::RegisterAccess(format!(
                    "DR{}: {}",
                    index,
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        }

        /// Triggered watchpoint according to DR6, clearing DR6
        fn take_triggered_watchpoint(&self) -> Option<BreakpointId> {
            let dr6 = self.read_debug_register(DR6).ok()?;
            if dr6 & 0xF == 0 {
                return None;
            }
            if let Err(e) = self.write_debug_register(DR6, 0) {
                log::warn!("Failed to clear DR6: {}", e);
            }
            (0..DEBUG_REGISTER_COUNT)
                .filter(|slot| dr6 & (1 << slot) != 0)
                .find_map(|slot| self.slots[slot])
        }

        // ==== Software breakpoints ====

        fn software_breakpoint_at(&self, address: u64) -> Option<(BreakpointId, u8)> {
            self.breakpoints.iter().find_map(|(id, bp)| match bp {
                Breakpoint::Software {
                    address: a,
                    original_byte,
                } if *a == address => Some((*id, *original_byte)),
                _ => None,
            })
        }

        fn insert_int3(&self, address: u64) -> Result<u8, DebugError> {
            let mut original = [0u8; 1];
            if self.memory.read_into(address, &mut original)? != 1 {
                return Err(DebugError::BreakpointError {
                    address,
                    reason: "address is not readable".into(),
                });
            }
            self.memory.write(address, &[INT3])?;
            Ok(original[0])
        }

        /// Execute the instruction under a breakpoint at the PC without
        /// losing the breakpoint.
        fn step_raw(&mut self) -> Result<(), DebugError> {
            let pc = self.program_counter()?;
            let patched = self.software_breakpoint_at(pc);
            if let Some((_, original)) = patched {
                self.memory.write(pc, &[original])?;
            }

            let signal = self.pending_signal.take();
            let stepped = ptrace::step(self.pid, signal)
                .map_err(|e| DebugError::StepFailed(e.to_string()))
                .and_then(|_| self.wait_stopped());

            if patched.is_some() && self.status == InferiorStatus::Stopped {
                self.memory.write(pc, &[INT3])?;
            }
            stepped
        }

        /// Block until the inferior stops, updating the status
        fn wait_stopped(&mut self) -> Result<(), DebugError> {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    log::info!("Process {} exited with code {}", self.pid, code);
                    self.status = InferiorStatus::Exited;
                    Err(DebugError::Exited)
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    log::info!("Process {} killed by {}", self.pid, signal);
                    self.status = InferiorStatus::Exited;
                    Err(DebugError::Exited)
                }
                Ok(WaitStatus::Stopped(_, signal)) => {
                    if !matches!(signal, Signal::SIGTRAP | Signal::SIGSTOP) {
                        self.pending_signal = Some(signal);
                    }
                    self.status = InferiorStatus::Stopped;
                    Ok(())
                }
                Ok(other) => {
                    log::debug!("Ignoring wait status {:?}", other);
                    self.status = InferiorStatus::Stopped;
                    Ok(())
                }
                Err(e) => Err(DebugError::EventError(e.to_string())),
            }
        }

        /// Classify a SIGTRAP stop, rewinding the PC past a hit INT3
        fn classify_trap(&mut self) -> Result<StopEvent, DebugError> {
            let pc = self.program_counter()?;
            if let Some(id) = self.take_triggered_watchpoint() {
                return Ok(StopEvent::Watchpoint { id, pc });
            }
            let address = pc.wrapping_sub(1);
            if let Some((id, _)) = self.software_breakpoint_at(address) {
                self.set_pc(address)?;
                return Ok(StopEvent::Breakpoint { id, address });
            }
            Ok(StopEvent::Signal {
                signal: Signal::SIGTRAP as i32,
                pc,
            })
        }

        fn clear_all(&mut self) {
            let ids: Vec<BreakpointId> = self.breakpoints.keys().copied().collect();
            for id in ids {
                if let Err(e) = self.delete_breakpoint(id) {
                    log::warn!("Failed to remove breakpoint {}: {}", id, e);
                }
            }
        }
    }

    /// Attach and wait for the attach stop
    fn seize(target: Pid) -> Result<(), DebugError> {
        let pid = target.as_raw() as u32;
        log::info!("Attaching to process {}", pid);
        let failed = |e: nix::Error| DebugError::AttachFailed {
            pid,
            reason: e.to_string(),
        };
        ptrace::attach(target).map_err(failed)?;
        waitpid(target, None).map_err(failed)?;
        log::info!("Successfully attached to process {}", pid);
        Ok(())
    }

    /// Split `[address, address + length)` into naturally aligned pieces of
    /// at most 8 bytes
    pub(super) fn watch_pieces(address: u64, length: usize) -> Vec<(u64, usize)> {
        let mut pieces = Vec::new();
        let mut current = address;
        let mut remaining = length;
        while remaining > 0 {
            let size = [8usize, 4, 2, 1]
                .into_iter()
                .find(|size| current % *size as u64 == 0 && *size <= remaining)
                .unwrap_or(1);
            pieces.push((current, size));
            current += size as u64;
            remaining -= size;
        }
        pieces
    }

    /// DR7 bits enabling `slot` for a piece of `size` bytes
    pub(super) fn dr7_bits(slot: usize, size: usize, kind: WatchpointKind) -> u64 {
        let rw: u64 = match kind {
            WatchpointKind::Write => 0b01,
            // x86 has no read-only condition
            WatchpointKind::Read | WatchpointKind::Access => 0b11,
        };
        let len: u64 = match size {
            1 => 0b00,
            2 => 0b01,
            8 => 0b10,
            _ => 0b11,
        };
        (1 << (slot * 2)) | (rw << (16 + slot * 4)) | (len << (18 + slot * 4))
    }

    fn dr7_mask(slot: usize) -> u64 {
        (0b11 << (slot * 2)) | (0b1111 << (16 + slot * 4))
    }

    impl Debugger for PtraceDebugger {
        fn pid(&self) -> u32 {
            self.raw_pid()
        }

        fn status(&self) -> InferiorStatus {
            self.status
        }

        fn memory(&self) -> &dyn AddressSpace {
            &self.memory
        }

        fn regions(&self) -> Result<Vec<MemoryRegion>, DebugError> {
            Ok(self.memory.query_regions()?)
        }

        fn registers(&self) -> Result<RegisterState, DebugError> {
            self.ensure_stopped()?;
            let r = ptrace::getregs(self.pid)
                .map_err(|e| DebugError::RegisterAccess(e.to_string()))?;
            Ok(RegisterState {
                rax: r.rax,
                rbx: r.rbx,
                rcx: r.rcx,
                rdx: r.rdx,
                rsi: r.rsi,
                rdi: r.rdi,
                rbp: r.rbp,
                rsp: r.rsp,
                r8: r.r8,
                r9: r.r9,
                r10: r.r10,
                r11: r.r11,
                r12: r.r12,
                r13: r.r13,
                r14: r.r14,
                r15: r.r15,
                rip: r.rip,
                rflags: r.eflags,
                cs: r.cs,
                ss: r.ss,
                ds: r.ds,
                es: r.es,
                fs: r.fs,
                gs: r.gs,
            })
        }

        fn float_registers(&self) -> Result<FloatRegisterState, DebugError> {
            self.ensure_stopped()?;
            let mut fpregs: libc::user_fpregs_struct = unsafe { std::mem::zeroed() };
            let ret = unsafe {
                libc::ptrace(
                    libc::PTRACE_GETFPREGS,
                    self.pid.as_raw(),
                    ptr::null_mut::<c_void>(),
                    &mut fpregs as *mut _ as *mut c_void,
                )
            };
            if ret == -1 {
                return Err(DebugError::RegisterAccess(format!(
                    "float registers: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let st_bytes: Vec<u8> = fpregs.st_space.iter().flat_map(|w| w.to_le_bytes()).collect();
            let xmm_bytes: Vec<u8> =
                fpregs.xmm_space.iter().flat_map(|w| w.to_le_bytes()).collect();

            // Each st slot is 16 bytes wide, of which the low 10 are used
            let st = st_bytes
                .chunks_exact(16)
                .map(|slot| {
                    let mut value = [0u8; 10];
                    value.copy_from_slice(&slot[..10]);
                    value
                })
                .collect();
            let xmm = xmm_bytes
                .chunks_exact(16)
                .map(|slot| {
                    let mut value = [0u8; 16];
                    value.copy_from_slice(slot);
                    value
                })
                .collect();
            Ok(FloatRegisterState { st, xmm })
        }

        fn single_step(&mut self) -> Result<(), DebugError> {
            self.ensure_stopped()?;
            self.step_raw()
        }

        fn step_over(&mut self) -> Result<(), DebugError> {
            self.ensure_stopped()?;
            let pc = self.program_counter()?;
            let Some(insn) = self.engine.decode_at(&self.memory, pc) else {
                return self.step_raw();
            };
            if !insn.is_call() {
                return self.step_raw();
            }

            // Run the callee to completion behind a temporary breakpoint
            let resume_at = insn.next_address();
            let existing = self.software_breakpoint_at(resume_at).is_some();
            let original = if existing {
                None
            } else {
                Some(self.insert_int3(resume_at)?)
            };

            let result = self.step_raw().and_then(|_| {
                let signal = self.pending_signal.take();
                ptrace::cont(self.pid, signal)
                    .map_err(|e| DebugError::StepFailed(e.to_string()))
                    .and_then(|_| self.wait_stopped())
            });
            if self.status == InferiorStatus::Stopped {
                if let Some(byte) = original {
                    self.memory.write(resume_at, &[byte])?;
                }
            }
            result?;

            let pc = self.program_counter()?;
            if pc == resume_at + 1 {
                return self.set_pc(resume_at);
            }

            // Stopped inside the callee
            let event = match self.pending_signal {
                Some(signal) => StopEvent::Signal {
                    signal: signal as i32,
                    pc,
                },
                None => self.classify_trap()?,
            };
            log::debug!("Step over {:#x} interrupted by {:?}", resume_at, event);
            Err(DebugError::StepInterrupted(event))
        }

        fn continue_execution(&mut self) -> Result<(), DebugError> {
            self.ensure_stopped()?;
            let pc = self.program_counter()?;
            if self.software_breakpoint_at(pc).is_some() {
                self.step_raw()?;
            }
            let signal = self.pending_signal.take();
            ptrace::cont(self.pid, signal).map_err(|e| DebugError::StepFailed(e.to_string()))?;
            self.status = InferiorStatus::Running;
            log::debug!("Process {} continued", self.pid);
            Ok(())
        }

        fn interrupt(&mut self) -> Result<(), DebugError> {
            if self.status != InferiorStatus::Running {
                return Ok(());
            }
            kill(self.pid, Signal::SIGSTOP).map_err(|e| DebugError::EventError(e.to_string()))?;
            self.wait_stopped()?;
            log::debug!("Process {} interrupted", self.pid);
            Ok(())
        }

        fn set_breakpoint(&mut self, address: u64) -> Result<BreakpointId, DebugError> {
            self.ensure_stopped()?;
            log::debug!("Setting breakpoint at {:#x}", address);

            if let Some((id, _)) = self.software_breakpoint_at(address) {
                return Ok(id);
            }
            let original_byte = self.insert_int3(address)?;
            let id = self.allocate_id();
            self.breakpoints.insert(
                id,
                Breakpoint::Software {
                    address,
                    original_byte,
                },
            );
            Ok(id)
        }

        fn set_watchpoint(
            &mut self,
            address: u64,
            length: usize,
            kind: WatchpointKind,
        ) -> Result<BreakpointId, DebugError> {
            self.ensure_stopped()?;
            let pieces = watch_pieces(address, length);
            let free: Vec<usize> = (0..DEBUG_REGISTER_COUNT)
                .filter(|slot| self.slots[*slot].is_none())
                .collect();
            if pieces.is_empty() || pieces.len() > free.len() {
                return Err(DebugError::WatchpointError {
                    address,
                    reason: format!(
                        "{} debug registers needed, {} free",
                        pieces.len(),
                        free.len()
                    ),
                });
            }

            let id = self.allocate_id();
            let mut dr7 = self.read_debug_register(DR7)?;
            let mut used = Vec::new();
            for ((piece_address, size), slot) in pieces.into_iter().zip(free) {
                self.write_debug_register(slot, piece_address)?;
                dr7 = (dr7 & !dr7_mask(slot)) | dr7_bits(slot, size, kind);
                self.slots[slot] = Some(id);
                used.push(slot);
            }
            self.write_debug_register(DR7, dr7)?;

            log::debug!(
                "Watchpoint {} at {:#x} ({} bytes, {:?}) uses DR{:?}",
                id,
                address,
                length,
                kind,
                used
            );
            self.breakpoints.insert(
                id,
                Breakpoint::Hardware {
                    address,
                    slots: used,
                },
            );
            Ok(id)
        }

        fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), DebugError> {
            self.ensure_stopped()?;
            let breakpoint = self
                .breakpoints
                .remove(&id)
                .ok_or(DebugError::NoSuchBreakpoint(id))?;

            match breakpoint {
                Breakpoint::Software {
                    address,
                    original_byte,
                } => {
                    log::debug!("Removing breakpoint {} at {:#x}", id, address);
                    self.memory.write(address, &[original_byte])?;
                }
                Breakpoint::Hardware { address, slots } => {
                    log::debug!("Removing watchpoint {} at {:#x}", id, address);
                    let mut dr7 = self.read_debug_register(DR7)?;
                    for slot in slots {
                        dr7 &= !dr7_mask(slot);
                        self.slots[slot] = None;
                    }
                    self.write_debug_register(DR7, dr7)?;
                }
            }
            Ok(())
        }

        fn poll_event(&mut self) -> Result<Option<StopEvent>, DebugError> {
            if self.status != InferiorStatus::Running {
                return Ok(None);
            }
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => Ok(None),
                Ok(WaitStatus::Exited(_, code)) => {
                    self.status = InferiorStatus::Exited;
                    Ok(Some(StopEvent::Exited { code }))
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.status = InferiorStatus::Exited;
                    Ok(Some(StopEvent::Exited {
                        code: -(signal as i32),
                    }))
                }
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                    self.status = InferiorStatus::Stopped;
                    self.classify_trap().map(Some)
                }
                Ok(WaitStatus::Stopped(_, signal)) => {
                    self.status = InferiorStatus::Stopped;
                    if signal != Signal::SIGSTOP {
                        self.pending_signal = Some(signal);
                    }
                    let pc = self.program_counter()?;
                    Ok(Some(StopEvent::Signal {
                        signal: signal as i32,
                        pc,
                    }))
                }
                Ok(other) => {
                    log::debug!("Ignoring wait status {:?}", other);
                    Ok(None)
                }
                Err(e) => Err(DebugError::EventError(e.to_string())),
            }
        }

        fn detach(&mut self) -> Result<(), DebugError> {
            let pid = self.raw_pid();
            if !self.status.is_alive() {
                self.status = InferiorStatus::Detached;
                return Ok(());
            }
            log::info!("Detaching from process {}", pid);

            self.interrupt()?;
            self.clear_all();
            let signal = self.pending_signal.take();
            ptrace::detach(self.pid, signal).map_err(|e| DebugError::DetachFailed {
                pid,
                reason: e.to_string(),
            })?;
            self.status = InferiorStatus::Detached;

            log::info!("Successfully detached from process {}", pid);
            Ok(())
        }

        fn reattach(&mut self) -> Result<(), DebugError> {
            match self.status {
                InferiorStatus::Detached => {}
                InferiorStatus::Exited => return Err(DebugError::Exited),
                InferiorStatus::Stopped | InferiorStatus::Running => return Ok(()),
            }
            seize(self.pid)?;
            self.status = InferiorStatus::Stopped;
            self.pending_signal = None;
            self.slots = [None; DEBUG_REGISTER_COUNT];
            self.breakpoints.clear();
            Ok(())
        }
    }

    impl Drop for PtraceDebugger {
        fn drop(&mut self) {
            if self.status.is_alive() {
                if let Err(e) = self.detach() {
                    log::warn!("Detach on drop failed: {}", e);
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_watch_pieces_are_aligned() {
            assert_eq!(watch_pieces(0x1000, 8), vec![(0x1000, 8)]);
            assert_eq!(
                watch_pieces(0x1003, 6),
                vec![(0x1003, 1), (0x1004, 4), (0x1008, 1)]
            );
            assert_eq!(watch_pieces(0x1000, 16), vec![(0x1000, 8), (0x1008, 8)]);
        }

        #[test]
        fn test_dr7_encoding() {
            // slot 1, 4 bytes, write: L1 | RW1=01 | LEN1=11
            let bits = dr7_bits(1, 4, WatchpointKind::Write);
            assert_eq!(bits, (1 << 2) | (0b01 << 20) | (0b11 << 22));
            assert_eq!(bits & !dr7_mask(1), 0);
        }
    }
}
