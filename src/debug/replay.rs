//! Replay backend
//!
//! A [`Debugger`] that replays a recorded sequence of register states over a
//! [`MemoryImage`]. Stepping advances through the recording; continuing runs
//! forward until a recorded PC lands on a software breakpoint or a queued
//! stop is due. Used to drive the engine without a live process.

use std::collections::{BTreeMap, VecDeque};

use crate::core::memory::{AddressSpace, MemoryImage, MemoryRegion};
use crate::debug::types::{
    BreakpointId, FloatRegisterState, InferiorStatus, RegisterState, StopEvent, WatchpointKind,
};
use crate::debug::{DebugError, Debugger};
use crate::disasm::engine::DisassemblyEngine;

#[derive(Debug, Clone)]
enum ReplayBreakpoint {
    Software(u64),
    Watch {
        address: u64,
        length: usize,
        kind: WatchpointKind,
    },
}

/// Debugger over a recorded execution
pub struct ReplayDebugger {
    pid: u32,
    image: MemoryImage,
    regions: Vec<MemoryRegion>,
    script: Vec<RegisterState>,
    position: usize,
    status: InferiorStatus,
    breakpoints: BTreeMap<BreakpointId, ReplayBreakpoint>,
    next_id: BreakpointId,
    /// (recording index, event) pairs delivered in order while running
    queued: VecDeque<(usize, StopEvent)>,
    float: FloatRegisterState,
    engine: DisassemblyEngine,
}

impl ReplayDebugger {
    /// Replay the given program counters; other registers start zeroed
    pub fn new(pid: u32, image: MemoryImage, pcs: &[u64]) -> Self {
        let script = pcs
            .iter()
            .map(|&pc| RegisterState {
                rip: pc,
                ..Default::default()
            })
            .collect();
        Self::with_script(pid, image, script)
    }

    /// Replay full register states
    pub fn with_script(pid: u32, image: MemoryImage, script: Vec<RegisterState>) -> Self {
        Self {
            pid,
            image,
            regions: Vec::new(),
            script,
            position: 0,
            status: InferiorStatus::Stopped,
            breakpoints: BTreeMap::new(),
            next_id: 1,
            queued: VecDeque::new(),
            float: FloatRegisterState::default(),
            engine: DisassemblyEngine::new(),
        }
    }

    /// Process map reported by [`Debugger::regions`]
    pub fn with_regions(mut self, regions: Vec<MemoryRegion>) -> Self {
        self.regions = regions;
        self
    }

    /// Index into the recording
    pub fn position(&self) -> usize {
        self.position
    }

    /// Deliver `event` with the recording at `index` on a later poll
    pub fn queue_stop(&mut self, index: usize, event: StopEvent) {
        self.queued.push_back((index, event));
    }

    /// Force the run state
    pub fn set_status(&mut self, status: InferiorStatus) {
        self.status = status;
    }

    /// Watchpoints currently set, as (address, length, kind)
    pub fn watchpoints(&self) -> Vec<(u64, usize, WatchpointKind)> {
        self.breakpoints
            .values()
            .filter_map(|bp| match bp {
                ReplayBreakpoint::Watch {
                    address,
                    length,
                    kind,
                } => Some((*address, *length, *kind)),
                ReplayBreakpoint::Software(_) => None,
            })
            .collect()
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    fn ensure_stopped(&self) -> Result<(), DebugError> {
        match self.status {
            InferiorStatus::Stopped => Ok(()),
            InferiorStatus::Running => Err(DebugError::TargetRunning),
            InferiorStatus::Exited => Err(DebugError::Exited),
            InferiorStatus::Detached => Err(DebugError::ProcessNotFound { pid: self.pid }),
        }
    }

    fn current(&self) -> Result<&RegisterState, DebugError> {
        self.script
            .get(self.position)
            .ok_or_else(|| DebugError::StepFailed("end of recording".into()))
    }

    fn advance_to(&mut self, index: usize) -> Result<(), DebugError> {
        if index >= self.script.len() {
            self.position = self.script.len();
            return Err(DebugError::StepFailed("end of recording".into()));
        }
        self.position = index;
        Ok(())
    }

    fn software_breakpoint_at(&self, address: u64) -> Option<BreakpointId> {
        self.breakpoints.iter().find_map(|(id, bp)| match bp {
            ReplayBreakpoint::Software(a) if *a == address => Some(*id),
            _ => None,
        })
    }
}

impl Debugger for ReplayDebugger {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn status(&self) -> InferiorStatus {
        self.status
    }

    fn memory(&self) -> &dyn AddressSpace {
        &self.image
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>, DebugError> {
        Ok(self.regions.clone())
    }

    fn registers(&self) -> Result<RegisterState, DebugError> {
        self.ensure_stopped()?;
        self.current().cloned()
    }

    fn float_registers(&self) -> Result<FloatRegisterState, DebugError> {
        self.ensure_stopped()?;
        Ok(self.float.clone())
    }

    fn single_step(&mut self) -> Result<(), DebugError> {
        self.ensure_stopped()?;
        self.advance_to(self.position + 1)
    }

    fn step_over(&mut self) -> Result<(), DebugError> {
        self.ensure_stopped()?;
        let pc = self.current()?.rip;
        match self.engine.decode_at(&self.image, pc) {
            Some(insn) if insn.is_call() => {
                let resume_at = insn.next_address();
                let start = (self.position + 1).min(self.script.len());
                let index = self.script[start..]
                    .iter()
                    .position(|regs| regs.rip == resume_at)
                    .map(|offset| start + offset)
                    .unwrap_or(self.script.len());
                // A breakpoint inside the callee ends the step there
                let hit = self.script[start..index.min(self.script.len())]
                    .iter()
                    .enumerate()
                    .find_map(|(offset, regs)| {
                        self.software_breakpoint_at(regs.rip)
                            .map(|id| (start + offset, id, regs.rip))
                    });
                if let Some((at, id, address)) = hit {
                    self.position = at;
                    return Err(DebugError::StepInterrupted(StopEvent::Breakpoint { id, address }));
                }
                self.advance_to(index)
            }
            _ => self.advance_to(self.position + 1),
        }
    }

    fn continue_execution(&mut self) -> Result<(), DebugError> {
        self.ensure_stopped()?;
        self.status = InferiorStatus::Running;
        Ok(())
    }

    fn interrupt(&mut self) -> Result<(), DebugError> {
        if self.status == InferiorStatus::Running {
            self.status = InferiorStatus::Stopped;
        }
        Ok(())
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<BreakpointId, DebugError> {
        self.ensure_stopped()?;
        if let Some(id) = self.software_breakpoint_at(address) {
            return Ok(id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.insert(id, ReplayBreakpoint::Software(address));
        Ok(id)
    }

    fn set_watchpoint(
        &mut self,
        address: u64,
        length: usize,
        kind: WatchpointKind,
    ) -> Result<BreakpointId, DebugError> {
        self.ensure_stopped()?;
        if length == 0 {
            return Err(DebugError::WatchpointError {
                address,
                reason: "empty range".into(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.insert(
            id,
            ReplayBreakpoint::Watch {
                address,
                length,
                kind,
            },
        );
        Ok(id)
    }

    fn delete_breakpoint(&mut self, id: BreakpointId) -> Result<(), DebugError> {
        self.ensure_stopped()?;
        self.breakpoints
            .remove(&id)
            .map(|_| ())
            .ok_or(DebugError::NoSuchBreakpoint(id))
    }

    fn poll_event(&mut self) -> Result<Option<StopEvent>, DebugError> {
        if self.status != InferiorStatus::Running {
            return Ok(None);
        }

        if let Some((index, event)) = self.queued.pop_front() {
            self.position = index.min(self.script.len().saturating_sub(1));
            self.status = match event {
                StopEvent::Exited { .. } => InferiorStatus::Exited,
                _ => InferiorStatus::Stopped,
            };
            return Ok(Some(event));
        }

        let hit = self.script[(self.position + 1).min(self.script.len())..]
            .iter()
            .enumerate()
            .find_map(|(offset, regs)| {
                self.software_breakpoint_at(regs.rip)
                    .map(|id| (self.position + 1 + offset, id, regs.rip))
            });
        match hit {
            Some((index, id, address)) => {
                self.position = index;
                self.status = InferiorStatus::Stopped;
                Ok(Some(StopEvent::Breakpoint { id, address }))
            }
            None => Ok(None),
        }
    }

    fn detach(&mut self) -> Result<(), DebugError> {
        self.breakpoints.clear();
        self.status = InferiorStatus::Detached;
        Ok(())
    }

    fn reattach(&mut self) -> Result<(), DebugError> {
        match self.status {
            InferiorStatus::Detached => {
                self.status = InferiorStatus::Stopped;
                Ok(())
            }
            InferiorStatus::Exited => Err(DebugError::Exited),
            InferiorStatus::Stopped | InferiorStatus::Running => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0x1000: call 0x1010 ; 0x1005: nop ; 0x1010: ret
    fn image() -> MemoryImage {
        MemoryImage::new()
            .with_segment(0x1000, &[0xE8, 0x0B, 0x00, 0x00, 0x00, 0x90])
            .with_segment(0x1010, &[0xC3])
    }

    #[test]
    fn test_step_over_skips_callee() {
        let mut dbg = ReplayDebugger::new(1, image(), &[0x1000, 0x1010, 0x1005]);
        dbg.step_over().unwrap();
        assert_eq!(dbg.program_counter().unwrap(), 0x1005);
        assert!(dbg.single_step().is_err());
    }

    #[test]
    fn test_step_over_stops_at_breakpoint_in_callee() {
        let mut dbg = ReplayDebugger::new(1, image(), &[0x1000, 0x1010, 0x1005]);
        let id = dbg.set_breakpoint(0x1010).unwrap();
        match dbg.step_over() {
            Err(DebugError::StepInterrupted(event)) => {
                assert_eq!(event, StopEvent::Breakpoint { id, address: 0x1010 })
            }
            other => panic!("expected an interrupted step, got {:?}", other),
        }
        assert_eq!(dbg.program_counter().unwrap(), 0x1010);
        assert_eq!(dbg.status(), InferiorStatus::Stopped);
    }

    #[test]
    fn test_continue_stops_at_breakpoint() {
        let mut dbg = ReplayDebugger::new(1, image(), &[0x1000, 0x1010, 0x1005]);
        let id = dbg.set_breakpoint(0x1005).unwrap();
        dbg.continue_execution().unwrap();
        assert!(dbg.registers().is_err());
        assert_eq!(
            dbg.poll_event().unwrap(),
            Some(StopEvent::Breakpoint { id, address: 0x1005 })
        );
        assert_eq!(dbg.status(), InferiorStatus::Stopped);
        assert_eq!(dbg.position(), 2);
    }
}
