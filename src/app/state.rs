//! REPL session state
//!
//! Remembers what this session started so that the prompt and `status`
//! can show it and teardown can be retried.

use std::thread::JoinHandle;

use crate::debug::{BreakpointId, InferiorStatus};
use crate::dissect::DissectionOutcome;
use crate::trace::TraceArena;

/// Kind of a session started from the REPL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Trace,
    Watchpoint,
    Breakpoint,
}

/// Per-REPL state
#[derive(Default)]
pub struct AppState {
    /// Last known run state of the target
    pub status: InferiorStatus,
    /// Sessions started here, in start order
    pub sessions: Vec<(BreakpointId, SessionKind)>,
    /// Trace opened with `trace-load`
    pub loaded_trace: Option<TraceArena>,
    /// Background dissection request, if one is in flight
    pub dissection: Option<JoinHandle<Result<DissectionOutcome, String>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&mut self, id: BreakpointId, kind: SessionKind) {
        self.sessions.retain(|(existing, _)| *existing != id);
        self.sessions.push((id, kind));
    }

    pub fn remove_session(&mut self, id: BreakpointId) {
        self.sessions.retain(|(existing, _)| *existing != id);
    }

    pub fn session_kind(&self, id: BreakpointId) -> Option<SessionKind> {
        self.sessions
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, kind)| *kind)
    }

    /// Whether a dissection started here is still running
    pub fn is_dissecting(&self) -> bool {
        self.dissection.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Collect the result of a finished background dissection
    pub fn take_finished_dissection(&mut self) -> Option<Result<DissectionOutcome, String>> {
        if self.dissection.as_ref()?.is_finished() {
            let handle = self.dissection.take()?;
            Some(handle.join().unwrap_or_else(|_| Err("dissection thread panicked".into())))
        } else {
            None
        }
    }
}
