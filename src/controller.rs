//! Controller
//!
//! Issues requests to an executor and reads the side-channel blobs it
//! publishes. One request is in flight at a time: the transport sits behind
//! a mutex, so a status poller on another thread can call [`Controller::try_request`]
//! or read blobs without ever interleaving with a blocking dissection.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use thiserror::Error;

use crate::config::EngineConfig;
use crate::core::memory::MemoryRegion;
use crate::core::value::ValueType;
use crate::debug::stack::{FrameInfo, StackEntry, StackTraceEntry};
use crate::debug::{BreakpointId, InferiorStatus, RegisterSnapshot, WatchpointKind};
use crate::dissect::search::{ReferencedCall, ReferencedString, Referrers};
use crate::dissect::{DissectionOutcome, DissectionStatus, ReferenceCounts};
use crate::ipc::blob::{BlobError, BlobKind, BlobStore};
use crate::ipc::protocol::{ExaminedExpression, Failure, Payload, Request};
use crate::ipc::transport::{Transport, TransportError};
use crate::trace::{TraceArena, TraceError, TraceParams, TraceStatus};
use crate::track::{BreakpointRecords, WatchpointRecords};

/// Controller-side errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error(transparent)]
    Failed(#[from] Failure),

    #[error("Unexpected {got} reply to {request}")]
    UnexpectedPayload { request: &'static str, got: &'static str },

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("Another request is in flight")]
    Busy,

    #[error("Trace file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trace file is malformed: {0}")]
    Codec(String),

    #[error("Controller state poisoned")]
    Poisoned,
}

impl From<TransportError> for ControllerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ExecutorUnavailable(reason) => ControllerError::ExecutorUnavailable(reason),
            other => ControllerError::ExecutorUnavailable(other.to_string()),
        }
    }
}

impl From<TraceError> for ControllerError {
    fn from(e: TraceError) -> Self {
        ControllerError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// What happened to a teardown request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Done,
    /// Queued until the target stops; see [`Controller::flush_deferred`]
    Deferred,
}

/// Front end of one debugged process
pub struct Controller {
    transport: Mutex<Box<dyn Transport>>,
    blobs: BlobStore,
    pid: u32,
    config: EngineConfig,
    deferred: Mutex<Vec<BreakpointId>>,
}

macro_rules! expect_payload {
    ($self:ident, $request:expr, $pattern:pat => $value:expr) => {{
        let request = $request;
        let name = request.name();
        match $self.request(request)? {
            $pattern => Ok($value),
            other => Err(ControllerError::UnexpectedPayload {
                request: name,
                got: other.name(),
            }),
        }
    }};
}

impl Controller {
    pub fn new(transport: Box<dyn Transport>, pid: u32, config: EngineConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            blobs: BlobStore::new(&config.ipc_dir),
            pid,
            config,
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Send `request`, waiting for the transport if another request is in flight
    pub fn request(&self, request: Request) -> Result<Payload> {
        let timeout = if request.is_long_running() {
            self.config.long_request_timeout
        } else {
            self.config.request_timeout
        };
        self.request_with_timeout(request, timeout)
    }

    pub fn request_with_timeout(&self, request: Request, timeout: Duration) -> Result<Payload> {
        let mut transport = self.transport.lock().map_err(|_| ControllerError::Poisoned)?;
        Self::exchange(&mut transport, &request, timeout)
    }

    /// Like [`Controller::request`] but fails with `Busy` instead of waiting
    pub fn try_request(&self, request: Request) -> Result<Payload> {
        let mut transport = match self.transport.try_lock() {
            Ok(transport) => transport,
            Err(TryLockError::WouldBlock) => return Err(ControllerError::Busy),
            Err(TryLockError::Poisoned(_)) => return Err(ControllerError::Poisoned),
        };
        Self::exchange(&mut transport, &request, self.config.request_timeout)
    }

    fn exchange(
        transport: &mut MutexGuard<'_, Box<dyn Transport>>,
        request: &Request,
        timeout: Duration,
    ) -> Result<Payload> {
        log::debug!("-> {}", request.name());
        let response = transport.exchange(request, timeout)?;
        match response {
            Ok(payload) => {
                log::debug!("<- {}", payload.name());
                Ok(payload)
            }
            Err(failure) => {
                log::debug!("<- {}", failure);
                Err(failure.into())
            }
        }
    }

    // Registers and memory

    pub fn read_registers(&self) -> Result<RegisterSnapshot> {
        expect_payload!(self, Request::ReadRegisters, Payload::Registers(r) => r)
    }

    pub fn read_float_registers(&self) -> Result<RegisterSnapshot> {
        expect_payload!(self, Request::ReadFloatRegisters, Payload::Registers(r) => r)
    }

    pub fn stack_info(&self) -> Result<Vec<StackEntry>> {
        expect_payload!(self, Request::GetStackInfo, Payload::StackInfo(s) => s)
    }

    pub fn stack_trace(&self) -> Result<Vec<StackTraceEntry>> {
        expect_payload!(self, Request::GetStackTraceInfo, Payload::StackTrace(s) => s)
    }

    pub fn frame_return_addresses(&self) -> Result<Vec<String>> {
        expect_payload!(self, Request::GetFrameReturnAddresses, Payload::ReturnAddresses(r) => r)
    }

    pub fn frame_info(&self, index: usize) -> Result<Option<FrameInfo>> {
        expect_payload!(self, Request::GetFrameInfo { index }, Payload::Frame(f) => f)
    }

    pub fn hex_dump(&self, address: u64, length: usize) -> Result<Vec<String>> {
        expect_payload!(self, Request::HexDump { address, length }, Payload::HexDump { bytes, .. } => bytes)
    }

    pub fn executable_regions(&self) -> Result<Vec<MemoryRegion>> {
        expect_payload!(self, Request::ExecutableRegions, Payload::Regions(r) => r)
    }

    // Dissection

    /// Dissect `regions` (all executable regions when empty). Blocks until
    /// the run ends; poll [`Controller::dissect_status`] from another thread.
    pub fn dissect_code(&self, regions: Vec<MemoryRegion>, discard_invalid_strings: bool) -> Result<DissectionOutcome> {
        self.blobs.remove(self.pid, BlobKind::DissectCancel)?;
        expect_payload!(
            self,
            Request::DissectCode {
                regions,
                discard_invalid_strings,
            },
            Payload::Dissection(outcome) => outcome
        )
    }

    /// Ask a running dissection to stop at its next chunk boundary
    pub fn cancel_dissect_code(&self) -> Result<()> {
        self.blobs.touch(self.pid, BlobKind::DissectCancel)?;
        log::info!("Dissection cancel requested for process {}", self.pid);
        Ok(())
    }

    pub fn dissect_status(&self) -> Result<Option<DissectionStatus>> {
        Ok(self.blobs.read(self.pid, BlobKind::DissectStatus)?)
    }

    pub fn reset_dissect_code(&self) -> Result<()> {
        expect_payload!(self, Request::ResetDissectCode, Payload::Done => ())
    }

    pub fn reference_counts(&self) -> Result<ReferenceCounts> {
        expect_payload!(self, Request::GetReferenceCounts, Payload::Counts(c) => c)
    }

    pub fn search_referenced_strings(
        &self,
        pattern: &str,
        case_sensitive: bool,
        regex: bool,
        value_type: ValueType,
    ) -> Result<Vec<ReferencedString>> {
        expect_payload!(
            self,
            Request::SearchReferencedStrings {
                pattern: pattern.to_string(),
                case_sensitive,
                regex,
                value_type,
            },
            Payload::ReferencedStrings(s) => s
        )
    }

    pub fn search_referenced_calls(&self, pattern: &str, case_sensitive: bool, regex: bool) -> Result<Vec<ReferencedCall>> {
        expect_payload!(
            self,
            Request::SearchReferencedCalls {
                pattern: pattern.to_string(),
                case_sensitive,
                regex,
            },
            Payload::ReferencedCalls(c) => c
        )
    }

    pub fn referrers(&self, address: u64) -> Result<Referrers> {
        expect_payload!(self, Request::GetReferrers { address }, Payload::Referrers(r) => r)
    }

    // Expressions and symbols

    pub fn examine(&self, expressions: Vec<String>) -> Result<Vec<ExaminedExpression>> {
        expect_payload!(self, Request::ExamineExpressions { expressions }, Payload::Examined(e) => e)
    }

    pub fn search_functions(&self, pattern: &str, case_sensitive: bool) -> Result<Vec<(Option<u64>, String)>> {
        expect_payload!(
            self,
            Request::SearchFunctions {
                pattern: pattern.to_string(),
                case_sensitive,
            },
            Payload::Functions(f) => f
        )
    }

    // Tracing

    /// Arm a trace at `address`; returns the breakpoint id naming the trace
    pub fn trace_instructions(&self, address: u64, params: TraceParams) -> Result<BreakpointId> {
        expect_payload!(self, Request::TraceInstructions { address, params }, Payload::Breakpoint(id) => id)
    }

    pub fn trace_status(&self, id: BreakpointId) -> Result<Option<TraceStatus>> {
        Ok(self.blobs.read(self.pid, BlobKind::TraceStatus(id))?)
    }

    /// Ask a running trace to stop before its next step
    pub fn cancel_trace(&self, id: BreakpointId) -> Result<()> {
        self.blobs.touch(self.pid, BlobKind::TraceCancel(id))?;
        Ok(())
    }

    pub fn trace_result(&self, id: BreakpointId) -> Result<Option<TraceArena>> {
        Ok(self.blobs.read(self.pid, BlobKind::TraceResult(id))?)
    }

    /// Write a trace to a `.trace` file
    pub fn save_trace(&self, arena: &TraceArena, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string(arena).map_err(|e| ControllerError::Codec(e.to_string()))?;
        std::fs::write(path.as_ref(), text)?;
        log::info!("Trace saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Read a `.trace` file, rejecting anything that is not a well-formed tree
    pub fn load_trace(path: impl AsRef<Path>) -> Result<TraceArena> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let arena: TraceArena = serde_json::from_str(&text).map_err(|e| ControllerError::Codec(e.to_string()))?;
        arena.validate()?;
        Ok(arena)
    }

    // Access tracking

    pub fn track_watchpoint(&self, address: u64, length: usize, kind: WatchpointKind) -> Result<BreakpointId> {
        expect_payload!(
            self,
            Request::TrackWatchpoint { address, length, kind },
            Payload::Breakpoint(id) => id
        )
    }

    pub fn track_breakpoint(&self, address: u64, expressions: Vec<String>) -> Result<BreakpointId> {
        expect_payload!(
            self,
            Request::TrackBreakpoint { address, expressions },
            Payload::Breakpoint(id) => id
        )
    }

    pub fn watchpoint_info(&self, id: BreakpointId) -> Result<WatchpointRecords> {
        expect_payload!(self, Request::GetTrackWatchpointInfo { id }, Payload::WatchpointInfo(r) => r)
    }

    pub fn breakpoint_info(&self, id: BreakpointId) -> Result<BreakpointRecords> {
        expect_payload!(self, Request::GetTrackBreakpointInfo { id }, Payload::BreakpointInfo(r) => r)
    }

    /// Last published records of a tracking session, without a round trip
    pub fn cached_watchpoint_info(&self, id: BreakpointId) -> Result<Option<WatchpointRecords>> {
        Ok(self.blobs.read(self.pid, BlobKind::TrackWatchpoint(id))?)
    }

    pub fn cached_breakpoint_info(&self, id: BreakpointId) -> Result<Option<BreakpointRecords>> {
        Ok(self.blobs.read(self.pid, BlobKind::TrackBreakpoint(id))?)
    }

    /// Close a tracking session. Without `interrupt`, a session whose target
    /// is running is queued and torn down by the next [`Controller::flush_deferred`].
    pub fn stop_tracking(&self, id: BreakpointId, interrupt: bool) -> Result<Teardown> {
        match self.request(Request::StopTracking { id, interrupt }) {
            Ok(_) => Ok(Teardown::Done),
            Err(ControllerError::Failed(Failure::InvalidTransition(reason))) if !interrupt => {
                log::info!("Teardown of {} deferred: {}", id, reason);
                let mut deferred = self.deferred.lock().map_err(|_| ControllerError::Poisoned)?;
                if !deferred.contains(&id) {
                    deferred.push(id);
                }
                Ok(Teardown::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    pub fn deferred_teardowns(&self) -> Result<Vec<BreakpointId>> {
        Ok(self.deferred.lock().map_err(|_| ControllerError::Poisoned)?.clone())
    }

    /// Retry queued teardowns; returns the ids that were closed
    pub fn flush_deferred(&self) -> Result<Vec<BreakpointId>> {
        let pending = std::mem::take(&mut *self.deferred.lock().map_err(|_| ControllerError::Poisoned)?);
        let mut closed = Vec::new();
        let mut still_pending = Vec::new();
        for id in pending {
            match self.request(Request::StopTracking { id, interrupt: false }) {
                Ok(_) | Err(ControllerError::Failed(Failure::NotFound(_))) => closed.push(id),
                Err(ControllerError::Failed(Failure::InvalidTransition(_))) => still_pending.push(id),
                Err(e) => {
                    self.deferred
                        .lock()
                        .map_err(|_| ControllerError::Poisoned)?
                        .extend(still_pending.into_iter().chain(std::iter::once(id)));
                    return Err(e);
                }
            }
        }
        self.deferred
            .lock()
            .map_err(|_| ControllerError::Poisoned)?
            .extend(still_pending);
        Ok(closed)
    }

    // Run control

    pub fn status(&self) -> Result<InferiorStatus> {
        expect_payload!(self, Request::InferiorStatus, Payload::Status(s) => s)
    }

    pub fn interrupt(&self) -> Result<()> {
        expect_payload!(self, Request::Interrupt, Payload::Done => ())
    }

    /// Resume the target
    pub fn resume(&self) -> Result<()> {
        expect_payload!(self, Request::Continue, Payload::Done => ())
    }

    pub fn detach(&self) -> Result<()> {
        expect_payload!(self, Request::Detach, Payload::Done => ())
    }

    /// Detach while the executor keeps serving
    pub fn phase_out(&self) -> Result<()> {
        expect_payload!(self, Request::PhaseOut, Payload::Done => ())
    }

    /// Attach back to the process after [`Controller::phase_out`]
    pub fn phase_in(&self) -> Result<()> {
        expect_payload!(self, Request::PhaseIn, Payload::Done => ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::Response;

    /// Answers every request with a fixed response
    struct Canned(Response);

    impl Transport for Canned {
        fn exchange(&mut self, _request: &Request, _timeout: Duration) -> std::result::Result<Response, TransportError> {
            Ok(self.0.clone())
        }
    }

    struct Unreachable;

    impl Transport for Unreachable {
        fn exchange(&mut self, _request: &Request, _timeout: Duration) -> std::result::Result<Response, TransportError> {
            Err(TransportError::ExecutorUnavailable("no executor".into()))
        }
    }

    fn controller(transport: Box<dyn Transport>, dir: &tempfile::TempDir) -> Controller {
        Controller::new(transport, 9, EngineConfig::default().with_ipc_dir(dir.path()))
    }

    #[test]
    fn test_unavailable_executor_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(Box::new(Unreachable), &dir);
        assert!(matches!(
            controller.read_registers(),
            Err(ControllerError::ExecutorUnavailable(_))
        ));
    }

    #[test]
    fn test_unexpected_payload_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(Box::new(Canned(Ok(Payload::Done))), &dir);
        let err = controller.stack_info().unwrap_err();
        assert!(matches!(
            err,
            ControllerError::UnexpectedPayload {
                request: "GetStackInfo",
                got: "Done"
            }
        ));
    }

    #[test]
    fn test_try_request_is_busy_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(Box::new(Canned(Ok(Payload::Done))), &dir);
        let _held = controller.transport.lock().unwrap();
        assert!(matches!(
            controller.try_request(Request::InferiorStatus),
            Err(ControllerError::Busy)
        ));
    }

    #[test]
    fn test_running_teardown_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let refusal = Err(Failure::InvalidTransition("running".into()));
        let controller = controller(Box::new(Canned(refusal)), &dir);

        assert_eq!(controller.stop_tracking(3, false).unwrap(), Teardown::Deferred);
        assert_eq!(controller.stop_tracking(3, false).unwrap(), Teardown::Deferred);
        assert_eq!(controller.deferred_teardowns().unwrap(), vec![3]);
        assert!(controller.flush_deferred().unwrap().is_empty());
        assert_eq!(controller.deferred_teardowns().unwrap(), vec![3]);

        assert!(matches!(
            controller.stop_tracking(4, true),
            Err(ControllerError::Failed(Failure::InvalidTransition(_)))
        ));
    }

    #[test]
    fn test_cancel_markers_are_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(Box::new(Canned(Ok(Payload::Dissection(DissectionOutcome::Finished)))), &dir);
        controller.cancel_dissect_code().unwrap();
        assert!(dir.path().join("9").join("dissect_cancel.json").exists());

        // Starting a new run clears a stale marker
        controller.dissect_code(Vec::new(), false).unwrap();
        assert!(!dir.path().join("9").join("dissect_cancel.json").exists());

        controller.cancel_trace(2).unwrap();
        assert!(dir.path().join("9").join("trace_cancel_2.json").exists());
        assert_eq!(controller.trace_status(2).unwrap(), None);
    }

    #[test]
    fn test_trace_file_round_trip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(Box::new(Unreachable), &dir);
        let mut arena = TraceArena::new();
        let root = arena.root();
        arena.push_child(root, crate::trace::TraceNode {
            instruction: "0x1000:\tnop".into(),
            registers: None,
        });
        let path = dir.path().join("run.trace");
        controller.save_trace(&arena, &path).unwrap();
        assert_eq!(Controller::load_trace(&path).unwrap(), arena);

        std::fs::write(&path, "{\"nodes\": []}").unwrap();
        assert!(matches!(Controller::load_trace(&path), Err(ControllerError::Codec(_))));
    }
}
