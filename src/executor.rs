//! Executor
//!
//! Runs next to the debugger and owns every per-process store: the
//! cross-reference indexes, tracking sessions and pending breakpoint
//! actions. Requests are handled one at a time on a single loop, so two
//! dissections of the same process can never overlap. Between requests the
//! loop polls a running inferior for stops and runs the action attached to
//! the breakpoint that fired.

use std::collections::HashMap;

use crate::analysis::loader::{FunctionKind, SymbolTable};
use crate::config::EngineConfig;
use crate::core::memory::MemoryRegion;
use crate::debug::expr::{evaluate, ExprError, TargetContext};
use crate::debug::stack::{frame_info, frame_return_addresses, stack_info, stack_trace};
use crate::debug::{BreakpointId, DebugError, Debugger, InferiorStatus, RegisterSelection, StopEvent};
use crate::disasm::engine::DisassemblyEngine;
use crate::dissect::search::{referrers, search_referenced_calls, search_referenced_strings, TextMatcher};
use crate::dissect::{
    CodeDissector, CrossReferenceStores, DissectOptions, DissectState, DissectionObserver,
    DissectionProgress, DissectionStatus,
};
use crate::ipc::blob::{BlobError, BlobKind, BlobStore};
use crate::ipc::cancel::CancellationToken;
use crate::ipc::protocol::{ExaminedExpression, Failure, Payload, Request, Response};
use crate::ipc::transport::{Endpoint, TransportError};
use crate::trace::{InstructionTracer, TraceArena, TraceParams, TraceSink, TraceStatus};
use crate::track::AccessTracker;

impl From<DebugError> for Failure {
    fn from(e: DebugError) -> Self {
        match e {
            DebugError::TargetRunning | DebugError::Exited => Failure::InvalidTransition(e.to_string()),
            DebugError::NoSuchBreakpoint(_) => Failure::NotFound(e.to_string()),
            other => Failure::Debugger(other.to_string()),
        }
    }
}

impl From<BlobError> for Failure {
    fn from(e: BlobError) -> Self {
        Failure::Debugger(e.to_string())
    }
}

/// What to do when a breakpoint or watchpoint fires
#[derive(Debug, Clone)]
enum BreakpointAction {
    Trace(TraceParams),
    TrackWatchpoint,
    TrackBreakpoint { expressions: Vec<String> },
}

/// Publishes dissection progress and persists stores as regions complete
struct BlobProgress<'a> {
    blobs: &'a BlobStore,
    pid: u32,
    last: Option<DissectionProgress>,
}

impl DissectionObserver for BlobProgress<'_> {
    fn chunk_indexed(&mut self, progress: &DissectionProgress) {
        let status = DissectionStatus {
            state: DissectState::Running,
            progress: Some(progress.clone()),
        };
        if let Err(e) = self.blobs.write(self.pid, BlobKind::DissectStatus, &status) {
            log::warn!("{}", e);
        }
        self.last = Some(progress.clone());
    }

    fn region_finished(&mut self, stores: &CrossReferenceStores) {
        if let Err(e) = stores.persist(self.blobs, self.pid) {
            log::warn!("{}", e);
        }
    }
}

/// Publishes trace status and result blobs for one breakpoint
struct BlobTraceSink<'a> {
    blobs: &'a BlobStore,
    pid: u32,
    id: BreakpointId,
}

impl TraceSink for BlobTraceSink<'_> {
    fn status(&mut self, status: &TraceStatus) {
        if let Err(e) = self.blobs.write(self.pid, BlobKind::TraceStatus(self.id), status) {
            log::warn!("{}", e);
        }
    }

    fn result(&mut self, arena: &TraceArena) {
        if let Err(e) = self.blobs.write(self.pid, BlobKind::TraceResult(self.id), arena) {
            log::warn!("{}", e);
        }
    }
}

/// Request handler bound to one debugged process
pub struct Executor<D: Debugger> {
    debugger: D,
    config: EngineConfig,
    blobs: BlobStore,
    symbols: SymbolTable,
    engine: DisassemblyEngine,
    references: HashMap<u32, CrossReferenceStores>,
    tracker: AccessTracker,
    actions: HashMap<BreakpointId, BreakpointAction>,
    detached: bool,
}

impl<D: Debugger> Executor<D> {
    /// Wrap `debugger`, loading symbols of every mapped object
    pub fn new(debugger: D, config: EngineConfig) -> Self {
        let symbols = match debugger.regions() {
            Ok(regions) => SymbolTable::load_process(&regions),
            Err(e) => {
                log::warn!("No process map, symbols unavailable: {}", e);
                SymbolTable::new()
            }
        };
        Self::with_symbols(debugger, config, symbols)
    }

    /// Wrap `debugger` with a prepared symbol table
    pub fn with_symbols(debugger: D, config: EngineConfig, symbols: SymbolTable) -> Self {
        Self {
            blobs: BlobStore::new(&config.ipc_dir),
            engine: DisassemblyEngine::with_bitness(config.bitness),
            tracker: AccessTracker::new(&config),
            debugger,
            config,
            symbols,
            references: HashMap::new(),
            actions: HashMap::new(),
            detached: false,
        }
    }

    pub fn debugger(&self) -> &D {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut D {
        &mut self.debugger
    }

    pub fn into_debugger(self) -> D {
        self.debugger
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Serve requests until the controller goes away or the process is detached
    pub fn serve(&mut self, endpoint: &mut dyn Endpoint) -> Result<(), TransportError> {
        log::info!("Serving process {}", self.debugger.pid());
        while !self.detached {
            self.poll_stops();
            match endpoint.recv(self.config.poll_interval) {
                Ok(Some(envelope)) => {
                    let response = self.handle(envelope.body);
                    if let Err(e) = endpoint.reply(envelope.seq, response) {
                        log::warn!("Reply #{} not delivered: {}", envelope.seq, e);
                    }
                }
                Ok(None) => {}
                Err(TransportError::Disconnected) => {
                    log::info!("Controller disconnected");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Deliver pending stop events of a running inferior
    pub fn poll_stops(&mut self) {
        while self.debugger.status().is_running() {
            match self.debugger.poll_event() {
                Ok(Some(event)) => self.on_stop(event),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Polling for stops failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Answer one request
    pub fn handle(&mut self, request: Request) -> Response {
        let name = request.name();
        log::debug!("Handling {}", name);
        let response = self.dispatch(request);
        if let Err(failure) = &response {
            log::warn!("{} failed: {}", name, failure);
        }
        response
    }

    fn dispatch(&mut self, request: Request) -> Response {
        let pid = self.debugger.pid();
        match request {
            Request::ReadRegisters => Ok(Payload::Registers(
                self.debugger.register_snapshot(RegisterSelection::CPU)?,
            )),
            Request::ReadFloatRegisters => Ok(Payload::Registers(
                self.debugger.float_registers()?.snapshot(),
            )),
            Request::GetStackInfo => {
                let registers = self.debugger.registers()?;
                Ok(Payload::StackInfo(stack_info(
                    &registers,
                    self.debugger.memory(),
                    &self.symbols,
                    self.config.stack_scan_len,
                )))
            }
            Request::GetStackTraceInfo => {
                let registers = self.debugger.registers()?;
                Ok(Payload::StackTrace(stack_trace(
                    &registers,
                    self.debugger.memory(),
                    &self.symbols,
                )))
            }
            Request::GetFrameReturnAddresses => {
                let registers = self.debugger.registers()?;
                Ok(Payload::ReturnAddresses(frame_return_addresses(
                    &registers,
                    self.debugger.memory(),
                    &self.symbols,
                )))
            }
            Request::GetFrameInfo { index } => {
                let registers = self.debugger.registers()?;
                Ok(Payload::Frame(frame_info(
                    &registers,
                    self.debugger.memory(),
                    &self.symbols,
                    index,
                )))
            }
            Request::HexDump { address, length } => {
                if length > self.config.max_hex_dump_len {
                    return Err(Failure::Rejected(format!(
                        "hex dump of {:#x} bytes exceeds the {:#x} byte limit",
                        length, self.config.max_hex_dump_len
                    )));
                }
                Ok(Payload::HexDump {
                    address,
                    bytes: self.debugger.memory().hex_dump(address, length),
                })
            }
            Request::ExecutableRegions => Ok(Payload::Regions(self.debugger.executable_regions()?)),

            Request::DissectCode {
                regions,
                discard_invalid_strings,
            } => self.dissect(regions, discard_invalid_strings),
            Request::ResetDissectCode => {
                self.references.insert(pid, CrossReferenceStores::new());
                CrossReferenceStores::discard(&self.blobs, pid)?;
                self.blobs.remove(pid, BlobKind::DissectStatus)?;
                Ok(Payload::Done)
            }
            Request::GetReferenceCounts => Ok(Payload::Counts(self.stores(pid).counts())),
            Request::SearchReferencedStrings {
                pattern,
                case_sensitive,
                regex,
                value_type,
            } => {
                let matcher = matcher(&pattern, case_sensitive, regex)?;
                self.stores(pid);
                let stores = self.references.get(&pid).ok_or_else(missing_stores)?;
                Ok(Payload::ReferencedStrings(search_referenced_strings(
                    stores,
                    self.debugger.memory(),
                    &matcher,
                    value_type,
                )))
            }
            Request::SearchReferencedCalls {
                pattern,
                case_sensitive,
                regex,
            } => {
                let matcher = matcher(&pattern, case_sensitive, regex)?;
                self.stores(pid);
                let stores = self.references.get(&pid).ok_or_else(missing_stores)?;
                Ok(Payload::ReferencedCalls(search_referenced_calls(
                    stores,
                    &self.symbols,
                    &matcher,
                )))
            }
            Request::GetReferrers { address } => {
                self.stores(pid);
                let stores = self.references.get(&pid).ok_or_else(missing_stores)?;
                Ok(Payload::Referrers(referrers(stores, &self.symbols, address)))
            }

            Request::ExamineExpressions { expressions } => Ok(Payload::Examined(self.examine(&expressions))),
            Request::SearchFunctions {
                pattern,
                case_sensitive,
            } => {
                let found = self
                    .symbols
                    .search(&pattern, case_sensitive)
                    .map_err(|e| Failure::Rejected(e.to_string()))?;
                Ok(Payload::Functions(
                    found
                        .into_iter()
                        .map(|f| match f.kind {
                            FunctionKind::Defined => (None, f.name),
                            FunctionKind::NonDebugging => (Some(f.address), f.name),
                        })
                        .collect(),
                ))
            }

            Request::TraceInstructions { address, params } => self.install_trace(address, params),
            Request::TrackWatchpoint {
                address,
                length,
                kind,
            } => {
                let id = self.debugger.set_watchpoint(address, length, kind)?;
                self.tracker.open_watchpoint(id);
                self.persist_watchpoint(id);
                self.actions.insert(id, BreakpointAction::TrackWatchpoint);
                log::info!("Tracking accesses to {:#x} ({} bytes) as watchpoint {}", address, length, id);
                Ok(Payload::Breakpoint(id))
            }
            Request::TrackBreakpoint { address, expressions } => {
                let id = self.debugger.set_breakpoint(address)?;
                self.tracker.open_breakpoint(id);
                self.persist_breakpoint(id);
                self.actions.insert(id, BreakpointAction::TrackBreakpoint { expressions });
                log::info!("Tracking breakpoint {} at {:#x}", id, address);
                Ok(Payload::Breakpoint(id))
            }
            Request::GetTrackWatchpointInfo { id } => self
                .tracker
                .watchpoint_records(id)
                .cloned()
                .map(Payload::WatchpointInfo)
                .ok_or_else(|| Failure::NotFound(format!("watchpoint tracking session {}", id))),
            Request::GetTrackBreakpointInfo { id } => self
                .tracker
                .breakpoint_records(id)
                .cloned()
                .map(Payload::BreakpointInfo)
                .ok_or_else(|| Failure::NotFound(format!("breakpoint tracking session {}", id))),
            Request::StopTracking { id, interrupt } => self.stop_tracking(id, interrupt),

            Request::InferiorStatus => Ok(Payload::Status(self.debugger.status())),
            Request::Interrupt => {
                self.debugger.interrupt()?;
                Ok(Payload::Done)
            }
            Request::Continue => {
                self.debugger.continue_execution()?;
                Ok(Payload::Done)
            }
            Request::Detach => {
                self.debugger.detach()?;
                self.forget_process(pid);
                self.detached = true;
                Ok(Payload::Done)
            }
            Request::PhaseOut => {
                self.debugger.detach()?;
                // Armed breakpoints died with the attachment; recorded hits stay readable
                self.actions.clear();
                log::info!("Phased out of process {}", pid);
                Ok(Payload::Done)
            }
            Request::PhaseIn => {
                self.debugger.reattach()?;
                log::info!("Phased back into process {}", pid);
                Ok(Payload::Done)
            }
        }
    }

    /// Stores of `pid`, loaded from their blobs on first use
    fn stores(&mut self, pid: u32) -> &mut CrossReferenceStores {
        let blobs = &self.blobs;
        self.references.entry(pid).or_insert_with(|| {
            CrossReferenceStores::load(blobs, pid).unwrap_or_else(|e| {
                log::warn!("Starting with empty reference stores: {}", e);
                CrossReferenceStores::new()
            })
        })
    }

    fn dissect(&mut self, regions: Vec<MemoryRegion>, discard_invalid_strings: bool) -> Response {
        if let Some(bad) = regions.iter().find(|r| r.start >= r.end) {
            return Err(Failure::Rejected(format!("empty region {}", bad.range_label())));
        }
        let regions = if regions.is_empty() {
            self.debugger.executable_regions()?
        } else {
            regions
        };

        let pid = self.debugger.pid();
        let cancel = CancellationToken::with_marker(self.blobs.clone(), pid, BlobKind::DissectCancel);
        self.blobs.write(
            pid,
            BlobKind::DissectStatus,
            &DissectionStatus {
                state: DissectState::Running,
                progress: None,
            },
        )?;

        self.stores(pid);
        let stores = self.references.get_mut(&pid).ok_or_else(missing_stores)?;
        let mut observer = BlobProgress {
            blobs: &self.blobs,
            pid,
            last: None,
        };
        let dissector = CodeDissector::new(
            self.debugger.memory(),
            DisassemblyEngine::with_bitness(self.config.bitness),
            DissectOptions::from(&self.config),
        );
        let outcome = dissector.run(&regions, discard_invalid_strings, stores, &cancel, &mut observer);

        stores.persist(&self.blobs, pid)?;
        self.blobs.write(
            pid,
            BlobKind::DissectStatus,
            &DissectionStatus {
                state: outcome.into(),
                progress: observer.last,
            },
        )?;
        cancel.clear();
        log::info!("Dissection of process {} ended: {:?}", pid, outcome);
        Ok(Payload::Dissection(outcome))
    }

    fn examine(&self, expressions: &[String]) -> Vec<ExaminedExpression> {
        let registers = self.debugger.registers().ok();
        let context = TargetContext {
            registers: registers.as_ref(),
            memory: self.debugger.memory(),
            symbols: &self.symbols,
        };
        expressions
            .iter()
            .map(|expression| match evaluate(expression, &context) {
                Ok(address) => ExaminedExpression {
                    all: self.symbols.describe(address),
                    address: Some(address),
                    symbol: self.symbols.symbolize(address),
                },
                Err(e) => ExaminedExpression {
                    all: e.to_string(),
                    address: None,
                    symbol: None,
                },
            })
            .collect()
    }

    fn install_trace(&mut self, address: u64, params: TraceParams) -> Response {
        if params.max_trace_count == 0 {
            return Err(Failure::Rejected("max trace count must be at least 1".into()));
        }
        if let Some(condition) = &params.stop_condition {
            let context = TargetContext {
                registers: None,
                memory: self.debugger.memory(),
                symbols: &self.symbols,
            };
            if let Err(ExprError::Syntax(reason)) = evaluate(condition, &context) {
                return Err(Failure::Rejected(format!("stop condition: {}", reason)));
            }
        }

        let pid = self.debugger.pid();
        let id = self.debugger.set_breakpoint(address)?;
        self.blobs.remove(pid, BlobKind::TraceCancel(id))?;
        self.blobs.remove(pid, BlobKind::TraceResult(id))?;
        self.blobs.write(pid, BlobKind::TraceStatus(id), &TraceStatus::Idle)?;
        self.actions.insert(id, BreakpointAction::Trace(params));
        log::info!("Trace armed at {:#x} as breakpoint {}", address, id);
        Ok(Payload::Breakpoint(id))
    }

    fn stop_tracking(&mut self, id: BreakpointId, interrupt: bool) -> Response {
        let known = self.actions.contains_key(&id)
            || self.tracker.watchpoint_records(id).is_some()
            || self.tracker.breakpoint_records(id).is_some();
        if !known {
            return Err(Failure::NotFound(format!("no tracking session {}", id)));
        }

        let running = self.debugger.status().is_running();
        if running && !interrupt {
            return Err(Failure::InvalidTransition(
                "the inferior is running; stop it or request a temporary interruption".into(),
            ));
        }
        if running {
            self.debugger.interrupt()?;
            // Anything that fired while stopping is handled first
            self.poll_stops();
        }

        match self.debugger.delete_breakpoint(id) {
            Ok(()) | Err(DebugError::NoSuchBreakpoint(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let pid = self.debugger.pid();
        self.actions.remove(&id);
        self.tracker.discard(id);
        self.blobs.remove(pid, BlobKind::TrackWatchpoint(id))?;
        self.blobs.remove(pid, BlobKind::TrackBreakpoint(id))?;
        log::info!("Stopped tracking {}", id);

        if running && self.debugger.status() == InferiorStatus::Stopped {
            self.debugger.continue_execution()?;
        }
        Ok(Payload::Done)
    }

    /// Run the action attached to whatever stopped the inferior
    pub fn on_stop(&mut self, event: StopEvent) {
        match event {
            StopEvent::Breakpoint { id, address } => match self.actions.get(&id).cloned() {
                Some(BreakpointAction::Trace(params)) => {
                    self.actions.remove(&id);
                    self.run_trace(id, &params);
                }
                Some(BreakpointAction::TrackBreakpoint { expressions }) => {
                    let registers = self.debugger.registers().ok();
                    let context = TargetContext {
                        registers: registers.as_ref(),
                        memory: self.debugger.memory(),
                        symbols: &self.symbols,
                    };
                    self.tracker.record_breakpoint_hit(id, &expressions, &context);
                    self.persist_breakpoint(id);
                    self.resume();
                }
                Some(BreakpointAction::TrackWatchpoint) | None => {
                    log::info!("Breakpoint {} hit at {:#x}", id, address);
                }
            },
            StopEvent::Watchpoint { id, pc } => {
                if !matches!(self.actions.get(&id), Some(BreakpointAction::TrackWatchpoint)) {
                    log::info!("Watchpoint {} triggered at {:#x}", id, pc);
                    return;
                }
                if let Err(e) = self
                    .tracker
                    .record_watchpoint_hit(id, &self.debugger, &self.engine, &self.symbols)
                {
                    log::warn!("Watchpoint {} hit not recorded: {}", id, e);
                }
                self.persist_watchpoint(id);
                self.resume();
            }
            StopEvent::Signal { signal, pc } => {
                log::info!("Stopped by signal {} at {:#x}", signal, pc);
            }
            StopEvent::Exited { code } => {
                log::info!("Process {} exited with code {}", self.debugger.pid(), code);
                self.forget_process(self.debugger.pid());
            }
        }
    }

    fn run_trace(&mut self, id: BreakpointId, params: &TraceParams) {
        let pid = self.debugger.pid();
        let cancel = CancellationToken::with_marker(self.blobs.clone(), pid, BlobKind::TraceCancel(id));
        let mut sink = BlobTraceSink {
            blobs: &self.blobs,
            pid,
            id,
        };
        let tracer = InstructionTracer::new(&self.engine, &self.symbols);
        let report = tracer.run(&mut self.debugger, id, params, &cancel, &mut sink);
        cancel.clear();
        log::info!(
            "Trace {} ended ({:?}) with {} instructions",
            id,
            report.outcome,
            report.arena.instruction_count()
        );
        if let Some(event) = report.interrupted_by {
            self.on_stop(event);
        }
    }

    fn resume(&mut self) {
        if let Err(e) = self.debugger.continue_execution() {
            log::warn!("Could not resume after tracking hit: {}", e);
        }
    }

    fn persist_watchpoint(&self, id: BreakpointId) {
        if let Some(records) = self.tracker.watchpoint_records(id) {
            if let Err(e) = self.blobs.write(self.debugger.pid(), BlobKind::TrackWatchpoint(id), records) {
                log::warn!("{}", e);
            }
        }
    }

    fn persist_breakpoint(&self, id: BreakpointId) {
        if let Some(records) = self.tracker.breakpoint_records(id) {
            if let Err(e) = self.blobs.write(self.debugger.pid(), BlobKind::TrackBreakpoint(id), records) {
                log::warn!("{}", e);
            }
        }
    }

    /// Drop everything kept for `pid`
    fn forget_process(&mut self, pid: u32) {
        self.references.remove(&pid);
        self.tracker.clear();
        self.actions.clear();
        if let Err(e) = self.blobs.clear_process(pid) {
            log::warn!("{}", e);
        }
    }
}

fn matcher(pattern: &str, case_sensitive: bool, regex: bool) -> Result<TextMatcher, Failure> {
    TextMatcher::new(pattern, case_sensitive, regex).map_err(|e| Failure::Rejected(e.to_string()))
}

fn missing_stores() -> Failure {
    Failure::Debugger("reference stores unavailable".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryImage;
    use crate::debug::replay::ReplayDebugger;
    use crate::debug::WatchpointKind;
    use crate::dissect::DissectionOutcome;
    use crate::trace::StepMode;

    // 0x1000: call 0x1010 ; 0x1005: nop ; 0x1006: ret ; 0x1010: nop ; 0x1011: ret
    fn replay() -> ReplayDebugger {
        let image = MemoryImage::new()
            .with_segment(0x1000, &[0xE8, 0x0B, 0x00, 0x00, 0x00, 0x90, 0xC3])
            .with_segment(0x1010, &[0x90, 0xC3]);
        ReplayDebugger::new(42, image, &[0x1000, 0x1010, 0x1011, 0x1005, 0x1006])
            .with_regions(vec![MemoryRegion::new(0x1000, 0x1012, "r-xp", "[anon]")])
    }

    fn executor(dir: &tempfile::TempDir) -> Executor<ReplayDebugger> {
        let config = EngineConfig::default().with_ipc_dir(dir.path());
        Executor::with_symbols(replay(), config, SymbolTable::new())
    }

    #[test]
    fn test_running_target_rejects_register_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        executor.handle(Request::Continue).unwrap();
        let response = executor.handle(Request::ReadRegisters);
        assert!(matches!(response, Err(Failure::InvalidTransition(_))));
    }

    #[test]
    fn test_dissect_writes_status_and_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        let response = executor.handle(Request::DissectCode {
            regions: Vec::new(),
            discard_invalid_strings: false,
        });
        assert_eq!(response, Ok(Payload::Dissection(DissectionOutcome::Finished)));

        let status: DissectionStatus = executor.blobs().read(42, BlobKind::DissectStatus).unwrap().unwrap();
        assert_eq!(status.state, DissectState::Finished);
        let persisted = CrossReferenceStores::load(executor.blobs(), 42).unwrap();
        assert_eq!(persisted.calls.keys().copied().collect::<Vec<_>>(), vec![0x1010]);

        executor.handle(Request::ResetDissectCode).unwrap();
        assert_eq!(
            executor.handle(Request::GetReferenceCounts),
            Ok(Payload::Counts(Default::default()))
        );
    }

    #[test]
    fn test_oversized_hex_dump_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        let response = executor.handle(Request::HexDump {
            address: 0x1000,
            length: usize::MAX,
        });
        assert!(matches!(response, Err(Failure::Rejected(_))));

        let response = executor.handle(Request::HexDump {
            address: 0x1010,
            length: 4,
        });
        assert_eq!(
            response,
            Ok(Payload::HexDump {
                address: 0x1010,
                bytes: vec!["90".into(), "c3".into(), "??".into(), "??".into()],
            })
        );
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        let response = executor.handle(Request::SearchReferencedCalls {
            pattern: "(".into(),
            case_sensitive: true,
            regex: true,
        });
        assert!(matches!(response, Err(Failure::Rejected(_))));
    }

    #[test]
    fn test_stop_tracking_while_running_needs_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        let Ok(Payload::Breakpoint(id)) = executor.handle(Request::TrackWatchpoint {
            address: 0x8000,
            length: 4,
            kind: WatchpointKind::Write,
        }) else {
            panic!("watchpoint not installed");
        };
        executor.handle(Request::Continue).unwrap();

        let refused = executor.handle(Request::StopTracking { id, interrupt: false });
        assert!(matches!(refused, Err(Failure::InvalidTransition(_))));
        assert_eq!(executor.debugger().watchpoints().len(), 1);

        executor
            .handle(Request::StopTracking { id, interrupt: true })
            .unwrap();
        assert!(executor.debugger().watchpoints().is_empty());
        assert_eq!(executor.debugger().status(), InferiorStatus::Running);
        assert!(matches!(
            executor.handle(Request::GetTrackWatchpointInfo { id }),
            Err(Failure::NotFound(_))
        ));
    }

    #[test]
    fn test_trace_runs_when_breakpoint_fires() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        let Ok(Payload::Breakpoint(id)) = executor.handle(Request::TraceInstructions {
            address: 0x1005,
            params: TraceParams {
                max_trace_count: 2,
                stop_after_trace: true,
                ..TraceParams::default()
            },
        }) else {
            panic!("trace not armed");
        };
        executor.handle(Request::Continue).unwrap();
        executor.poll_stops();

        let status: TraceStatus = executor.blobs().read(42, BlobKind::TraceStatus(id)).unwrap().unwrap();
        assert_eq!(status, TraceStatus::Finished);
        let arena: TraceArena = executor.blobs().read(42, BlobKind::TraceResult(id)).unwrap().unwrap();
        assert_eq!(arena.instruction_count(), 2);
        assert_eq!(executor.debugger().status(), InferiorStatus::Stopped);
    }

    #[test]
    fn test_breakpoint_hit_during_step_over_trace_is_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let image = MemoryImage::new()
            .with_segment(0x1000, &[0xE8, 0x0B, 0x00, 0x00, 0x00, 0x90, 0xC3])
            .with_segment(0x1010, &[0x90, 0xC3]);
        let debugger = ReplayDebugger::new(42, image, &[0x1006, 0x1000, 0x1010, 0x1011, 0x1005, 0x1006]);
        let config = EngineConfig::default().with_ipc_dir(dir.path());
        let mut executor = Executor::with_symbols(debugger, config, SymbolTable::new());

        let Ok(Payload::Breakpoint(trace)) = executor.handle(Request::TraceInstructions {
            address: 0x1000,
            params: TraceParams {
                max_trace_count: 10,
                step_mode: StepMode::StepOver,
                ..TraceParams::default()
            },
        }) else {
            panic!("trace not armed");
        };
        let Ok(Payload::Breakpoint(tracked)) = executor.handle(Request::TrackBreakpoint {
            address: 0x1010,
            expressions: vec!["$pc".into()],
        }) else {
            panic!("breakpoint not tracked");
        };
        executor.handle(Request::Continue).unwrap();
        executor.poll_stops();

        // The callee's breakpoint cut the trace short after the call
        let arena: TraceArena = executor.blobs().read(42, BlobKind::TraceResult(trace)).unwrap().unwrap();
        assert_eq!(arena.instruction_count(), 1);
        let records = executor.handle(Request::GetTrackBreakpointInfo { id: tracked }).unwrap();
        let Payload::BreakpointInfo(records) = records else {
            panic!("unexpected payload");
        };
        assert_eq!(records["$pc"][&0x1010], 1);
        assert_eq!(executor.debugger().status(), InferiorStatus::Running);
    }

    #[test]
    fn test_bad_stop_condition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        let response = executor.handle(Request::TraceInstructions {
            address: 0x1005,
            params: TraceParams {
                stop_condition: Some("$rax ==".into()),
                ..TraceParams::default()
            },
        });
        assert!(matches!(response, Err(Failure::Rejected(_))));
        assert_eq!(executor.debugger().breakpoint_count(), 0);
    }

    #[test]
    fn test_examine_reports_errors_inline() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        let Ok(Payload::Examined(results)) = executor.handle(Request::ExamineExpressions {
            expressions: vec!["$pc+5".into(), "nosuchsymbol".into()],
        }) else {
            panic!("examine failed");
        };
        assert_eq!(results[0].address, Some(0x1005));
        assert_eq!(results[1].address, None);
        assert!(results[1].all.contains("nosuchsymbol"));
    }

    #[test]
    fn test_phase_out_and_in_keeps_process_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        executor
            .handle(Request::DissectCode {
                regions: Vec::new(),
                discard_invalid_strings: false,
            })
            .unwrap();
        let Ok(Payload::Breakpoint(id)) = executor.handle(Request::TrackBreakpoint {
            address: 0x1010,
            expressions: vec!["$pc".into()],
        }) else {
            panic!("breakpoint not tracked");
        };

        executor.handle(Request::PhaseOut).unwrap();
        assert_eq!(executor.debugger().status(), InferiorStatus::Detached);
        assert_eq!(executor.debugger().breakpoint_count(), 0);
        assert!(executor.handle(Request::ReadRegisters).is_err());
        // Indexes and recorded hits survive the detach
        assert!(CrossReferenceStores::load(executor.blobs(), 42).unwrap().calls.contains_key(&0x1010));
        assert!(executor.handle(Request::GetTrackBreakpointInfo { id }).is_ok());

        executor.handle(Request::PhaseIn).unwrap();
        assert_eq!(executor.debugger().status(), InferiorStatus::Stopped);
        assert!(executor.handle(Request::ReadRegisters).is_ok());
        executor.handle(Request::StopTracking { id, interrupt: false }).unwrap();
        assert!(executor.handle(Request::GetTrackBreakpointInfo { id }).is_err());
    }

    #[test]
    fn test_exit_discards_process_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = executor(&dir);
        executor
            .handle(Request::TrackBreakpoint {
                address: 0x1010,
                expressions: vec!["$rsp".into()],
            })
            .unwrap();
        assert!(executor.blobs().path(42, BlobKind::TrackBreakpoint(1)).exists());

        executor.on_stop(StopEvent::Exited { code: 0 });
        assert!(!dir.path().join("42").exists());
        assert!(matches!(
            executor.handle(Request::GetTrackBreakpointInfo { id: 1 }),
            Err(Failure::NotFound(_))
        ));
    }
}
