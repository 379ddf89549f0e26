//! End-to-end tests: a controller talking to an executor thread over the
//! in-process channel, with a replayed target.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use scryer::analysis::SymbolTable;
use scryer::config::EngineConfig;
use scryer::controller::{Controller, ControllerError, Teardown};
use scryer::core::{MemoryImage, MemoryRegion};
use scryer::debug::replay::ReplayDebugger;
use scryer::debug::{InferiorStatus, StopEvent, WatchpointKind};
use scryer::dissect::{DissectState, DissectionOutcome};
use scryer::executor::Executor;
use scryer::ipc::{channel, Failure};
use scryer::trace::{TraceParams, TraceStatus};

const PID: u32 = 77;

fn config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig::default().with_ipc_dir(dir.path());
    config.poll_interval = Duration::from_millis(5);
    config.request_timeout = Duration::from_secs(10);
    config
}

fn start(debugger: ReplayDebugger, dir: &tempfile::TempDir) -> (Controller, JoinHandle<ReplayDebugger>) {
    let (transport, mut endpoint) = channel();
    let executor_config = config(dir);
    let handle = std::thread::spawn(move || {
        let mut executor = Executor::with_symbols(debugger, executor_config, SymbolTable::new());
        executor.serve(&mut endpoint).unwrap();
        executor.into_debugger()
    });
    (Controller::new(Box::new(transport), PID, config(dir)), handle)
}

fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for the executor");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// 0x1000: call 0x1010 ; 0x1005: nop ; 0x1006: ret ; 0x1010: nop ; 0x1011: ret
fn call_program() -> ReplayDebugger {
    let image = MemoryImage::new()
        .with_segment(0x1000, &[0xE8, 0x0B, 0x00, 0x00, 0x00, 0x90, 0xC3])
        .with_segment(0x1010, &[0x90, 0xC3]);
    ReplayDebugger::new(PID, image, &[0x1000, 0x1010, 0x1011, 0x1005, 0x1006])
        .with_regions(vec![MemoryRegion::new(0x1000, 0x1012, "r-xp", "/bin/demo")])
}

#[test]
fn test_dissect_and_search_through_controller() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, handle) = start(call_program(), &dir);

    assert_eq!(controller.dissect_code(Vec::new(), false).unwrap(), DissectionOutcome::Finished);
    let status = controller.dissect_status().unwrap().unwrap();
    assert_eq!(status.state, DissectState::Finished);
    assert_eq!(status.progress.unwrap().region_label(), "Region 1 of 1");

    let counts = controller.reference_counts().unwrap();
    assert_eq!(counts.calls, 1);

    let calls = controller.search_referenced_calls("0x1010", true, false).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].target, 0x1010);
    assert_eq!(calls[0].referrers, 1);

    let referrers = controller.referrers(0x1010).unwrap();
    assert_eq!(referrers.calls.len(), 1);

    // Bad input is a rejected request, not a dead executor
    assert!(matches!(
        controller.search_referenced_calls("[", true, true),
        Err(ControllerError::Failed(Failure::Rejected(_)))
    ));
    assert_eq!(controller.status().unwrap(), InferiorStatus::Stopped);

    drop(controller);
    handle.join().unwrap();
}

#[test]
fn test_trace_publishes_status_and_result() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, handle) = start(call_program(), &dir);

    let id = controller
        .trace_instructions(
            0x1005,
            TraceParams {
                max_trace_count: 10,
                stop_after_trace: true,
                ..TraceParams::default()
            },
        )
        .unwrap();
    assert_eq!(controller.trace_status(id).unwrap(), Some(TraceStatus::Idle));

    controller.resume().unwrap();
    let status = wait_for(|| controller.trace_status(id).unwrap().filter(TraceStatus::is_terminal));
    assert_eq!(status, TraceStatus::Finished);

    let arena = controller.trace_result(id).unwrap().unwrap();
    arena.validate().unwrap();
    assert_eq!(arena.instruction_count(), 2);

    let path = dir.path().join("saved.trace");
    controller.save_trace(&arena, &path).unwrap();
    assert_eq!(Controller::load_trace(&path).unwrap(), arena);

    drop(controller);
    handle.join().unwrap();
}

#[test]
fn test_watchpoint_tracking_and_deferred_teardown() {
    let dir = tempfile::tempdir().unwrap();
    // 0x2000: mov [rax], ebx ; 0x2002: nop ; 0x2003: mov [rax], ecx ; 0x2005: nop
    let image = MemoryImage::new().with_segment(0x2000, &[0x89, 0x18, 0x90, 0x89, 0x08, 0x90, 0x90, 0x90]);
    let mut debugger = ReplayDebugger::new(PID, image, &[0x2000, 0x2002, 0x2005, 0x2002]);
    // Watchpoint ids start at 1
    debugger.queue_stop(1, StopEvent::Watchpoint { id: 1, pc: 0x2002 });
    debugger.queue_stop(3, StopEvent::Watchpoint { id: 1, pc: 0x2002 });
    let (controller, handle) = start(debugger, &dir);

    let id = controller.track_watchpoint(0x7000, 4, WatchpointKind::Write).unwrap();
    assert_eq!(id, 1);
    controller.resume().unwrap();

    let records = wait_for(|| {
        controller
            .cached_watchpoint_info(id)
            .unwrap()
            .filter(|records| records.get(&0x2002).is_some_and(|hit| hit.hit_count == 2))
    });
    assert_eq!(records[&0x2002].previous_instruction, 0x2000);

    // Still running: teardown waits for the target to stop
    assert_eq!(controller.stop_tracking(id, false).unwrap(), Teardown::Deferred);
    assert_eq!(controller.status().unwrap(), InferiorStatus::Running);
    controller.interrupt().unwrap();
    assert_eq!(controller.flush_deferred().unwrap(), vec![id]);
    assert!(controller.cached_watchpoint_info(id).unwrap().is_none());

    drop(controller);
    let debugger = handle.join().unwrap();
    assert!(debugger.watchpoints().is_empty());
}

#[test]
fn test_detach_clears_process_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, handle) = start(call_program(), &dir);

    controller.dissect_code(Vec::new(), false).unwrap();
    assert!(dir.path().join(PID.to_string()).exists());
    controller.detach().unwrap();
    assert!(!dir.path().join(PID.to_string()).exists());

    let debugger = handle.join().unwrap();
    assert_eq!(scryer::debug::Debugger::status(&debugger), InferiorStatus::Detached);
    assert!(matches!(
        controller.status(),
        Err(ControllerError::ExecutorUnavailable(_))
    ));
}
