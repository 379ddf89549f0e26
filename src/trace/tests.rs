use super::*;
use crate::core::memory::MemoryImage;
use crate::debug::replay::ReplayDebugger;

// 0x1000: call 0x1010
// 0x1005: nop
// 0x1006: ret
// 0x1010: nop
// 0x1011: ret
fn image() -> MemoryImage {
    MemoryImage::new()
        .with_segment(0x1000, &[0xE8, 0x0B, 0x00, 0x00, 0x00, 0x90, 0xC3])
        .with_segment(0x1010, &[0x90, 0xC3])
}

const EXECUTION: [u64; 5] = [0x1000, 0x1010, 0x1011, 0x1005, 0x1006];

#[derive(Default)]
struct RecordingSink {
    statuses: Vec<TraceStatus>,
    result: Option<TraceArena>,
}

impl TraceSink for RecordingSink {
    fn status(&mut self, status: &TraceStatus) {
        self.statuses.push(status.clone());
    }

    fn result(&mut self, arena: &TraceArena) {
        self.result = Some(arena.clone());
    }
}

fn trace(params: TraceParams, cancel: &CancellationToken) -> (TraceOutcome, TraceArena, RecordingSink, ReplayDebugger) {
    let mut debugger = ReplayDebugger::new(7, image(), &EXECUTION);
    let id = debugger.set_breakpoint(0x1000).unwrap();
    let engine = DisassemblyEngine::new();
    let symbols = SymbolTable::new();
    let mut sink = RecordingSink::default();
    let report = InstructionTracer::new(&engine, &symbols).run(&mut debugger, id, &params, cancel, &mut sink);
    assert!(report.interrupted_by.is_none());
    (report.outcome, report.arena, sink, debugger)
}

fn params(max: u32, mode: StepMode) -> TraceParams {
    TraceParams {
        max_trace_count: max,
        step_mode: mode,
        stop_after_trace: true,
        ..TraceParams::default()
    }
}

fn lines(arena: &TraceArena) -> Vec<(usize, String)> {
    arena
        .walk()
        .into_iter()
        .filter_map(|(index, depth)| {
            let text = &arena.node(index)?.instruction;
            (!text.is_empty()).then(|| (depth, text.clone()))
        })
        .collect()
}

#[test]
fn test_arena_starts_with_empty_root() {
    let arena = TraceArena::new();
    assert_eq!(arena.len(), 1);
    assert_eq!(arena.root(), 0);
    assert_eq!(arena.parent(0), None);
    assert_eq!(arena.instruction_count(), 0);
    assert!(arena.validate().is_ok());
}

#[test]
fn test_promote_root_keeps_a_single_root() {
    let mut arena = TraceArena::new();
    arena.push_child(0, TraceNode {
        instruction: "a".into(),
        registers: None,
    });
    let new_root = arena.promote_root();
    assert_eq!(arena.root(), new_root);
    assert_eq!(arena.parent(0), Some(new_root));
    assert_eq!(arena.children(new_root), &[0]);
    assert!(arena.validate().is_ok());
}

#[test]
fn test_cursor_nests_calls_and_unwinds_returns() {
    let mut arena = TraceArena::new();
    let mut cursor = TraceCursor::new(&arena);
    let node = |text: &str| TraceNode {
        instruction: text.into(),
        registers: None,
    };

    let call = cursor.record(&mut arena, node("call"), FlowKind::Call, StepMode::SingleStep);
    assert_eq!(cursor.current(), call);
    cursor.record(&mut arena, node("body"), FlowKind::Sequential, StepMode::SingleStep);
    cursor.record(&mut arena, node("ret"), FlowKind::Return, StepMode::SingleStep);
    assert_eq!(cursor.current(), 0);

    // Returning past the starting function grows the tree upwards
    cursor.record(&mut arena, node("ret2"), FlowKind::Return, StepMode::SingleStep);
    assert_ne!(arena.root(), 0);
    assert_eq!(cursor.current(), arena.root());
    assert_eq!(arena.instruction_count(), 4);
    assert!(arena.validate().is_ok());
}

#[test]
fn test_step_over_does_not_descend_into_calls() {
    let mut arena = TraceArena::new();
    let mut cursor = TraceCursor::new(&arena);
    cursor.record(&mut arena, TraceNode::synthetic(), FlowKind::Call, StepMode::StepOver);
    assert_eq!(cursor.current(), 0);
}

#[test]
fn test_validate_rejects_broken_trees() {
    let mut arena = TraceArena::new();
    let child = arena.push_child(0, TraceNode::synthetic());
    arena.parent[child] = None;
    assert!(arena.validate().is_err());

    let mut cyclic = TraceArena::new();
    let a = cyclic.push_child(0, TraceNode::synthetic());
    cyclic.children[a].push(0);
    assert!(cyclic.validate().is_err());
}

#[test]
fn test_single_step_trace_builds_call_tree() {
    let (outcome, arena, sink, _) = trace(params(10, StepMode::SingleStep), &CancellationToken::new());
    assert_eq!(outcome, TraceOutcome::Finished);
    assert_eq!(arena.instruction_count(), 5);
    assert!(arena.validate().is_ok());

    let listing = lines(&arena);
    let depths: Vec<usize> = listing.iter().map(|(d, _)| *d).collect();
    // root promoted once: call/nop/ret under new root's child, callee one deeper
    assert_eq!(depths, vec![2, 3, 3, 2, 2]);
    assert!(listing[0].1.starts_with("0x1000:\tcall"));
    assert!(listing[4].1.ends_with("ret"));

    assert_eq!(sink.result.as_ref(), Some(&arena));
    let tail: Vec<_> = sink.statuses.iter().rev().take(2).cloned().collect();
    assert_eq!(tail, vec![TraceStatus::Finished, TraceStatus::Processing]);
}

#[test]
fn test_step_over_trace_skips_callee() {
    let (outcome, arena, _, _) = trace(params(10, StepMode::StepOver), &CancellationToken::new());
    assert_eq!(outcome, TraceOutcome::Finished);
    let listing = lines(&arena);
    assert_eq!(listing.len(), 3);
    assert!(listing[1].1.starts_with("0x1005:"));
    assert!(arena.validate().is_ok());
}

#[test]
fn test_max_one_yields_one_instruction_in_both_modes() {
    for mode in [StepMode::SingleStep, StepMode::StepOver] {
        let (_, arena, sink, _) = trace(params(1, mode), &CancellationToken::new());
        assert_eq!(arena.instruction_count(), 1);
        assert_eq!(arena.len(), 2);
        assert!(matches!(
            sink.statuses[0],
            TraceStatus::Tracing { step: 1, max: 1, .. }
        ));
    }
}

#[test]
fn test_stop_condition_is_checked_after_stepping() {
    let mut p = params(10, StepMode::SingleStep);
    p.stop_condition = Some("$pc == 0x1011".into());
    let (_, arena, _, debugger) = trace(p, &CancellationToken::new());
    assert_eq!(arena.instruction_count(), 2);
    assert_eq!(debugger.program_counter().unwrap(), 0x1011);
}

#[test]
fn test_cancelled_trace_publishes_partial_result() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (outcome, arena, sink, _) = trace(params(10, StepMode::SingleStep), &cancel);
    assert_eq!(outcome, TraceOutcome::Canceled);
    assert_eq!(arena.instruction_count(), 0);
    assert_eq!(sink.statuses, vec![TraceStatus::Canceled]);
    assert!(sink.result.is_some());
}

#[test]
fn test_status_sequence_is_monotonic() {
    let (_, _, sink, _) = trace(params(3, StepMode::SingleStep), &CancellationToken::new());
    let rank = |s: &TraceStatus| match s {
        TraceStatus::Idle => 0,
        TraceStatus::Tracing { .. } => 1,
        TraceStatus::Processing => 2,
        TraceStatus::Canceled | TraceStatus::Finished => 3,
    };
    assert!(sink.statuses.windows(2).all(|w| rank(&w[0]) <= rank(&w[1])));
    assert_eq!(sink.statuses[1].to_string().rsplit(' ').next(), Some("(2/3)"));
}

#[test]
fn test_breakpoint_is_removed_and_target_resumed() {
    let mut p = params(2, StepMode::SingleStep);
    p.stop_after_trace = false;
    let (_, _, _, debugger) = trace(p, &CancellationToken::new());
    assert_eq!(debugger.breakpoint_count(), 0);
    assert_eq!(debugger.status(), InferiorStatus::Running);
}

#[test]
fn test_registers_are_collected_when_requested() {
    let (_, arena, _, _) = trace(params(1, StepMode::SingleStep), &CancellationToken::new());
    let (index, _) = arena.walk()[1];
    let registers = arena.node(index).unwrap().registers.as_ref().unwrap();
    assert_eq!(registers["rip"], "0x1000");
    assert_eq!(registers["zf"], "0");

    let mut bare = params(1, StepMode::SingleStep);
    bare.collect = RegisterSelection::NONE;
    let (_, arena, _, _) = trace(bare, &CancellationToken::new());
    assert!(arena.node(1).unwrap().registers.is_none());
}

#[test]
fn test_render_indents_by_call_depth() {
    let (_, arena, _, _) = trace(params(10, StepMode::SingleStep), &CancellationToken::new());
    let rendered = arena.render();
    let second = rendered.lines().nth(1).unwrap();
    assert!(second.starts_with("    0x1010:"));
}

#[test]
fn test_breakpoint_in_stepped_over_callee_ends_trace() {
    let mut debugger = ReplayDebugger::new(7, image(), &EXECUTION);
    let id = debugger.set_breakpoint(0x1000).unwrap();
    let inner = debugger.set_breakpoint(0x1011).unwrap();
    let engine = DisassemblyEngine::new();
    let symbols = SymbolTable::new();
    let mut sink = RecordingSink::default();
    let mut p = params(10, StepMode::StepOver);
    p.stop_after_trace = false;

    let report = InstructionTracer::new(&engine, &symbols).run(
        &mut debugger,
        id,
        &p,
        &CancellationToken::new(),
        &mut sink,
    );
    assert_eq!(report.outcome, TraceOutcome::Finished);
    assert_eq!(report.arena.instruction_count(), 1);
    assert_eq!(
        report.interrupted_by,
        Some(StopEvent::Breakpoint {
            id: inner,
            address: 0x1011
        })
    );
    // Left stopped on the inner breakpoint, not resumed
    assert_eq!(debugger.status(), InferiorStatus::Stopped);
    assert_eq!(debugger.program_counter().unwrap(), 0x1011);
    assert_eq!(sink.statuses.last(), Some(&TraceStatus::Finished));
}
