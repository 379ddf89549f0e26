use super::*;
use crate::core::memory::MemoryImage;
use crate::debug::replay::ReplayDebugger;
use crate::debug::{Debugger, RegisterState, StopEvent, WatchpointKind};
use std::collections::HashMap;

// 0x2000: mov dword [rax], ebx   (89 18)
// 0x2002: nop
// 0x2003: mov dword [rax], ecx   (89 08)
// 0x2005: nop
fn image() -> MemoryImage {
    MemoryImage::new().with_segment(0x2000, &[0x89, 0x18, 0x90, 0x89, 0x08, 0x90, 0x90, 0x90])
}

fn tracker() -> AccessTracker {
    AccessTracker::new(&EngineConfig::default())
}

fn state(rip: u64, rbx: u64) -> RegisterState {
    RegisterState {
        rip,
        rbx,
        rax: 0x7000,
        ..Default::default()
    }
}

#[test]
fn test_same_pc_twice_counts_two_and_keeps_latest_context() {
    let script = vec![state(0x2002, 1), state(0x2005, 9), state(0x2002, 2)];
    let mut debugger = ReplayDebugger::with_script(3, image(), script);
    let id = debugger.set_watchpoint(0x7000, 4, WatchpointKind::Write).unwrap();
    let engine = DisassemblyEngine::new();
    let symbols = SymbolTable::new();
    let mut tracker = tracker();

    tracker.record_watchpoint_hit(id, &debugger, &engine, &symbols).unwrap();
    debugger.queue_stop(2, StopEvent::Watchpoint { id, pc: 0x2002 });
    debugger.continue_execution().unwrap();
    debugger.poll_event().unwrap();
    let hit = tracker.record_watchpoint_hit(id, &debugger, &engine, &symbols).unwrap();

    assert_eq!(hit.hit_count, 2);
    assert_eq!(hit.registers["rbx"], "0x2");
    assert_eq!(hit.previous_instruction, 0x2000);
    assert!(hit.disassembly[0].contains("0x2000:\tmov"));
    assert!(hit.disassembly[1].starts_with("=> 0x2002"));
    assert_eq!(tracker.watchpoint_records(id).unwrap().len(), 1);
}

#[test]
fn test_distinct_pcs_get_distinct_records() {
    let script = vec![state(0x2002, 1), state(0x2005, 1)];
    let mut debugger = ReplayDebugger::with_script(3, image(), script);
    let engine = DisassemblyEngine::new();
    let symbols = SymbolTable::new();
    let mut tracker = tracker();

    tracker.record_watchpoint_hit(1, &debugger, &engine, &symbols).unwrap();
    debugger.single_step().unwrap();
    tracker.record_watchpoint_hit(1, &debugger, &engine, &symbols).unwrap();

    let records = tracker.watchpoint_records(1).unwrap();
    assert_eq!(records.keys().copied().collect::<Vec<_>>(), vec![0x2002, 0x2005]);
    assert_eq!(records[&0x2005].previous_instruction, 0x2003);
}

#[test]
fn test_previous_instruction_falls_back_to_pc() {
    // Nothing mapped before the PC
    let image = MemoryImage::new().with_segment(0x9000, &[0x90]);
    let debugger = ReplayDebugger::new(3, image, &[0x9000]);
    let mut tracker = tracker();
    let hit = tracker
        .record_watchpoint_hit(4, &debugger, &DisassemblyEngine::new(), &SymbolTable::new())
        .unwrap();
    assert_eq!(hit.previous_instruction, 0x9000);
}

struct Registers(HashMap<&'static str, u64>);

impl ExprContext for Registers {
    fn register(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    fn symbol(&self, _name: &str) -> Option<u64> {
        None
    }
}

#[test]
fn test_expressions_resolving_to_same_address_keep_separate_buckets() {
    let context = Registers(HashMap::from([("rax", 0x5000), ("rbx", 0x4ff0)]));
    let expressions = vec!["$rax".to_string(), "$rbx+0x10".to_string()];
    let mut tracker = tracker();

    tracker.record_breakpoint_hit(2, &expressions, &context);
    let records = tracker.record_breakpoint_hit(2, &expressions, &context);

    assert_eq!(records.len(), 2);
    assert_eq!(records["$rax"][&0x5000], 2);
    assert_eq!(records["$rbx+0x10"][&0x5000], 2);
}

#[test]
fn test_unresolvable_and_empty_expressions() {
    let context = Registers(HashMap::from([("rax", 0x5000)]));
    let expressions = vec!["$rax".to_string(), "$nope".to_string(), "  ".to_string()];
    let mut tracker = tracker();
    let records = tracker.record_breakpoint_hit(2, &expressions, &context);

    assert_eq!(records.len(), 2);
    assert!(records["$nope"].is_empty());
    assert_eq!(records["$rax"][&0x5000], 1);
}

#[test]
fn test_discard_drops_session() {
    let mut tracker = tracker();
    tracker.open_watchpoint(5);
    tracker.open_breakpoint(6);
    assert!(tracker.watchpoint_records(5).unwrap().is_empty());
    assert!(tracker.discard(5));
    assert!(!tracker.discard(5));
    assert!(tracker.watchpoint_records(5).is_none());
    tracker.clear();
    assert!(tracker.breakpoint_records(6).is_none());
}
