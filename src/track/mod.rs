//! Access Tracker
//!
//! Hit statistics for tracking sessions. A watchpoint session keeps the
//! latest context per accessing PC; a breakpoint session counts, per
//! register expression, how often each resolved address was seen.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::analysis::loader::SymbolTable;
use crate::config::EngineConfig;
use crate::debug::expr::{evaluate, ExprContext};
use crate::debug::{BreakpointId, DebugError, Debugger, RegisterSelection, RegisterSnapshot};
use crate::disasm::engine::DisassemblyEngine;

/// Latest view of one watchpoint-triggering site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchpointHit {
    pub hit_count: u32,
    /// Address of the instruction that made the access
    pub previous_instruction: u64,
    pub registers: RegisterSnapshot,
    pub float_registers: RegisterSnapshot,
    /// Listing starting at `previous_instruction`
    pub disassembly: Vec<String>,
}

/// PC at hit -> latest hit
pub type WatchpointRecords = BTreeMap<u64, WatchpointHit>;

/// Expression -> resolved address -> hit count
pub type BreakpointRecords = BTreeMap<String, BTreeMap<u64, u32>>;

/// Per-session hit stores, keyed by breakpoint id
#[derive(Debug, Default)]
pub struct AccessTracker {
    watchpoints: HashMap<BreakpointId, WatchpointRecords>,
    breakpoints: HashMap<BreakpointId, BreakpointRecords>,
    previous_window: u64,
    context_len: usize,
}

impl AccessTracker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            watchpoints: HashMap::new(),
            breakpoints: HashMap::new(),
            previous_window: config.previous_insn_window,
            context_len: config.context_disassembly_len,
        }
    }

    /// Record a hit of watchpoint `id` at the current stop
    pub fn record_watchpoint_hit(
        &mut self,
        id: BreakpointId,
        debugger: &dyn Debugger,
        engine: &DisassemblyEngine,
        symbols: &SymbolTable,
    ) -> Result<&WatchpointHit, DebugError> {
        let pc = debugger.program_counter()?;
        let memory = debugger.memory();
        let previous = engine
            .previous_instruction(memory, pc, self.previous_window)
            .unwrap_or(pc);

        let registers = debugger.register_snapshot(RegisterSelection::CPU)?;
        let float_registers = debugger
            .float_registers()
            .map(|f| f.snapshot())
            .unwrap_or_else(|e| {
                log::debug!("Float registers unavailable: {}", e);
                RegisterSnapshot::new()
            });
        let disassembly = engine
            .disassemble_range(memory, previous, self.context_len)
            .into_iter()
            .filter(|insn| !insn.invalid)
            .map(|insn| {
                let marker = if insn.address == pc { "=> " } else { "   " };
                format!("{}{}:\t{}", marker, symbols.describe(insn.address), insn.text)
            })
            .collect();

        let hit = self.watchpoints.entry(id).or_default().entry(pc).or_default();
        hit.hit_count += 1;
        hit.previous_instruction = previous;
        hit.registers = registers;
        hit.float_registers = float_registers;
        hit.disassembly = disassembly;
        log::debug!("Watchpoint {} hit #{} at {:#x}", id, hit.hit_count, pc);
        Ok(hit)
    }

    /// Record a hit of breakpoint `id`, resolving every expression.
    /// Each expression gets its own bucket, created even when it does
    /// not resolve this time.
    pub fn record_breakpoint_hit(
        &mut self,
        id: BreakpointId,
        expressions: &[String],
        context: &dyn ExprContext,
    ) -> &BreakpointRecords {
        let records = self.breakpoints.entry(id).or_default();
        for expression in expressions.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            let bucket = records.entry(expression.to_string()).or_default();
            match evaluate(expression, context) {
                Ok(address) => *bucket.entry(address).or_insert(0) += 1,
                Err(e) => log::debug!("Skipping `{}` at breakpoint {}: {}", expression, id, e),
            }
        }
        records
    }

    pub fn watchpoint_records(&self, id: BreakpointId) -> Option<&WatchpointRecords> {
        self.watchpoints.get(&id)
    }

    pub fn breakpoint_records(&self, id: BreakpointId) -> Option<&BreakpointRecords> {
        self.breakpoints.get(&id)
    }

    /// Start an empty session so queries before the first hit succeed
    pub fn open_watchpoint(&mut self, id: BreakpointId) {
        self.watchpoints.entry(id).or_default();
    }

    pub fn open_breakpoint(&mut self, id: BreakpointId) {
        self.breakpoints.entry(id).or_default();
    }

    /// Drop the records of one session; true if it existed
    pub fn discard(&mut self, id: BreakpointId) -> bool {
        let watch = self.watchpoints.remove(&id).is_some();
        let bp = self.breakpoints.remove(&id).is_some();
        watch || bp
    }

    pub fn clear(&mut self) {
        self.watchpoints.clear();
        self.breakpoints.clear();
    }
}
