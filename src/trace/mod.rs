//! Instruction Tracer
//!
//! Steps the inferior from a breakpoint hit for a bounded number of
//! instructions and rebuilds the call/return nesting of what it executed as
//! a tree stored in a flat arena.
//!
//! The tree is built without lookahead: every instruction becomes a child of
//! the cursor node. A return moves the cursor to its parent, promoting a new
//! empty root when the trace returns out of the function it started in. In
//! single-step mode a call moves the cursor onto the call node itself.

#[cfg(test)]
mod tests;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::loader::SymbolTable;
use crate::debug::expr::{condition_holds, TargetContext};
use crate::debug::{
    BreakpointId, DebugError, Debugger, InferiorStatus, RegisterSelection, RegisterSnapshot, StopEvent,
};
use crate::disasm::engine::{DisassemblyEngine, FlowKind};
use crate::ipc::cancel::CancellationToken;

/// Trace tree errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("Malformed trace tree: {0}")]
    Malformed(String),
}

/// One traced instruction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    /// `0x401000 <main>:\tpush rbp`; empty for synthetic roots
    pub instruction: String,
    pub registers: Option<RegisterSnapshot>,
}

impl TraceNode {
    pub fn synthetic() -> Self {
        Self::default()
    }
}

/// Append-only tree of trace nodes addressed by index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceArena {
    nodes: Vec<TraceNode>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    root: usize,
}

impl Default for TraceArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceArena {
    /// Arena holding a single empty root at index 0
    pub fn new() -> Self {
        Self {
            nodes: vec![TraceNode::synthetic()],
            parent: vec![None],
            children: vec![Vec::new()],
            root: 0,
        }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&TraceNode> {
        self.nodes.get(index)
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.parent.get(index).copied().flatten()
    }

    pub fn children(&self, index: usize) -> &[usize] {
        self.children.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    fn push(&mut self, node: TraceNode, parent: Option<usize>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(node);
        self.parent.push(parent);
        self.children.push(Vec::new());
        index
    }

    /// Append `node` under `parent` and return its index
    pub fn push_child(&mut self, parent: usize, node: TraceNode) -> usize {
        let index = self.push(node, Some(parent));
        self.children[parent].push(index);
        index
    }

    /// Put a new empty node above the current root and make it the root
    pub fn promote_root(&mut self) -> usize {
        let old = self.root;
        let new_root = self.push(TraceNode::synthetic(), None);
        self.parent[old] = Some(new_root);
        self.children[new_root].push(old);
        self.root = new_root;
        new_root
    }

    /// Nodes holding a real instruction
    pub fn instruction_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.instruction.is_empty()).count()
    }

    /// Check the tree shape: one parentless node which is the root,
    /// consistent parent/child links, every node reachable exactly once
    pub fn validate(&self) -> Result<(), TraceError> {
        let n = self.nodes.len();
        if self.parent.len() != n || self.children.len() != n {
            return Err(TraceError::Malformed("column lengths differ".into()));
        }
        if self.root >= n {
            return Err(TraceError::Malformed(format!("root {} out of range", self.root)));
        }
        let parentless: Vec<usize> = (0..n).filter(|&i| self.parent[i].is_none()).collect();
        if parentless != [self.root] {
            return Err(TraceError::Malformed(format!(
                "expected only node {} without parent, found {:?}",
                self.root, parentless
            )));
        }
        for (index, kids) in self.children.iter().enumerate() {
            for &child in kids {
                if self.parent.get(child).copied().flatten() != Some(index) {
                    return Err(TraceError::Malformed(format!(
                        "node {} lists {} which does not point back",
                        index, child
                    )));
                }
            }
        }

        let mut seen = vec![false; n];
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            if std::mem::replace(&mut seen[index], true) {
                return Err(TraceError::Malformed(format!("node {} reached twice", index)));
            }
            stack.extend(self.children[index].iter().copied());
        }
        match seen.iter().position(|s| !s) {
            Some(orphan) => Err(TraceError::Malformed(format!("node {} is unreachable", orphan))),
            None => Ok(()),
        }
    }

    /// Depth-first (index, depth) pairs from the root, children in order
    pub fn walk(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, 0)];
        while let Some((index, depth)) = stack.pop() {
            out.push((index, depth));
            for &child in self.children(index).iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }

    /// Indented listing, one instruction per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (index, depth) in self.walk() {
            let node = &self.nodes[index];
            if node.instruction.is_empty() {
                continue;
            }
            // Synthetic roots sit at depth 0 and are not printed
            let indent = depth.saturating_sub(1);
            out.push_str(&"  ".repeat(indent));
            out.push_str(&node.instruction);
            out.push('\n');
        }
        out
    }
}

/// How each step advances the inferior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    #[default]
    SingleStep,
    StepOver,
}

/// Position in the tree new nodes are attached under
#[derive(Debug, Clone, Copy)]
pub struct TraceCursor {
    current: usize,
}

impl TraceCursor {
    pub fn new(arena: &TraceArena) -> Self {
        Self {
            current: arena.root(),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Attach `node` and move the cursor according to `flow`
    pub fn record(
        &mut self,
        arena: &mut TraceArena,
        node: TraceNode,
        flow: FlowKind,
        mode: StepMode,
    ) -> usize {
        let index = arena.push_child(self.current, node);
        match flow {
            FlowKind::Return => {
                self.current = match arena.parent(self.current) {
                    Some(parent) => parent,
                    None => arena.promote_root(),
                };
            }
            FlowKind::Call if mode == StepMode::SingleStep => self.current = index,
            _ => {}
        }
        index
    }
}

/// Side-channel state of one trace
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TraceStatus {
    #[default]
    Idle,
    Tracing {
        line: String,
        step: u32,
        max: u32,
    },
    Canceled,
    Processing,
    Finished,
}

impl TraceStatus {
    /// No further status will follow
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceStatus::Canceled | TraceStatus::Finished)
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceStatus::Idle => write!(f, "Idle"),
            TraceStatus::Tracing { line, step, max } => write!(f, "{} ({}/{})", line, step, max),
            TraceStatus::Canceled => write!(f, "Canceled"),
            TraceStatus::Processing => write!(f, "Processing the collected data"),
            TraceStatus::Finished => write!(f, "Finished"),
        }
    }
}

/// Trace request parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceParams {
    pub max_trace_count: u32,
    /// Evaluated after each step; the trace ends once it holds
    pub stop_condition: Option<String>,
    pub step_mode: StepMode,
    /// Leave the inferior stopped when the trace ends
    pub stop_after_trace: bool,
    pub collect: RegisterSelection,
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            max_trace_count: 1000,
            stop_condition: None,
            step_mode: StepMode::SingleStep,
            stop_after_trace: false,
            collect: RegisterSelection::CPU,
        }
    }
}

/// How a trace ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceOutcome {
    Finished,
    Canceled,
}

/// Result of one trace run
#[derive(Debug, Clone)]
pub struct TraceReport {
    pub outcome: TraceOutcome,
    pub arena: TraceArena,
    /// Stop that cut a step short; left for the caller to handle
    pub interrupted_by: Option<StopEvent>,
}

/// Receives status updates and the final tree
pub trait TraceSink {
    fn status(&mut self, status: &TraceStatus);
    fn result(&mut self, arena: &TraceArena);
}

/// Runs traces against a [`Debugger`]
pub struct InstructionTracer<'a> {
    engine: &'a DisassemblyEngine,
    symbols: &'a SymbolTable,
}

impl<'a> InstructionTracer<'a> {
    pub fn new(engine: &'a DisassemblyEngine, symbols: &'a SymbolTable) -> Self {
        Self { engine, symbols }
    }

    /// Trace from the current stop at `breakpoint`. The breakpoint is
    /// removed first so stepping never re-triggers it.
    pub fn run(
        &self,
        debugger: &mut dyn Debugger,
        breakpoint: BreakpointId,
        params: &TraceParams,
        cancel: &CancellationToken,
        sink: &mut dyn TraceSink,
    ) -> TraceReport {
        if let Err(e) = debugger.delete_breakpoint(breakpoint) {
            log::warn!("Could not remove trace breakpoint {}: {}", breakpoint, e);
        }

        let mut arena = TraceArena::new();
        let mut cursor = TraceCursor::new(&arena);
        let mut outcome = TraceOutcome::Finished;
        let mut interrupted_by = None;

        for step in 1..=params.max_trace_count {
            if cancel.is_cancelled() {
                outcome = TraceOutcome::Canceled;
                break;
            }
            let pc = match debugger.program_counter() {
                Ok(pc) => pc,
                Err(e) => {
                    log::warn!("Trace stopped, registers unavailable: {}", e);
                    break;
                }
            };

            let (text, flow) = match self.engine.decode_at(debugger.memory(), pc) {
                Some(insn) if !insn.invalid => (insn.text, insn.flow),
                _ => ("(bad)".to_string(), FlowKind::Other),
            };
            let line = format!("{}:\t{}", self.symbols.describe(pc), text);
            let registers = if params.collect.is_empty() {
                None
            } else {
                debugger
                    .register_snapshot(params.collect)
                    .map_err(|e| log::debug!("Register snapshot failed at {:#x}: {}", pc, e))
                    .ok()
            };
            cursor.record(
                &mut arena,
                TraceNode {
                    instruction: line.clone(),
                    registers,
                },
                flow,
                params.step_mode,
            );
            sink.status(&TraceStatus::Tracing {
                line,
                step,
                max: params.max_trace_count,
            });

            let stepped = match params.step_mode {
                StepMode::SingleStep => debugger.single_step(),
                StepMode::StepOver => debugger.step_over(),
            };
            match stepped {
                Ok(()) => {}
                Err(DebugError::StepInterrupted(event)) => {
                    log::info!("Trace stopped after {} steps by {:?}", step, event);
                    interrupted_by = Some(event);
                    break;
                }
                Err(e) => {
                    log::warn!("Trace stopped after {} steps: {}", step, e);
                    break;
                }
            }

            if let Some(condition) = &params.stop_condition {
                if self.condition_met(debugger, condition) {
                    log::info!("Trace stop condition `{}` met after {} steps", condition, step);
                    break;
                }
            }
        }

        if outcome == TraceOutcome::Canceled {
            sink.result(&arena);
            sink.status(&TraceStatus::Canceled);
        } else {
            sink.status(&TraceStatus::Processing);
            sink.result(&arena);
            sink.status(&TraceStatus::Finished);
        }

        if !params.stop_after_trace
            && interrupted_by.is_none()
            && debugger.status() == InferiorStatus::Stopped
        {
            if let Err(e) = debugger.continue_execution() {
                log::warn!("Could not resume after trace: {}", e);
            }
        }
        TraceReport {
            outcome,
            arena,
            interrupted_by,
        }
    }

    fn condition_met(&self, debugger: &dyn Debugger, condition: &str) -> bool {
        let registers = debugger.registers().ok();
        let context = TargetContext {
            registers: registers.as_ref(),
            memory: debugger.memory(),
            symbols: self.symbols,
        };
        condition_holds(condition, &context).unwrap_or_else(|e| {
            log::debug!("Stop condition `{}` not evaluable: {}", condition, e);
            false
        })
    }
}
