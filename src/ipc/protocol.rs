//! Request/response schema
//!
//! One tagged union per direction. Every request is answered by exactly one
//! [`Response`]; failures travel as a tagged [`Failure`] and never close the
//! channel. All payloads are plain data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::memory::MemoryRegion;
use crate::core::value::ValueType;
use crate::debug::stack::{FrameInfo, StackEntry, StackTraceEntry};
use crate::debug::{BreakpointId, InferiorStatus, RegisterSnapshot, WatchpointKind};
use crate::dissect::search::{ReferencedCall, ReferencedString, Referrers};
use crate::dissect::{DissectionOutcome, ReferenceCounts};
use crate::trace::TraceParams;
use crate::track::{BreakpointRecords, WatchpointRecords};

/// Operations the controller can ask for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args")]
pub enum Request {
    /// General, flag and segment registers
    ReadRegisters,
    ReadFloatRegisters,
    GetStackInfo,
    GetStackTraceInfo,
    GetFrameReturnAddresses,
    GetFrameInfo {
        index: usize,
    },
    HexDump {
        address: u64,
        length: usize,
    },
    ExecutableRegions,

    /// Blocks until the dissection finishes or is canceled
    DissectCode {
        regions: Vec<MemoryRegion>,
        discard_invalid_strings: bool,
    },
    ResetDissectCode,
    GetReferenceCounts,
    SearchReferencedStrings {
        pattern: String,
        case_sensitive: bool,
        regex: bool,
        value_type: ValueType,
    },
    SearchReferencedCalls {
        pattern: String,
        case_sensitive: bool,
        regex: bool,
    },
    GetReferrers {
        address: u64,
    },

    ExamineExpressions {
        expressions: Vec<String>,
    },
    SearchFunctions {
        pattern: String,
        case_sensitive: bool,
    },

    /// Trace once a breakpoint at `address` is hit
    TraceInstructions {
        address: u64,
        params: TraceParams,
    },
    TrackWatchpoint {
        address: u64,
        length: usize,
        kind: WatchpointKind,
    },
    TrackBreakpoint {
        address: u64,
        expressions: Vec<String>,
    },
    GetTrackWatchpointInfo {
        id: BreakpointId,
    },
    GetTrackBreakpointInfo {
        id: BreakpointId,
    },
    /// Tear down a tracking session or pending trace
    StopTracking {
        id: BreakpointId,
        /// Briefly stop a running target to do it
        interrupt: bool,
    },

    InferiorStatus,
    Interrupt,
    Continue,
    Detach,
    /// Detach but keep serving, so the same process can be attached again
    PhaseOut,
    /// Attach again after a `PhaseOut`
    PhaseIn,
}

impl Request {
    /// Operation name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::ReadRegisters => "ReadRegisters",
            Request::ReadFloatRegisters => "ReadFloatRegisters",
            Request::GetStackInfo => "GetStackInfo",
            Request::GetStackTraceInfo => "GetStackTraceInfo",
            Request::GetFrameReturnAddresses => "GetFrameReturnAddresses",
            Request::GetFrameInfo { .. } => "GetFrameInfo",
            Request::HexDump { .. } => "HexDump",
            Request::ExecutableRegions => "ExecutableRegions",
            Request::DissectCode { .. } => "DissectCode",
            Request::ResetDissectCode => "ResetDissectCode",
            Request::GetReferenceCounts => "GetReferenceCounts",
            Request::SearchReferencedStrings { .. } => "SearchReferencedStrings",
            Request::SearchReferencedCalls { .. } => "SearchReferencedCalls",
            Request::GetReferrers { .. } => "GetReferrers",
            Request::ExamineExpressions { .. } => "ExamineExpressions",
            Request::SearchFunctions { .. } => "SearchFunctions",
            Request::TraceInstructions { .. } => "TraceInstructions",
            Request::TrackWatchpoint { .. } => "TrackWatchpoint",
            Request::TrackBreakpoint { .. } => "TrackBreakpoint",
            Request::GetTrackWatchpointInfo { .. } => "GetTrackWatchpointInfo",
            Request::GetTrackBreakpointInfo { .. } => "GetTrackBreakpointInfo",
            Request::StopTracking { .. } => "StopTracking",
            Request::InferiorStatus => "InferiorStatus",
            Request::Interrupt => "Interrupt",
            Request::Continue => "Continue",
            Request::Detach => "Detach",
            Request::PhaseOut => "PhaseOut",
            Request::PhaseIn => "PhaseIn",
        }
    }

    /// Whether the request may legitimately run for a long time
    pub fn is_long_running(&self) -> bool {
        matches!(self, Request::DissectCode { .. })
    }
}

/// One examined expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExaminedExpression {
    /// `0x401000 <main>`, or the error text when it does not resolve
    pub all: String,
    pub address: Option<u64>,
    pub symbol: Option<String>,
}

/// Successful results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Payload {
    Done,
    Registers(RegisterSnapshot),
    StackInfo(Vec<StackEntry>),
    StackTrace(Vec<StackTraceEntry>),
    ReturnAddresses(Vec<String>),
    Frame(Option<FrameInfo>),
    HexDump { address: u64, bytes: Vec<String> },
    Regions(Vec<MemoryRegion>),
    Dissection(DissectionOutcome),
    Counts(ReferenceCounts),
    ReferencedStrings(Vec<ReferencedString>),
    ReferencedCalls(Vec<ReferencedCall>),
    Referrers(Referrers),
    Examined(Vec<ExaminedExpression>),
    /// (address for non-debugging symbols, name)
    Functions(Vec<(Option<u64>, String)>),
    /// Id of an installed breakpoint or watchpoint
    Breakpoint(BreakpointId),
    WatchpointInfo(WatchpointRecords),
    BreakpointInfo(BreakpointRecords),
    Status(InferiorStatus),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Done => "Done",
            Payload::Registers(_) => "Registers",
            Payload::StackInfo(_) => "StackInfo",
            Payload::StackTrace(_) => "StackTrace",
            Payload::ReturnAddresses(_) => "ReturnAddresses",
            Payload::Frame(_) => "Frame",
            Payload::HexDump { .. } => "HexDump",
            Payload::Regions(_) => "Regions",
            Payload::Dissection(_) => "Dissection",
            Payload::Counts(_) => "Counts",
            Payload::ReferencedStrings(_) => "ReferencedStrings",
            Payload::ReferencedCalls(_) => "ReferencedCalls",
            Payload::Referrers(_) => "Referrers",
            Payload::Examined(_) => "Examined",
            Payload::Functions(_) => "Functions",
            Payload::Breakpoint(_) => "Breakpoint",
            Payload::WatchpointInfo(_) => "WatchpointInfo",
            Payload::BreakpointInfo(_) => "BreakpointInfo",
            Payload::Status(_) => "Status",
        }
    }
}

/// Named failure of one request
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "failure", content = "reason")]
pub enum Failure {
    /// Not allowed in the target's current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Bad user input (pattern, expression, address)
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The debugger could not carry the request out
    #[error("Debugger error: {0}")]
    Debugger(String),
}

pub type Response = Result<Payload, Failure>;

/// Sequence-numbered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub seq: u64,
    pub body: T,
}
