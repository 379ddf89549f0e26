//! Command processing
//!
//! Turns a REPL line into an [`AppCommand`]. Parsing never talks to the
//! executor; malformed input becomes `Unknown` with a reason.

use crate::core::value::ValueType;
use crate::debug::{BreakpointId, RegisterSelection, WatchpointKind};
use crate::trace::{StepMode, TraceParams};

/// Search flags shared by `strings`, `calls` and `funcs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchArgs {
    pub pattern: String,
    pub case_sensitive: bool,
    pub regex: bool,
}

/// Commands the REPL understands
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    Registers,
    FloatRegisters,
    Stack,
    Backtrace,
    Frame(usize),
    HexDump { address: u64, length: usize },
    Maps,

    Dissect { discard_invalid_strings: bool },
    DissectStatus,
    DissectCancel,
    DissectReset,
    ReferenceCounts,
    Strings { search: SearchArgs, value_type: ValueType },
    Calls(SearchArgs),
    Referrers(u64),

    Examine(Vec<String>),
    Functions(SearchArgs),

    Trace { address: u64, params: TraceParams },
    TraceStatus(BreakpointId),
    TraceCancel(BreakpointId),
    TraceShow(BreakpointId),
    TraceSave { id: BreakpointId, path: String },
    TraceLoad(String),

    Watch { address: u64, length: usize, kind: WatchpointKind },
    WatchInfo(BreakpointId),
    Track { address: u64, expressions: Vec<String> },
    TrackInfo(BreakpointId),
    Untrack { id: BreakpointId, interrupt: bool },

    Status,
    Interrupt,
    Continue,
    Detach,
    PhaseOut,
    PhaseIn,
    Help,
    Quit,
    Unknown(String),
}

/// Parse a command string into AppCommand
pub fn parse_command(input: &str) -> AppCommand {
    let input = input.trim();
    let parts: Vec<&str> = input.splitn(2, ' ').collect();
    let cmd = parts.first().unwrap_or(&"");
    let arg = parts.get(1).map(|s| s.trim()).unwrap_or("");

    let parsed = match *cmd {
        "regs" | "dr" => Ok(AppCommand::Registers),
        "fregs" => Ok(AppCommand::FloatRegisters),
        "stack" => Ok(AppCommand::Stack),
        "bt" | "backtrace" => Ok(AppCommand::Backtrace),
        "frame" => arg
            .parse()
            .map(AppCommand::Frame)
            .map_err(|_| "frame requires an index".to_string()),
        "x" => parse_hexdump(arg),
        "maps" | "dm" => Ok(AppCommand::Maps),

        "dissect" => Ok(AppCommand::Dissect {
            discard_invalid_strings: arg == "--discard-invalid-strings" || arg == "-d",
        }),
        "dissect-status" => Ok(AppCommand::DissectStatus),
        "dissect-cancel" => Ok(AppCommand::DissectCancel),
        "dissect-reset" => Ok(AppCommand::DissectReset),
        "refs" => Ok(AppCommand::ReferenceCounts),
        "strings" => parse_strings(arg),
        "calls" => Ok(AppCommand::Calls(parse_search(arg).0)),
        "referrers" | "xrefs" => parse_address(arg)
            .map(AppCommand::Referrers)
            .ok_or_else(|| "referrers requires an address".to_string()),

        "eval" | "p" => {
            let expressions = split_list(arg);
            if expressions.is_empty() {
                Err("eval requires an expression".to_string())
            } else {
                Ok(AppCommand::Examine(expressions))
            }
        }
        "funcs" | "functions" => Ok(AppCommand::Functions(parse_search(arg).0)),

        "trace" => parse_trace(arg),
        "trace-status" => parse_id(arg).map(AppCommand::TraceStatus),
        "trace-cancel" => parse_id(arg).map(AppCommand::TraceCancel),
        "trace-show" => parse_id(arg).map(AppCommand::TraceShow),
        "trace-save" => {
            let mut words = arg.splitn(2, ' ');
            let id = parse_id(words.next().unwrap_or(""));
            match (id, words.next().map(str::trim)) {
                (Ok(id), Some(path)) if !path.is_empty() => Ok(AppCommand::TraceSave {
                    id,
                    path: path.to_string(),
                }),
                _ => Err("usage: trace-save <id> <path>".to_string()),
            }
        }
        "trace-load" if !arg.is_empty() => Ok(AppCommand::TraceLoad(arg.to_string())),

        "watch" => parse_watch(arg),
        "watch-info" => parse_id(arg).map(AppCommand::WatchInfo),
        "track" => {
            let mut words = arg.splitn(2, ' ');
            match (words.next().and_then(parse_address), words.next()) {
                (Some(address), Some(rest)) if !split_list(rest).is_empty() => Ok(AppCommand::Track {
                    address,
                    expressions: split_list(rest),
                }),
                _ => Err("usage: track <addr> <expr>[, <expr>...]".to_string()),
            }
        }
        "track-info" => parse_id(arg).map(AppCommand::TrackInfo),
        "untrack" => {
            let interrupt = arg.ends_with('!');
            parse_id(arg.trim_end_matches('!')).map(|id| AppCommand::Untrack { id, interrupt })
        }

        "status" => Ok(AppCommand::Status),
        "interrupt" | "i" => Ok(AppCommand::Interrupt),
        "continue" | "c" | "dc" => Ok(AppCommand::Continue),
        "detach" => Ok(AppCommand::Detach),
        "phase-out" => Ok(AppCommand::PhaseOut),
        "phase-in" => Ok(AppCommand::PhaseIn),
        "help" | "?" => Ok(AppCommand::Help),
        "quit" | "exit" | "q" => Ok(AppCommand::Quit),
        _ => Err(format!("unknown command '{}'", input)),
    };

    parsed.unwrap_or_else(AppCommand::Unknown)
}

/// Parse an address from hex (0x prefix) or decimal
pub fn parse_address(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_id(s: &str) -> Result<BreakpointId, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("invalid id '{}'", s.trim()))
}

/// Comma separated list, empty items dropped
fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(String::from)
        .collect()
}

/// Leading `-i` (ignore case) / `-r` (regex) flags, then the pattern.
/// Unrecognized flags are returned for the caller.
fn parse_search(arg: &str) -> (SearchArgs, Vec<String>) {
    let mut search = SearchArgs {
        pattern: String::new(),
        case_sensitive: true,
        regex: false,
    };
    let mut extra = Vec::new();
    let mut rest = arg.trim();
    while let Some(stripped) = rest.strip_prefix('-') {
        let (flag, tail) = stripped.split_once(' ').unwrap_or((stripped, ""));
        match flag {
            "i" => search.case_sensitive = false,
            "r" => search.regex = true,
            "ir" | "ri" => {
                search.case_sensitive = false;
                search.regex = true;
            }
            other => extra.push(other.to_string()),
        }
        rest = tail.trim_start();
    }
    search.pattern = rest.to_string();
    (search, extra)
}

fn parse_strings(arg: &str) -> Result<AppCommand, String> {
    let (search, extra) = parse_search(arg);
    let mut value_type = ValueType::default();
    for flag in extra {
        value_type = parse_value_type(&flag).ok_or_else(|| format!("unknown value type '{}'", flag))?;
    }
    Ok(AppCommand::Strings { search, value_type })
}

fn parse_value_type(name: &str) -> Option<ValueType> {
    Some(match name {
        "i8" => ValueType::Int8,
        "i16" => ValueType::Int16,
        "i32" => ValueType::Int32,
        "i64" => ValueType::Int64,
        "f32" => ValueType::Float32,
        "f64" => ValueType::Float64,
        "utf8" => ValueType::StringUtf8,
        "utf16" => ValueType::StringUtf16,
        "bytes" => ValueType::ByteArray,
        _ => return None,
    })
}

fn parse_hexdump(arg: &str) -> Result<AppCommand, String> {
    let mut words = arg.split_whitespace();
    let address = words
        .next()
        .and_then(parse_address)
        .ok_or_else(|| "x requires an address".to_string())?;
    let length = match words.next() {
        Some(n) => parse_address(n).ok_or_else(|| format!("invalid length '{}'", n))? as usize,
        None => 64,
    };
    Ok(AppCommand::HexDump { address, length })
}

fn parse_watch(arg: &str) -> Result<AppCommand, String> {
    let words: Vec<&str> = arg.split_whitespace().collect();
    let usage = || "usage: watch <addr> <len> [w|r|rw]".to_string();
    let address = words.first().and_then(|w| parse_address(w)).ok_or_else(usage)?;
    let length = words
        .get(1)
        .and_then(|w| parse_address(w))
        .filter(|&n| n > 0)
        .ok_or_else(usage)? as usize;
    let kind = match words.get(2).copied() {
        None | Some("w") => WatchpointKind::Write,
        Some("r") => WatchpointKind::Read,
        Some("rw") | Some("a") => WatchpointKind::Access,
        Some(_) => return Err(usage()),
    };
    Ok(AppCommand::Watch { address, length, kind })
}

/// `trace <addr> [max] [over] [stop] [noregs] [until <condition>]`
fn parse_trace(arg: &str) -> Result<AppCommand, String> {
    let (head, condition) = match arg.split_once(" until ") {
        Some((head, condition)) => (head, Some(condition.trim().to_string())),
        None => (arg, None),
    };
    let mut words = head.split_whitespace();
    let address = words
        .next()
        .and_then(parse_address)
        .ok_or_else(|| "trace requires an address".to_string())?;

    let mut params = TraceParams {
        stop_condition: condition.filter(|c| !c.is_empty()),
        ..TraceParams::default()
    };
    for word in words {
        match word {
            "over" => params.step_mode = StepMode::StepOver,
            "stop" => params.stop_after_trace = true,
            "noregs" => params.collect = RegisterSelection::NONE,
            "fregs" => params.collect.float = true,
            n => {
                params.max_trace_count = n
                    .parse()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| format!("invalid trace count '{}'", n))?;
            }
        }
    }
    Ok(AppCommand::Trace { address, params })
}
