//! CLI - reedline-based REPL interface
//!
//! Drives a [`Controller`]. Dissection runs on a background thread so the
//! prompt stays usable; progress is read from the side channel.

use anyhow::Result;
use colored::Colorize;
use reedline::{Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal};
use std::borrow::Cow;
use std::sync::Arc;

use crate::app::{parse_command, AppCommand, AppState, SessionKind};
use crate::controller::{Controller, ControllerError, Teardown};
use crate::debug::{InferiorStatus, RegisterSnapshot};
use crate::dissect::DissectState;
use crate::trace::TraceArena;

/// Prompt showing the target and its run state
pub struct ScryerPrompt {
    pid: u32,
    status: InferiorStatus,
    dissecting: bool,
}

impl ScryerPrompt {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            status: InferiorStatus::Stopped,
            dissecting: false,
        }
    }

    pub fn update(&mut self, state: &AppState) {
        self.status = state.status;
        self.dissecting = state.is_dissecting();
    }
}

impl Prompt for ScryerPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        let status = match self.status {
            InferiorStatus::Stopped => "stp",
            InferiorStatus::Running => "run",
            InferiorStatus::Detached => "det",
            InferiorStatus::Exited => "xit",
        };
        let busy = if self.dissecting { "*" } else { "" };
        Cow::Owned(format!("[{}:{}{}]", self.pid, status, busy))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// Print the help message
fn print_help() {
    println!("{}", "Scryer CLI Commands".bold().cyan());
    println!("{}", "═".repeat(60).cyan());

    println!("\n{}", "Inspection:".bold().yellow());
    println!("  {}                 General, flag and segment registers", "regs".green());
    println!("  {}                Float registers", "fregs".green());
    println!("  {}                Words above the stack pointer", "stack".green());
    println!("  {}                   Backtrace", "bt".green());
    println!("  {}            Frame details", "frame <n>".green());
    println!("  {}       Hex dump", "x <addr> [len]".green());
    println!("  {}                 Executable regions", "maps".green());

    println!("\n{}", "Code index:".bold().yellow());
    println!("  {}        Index executable regions (-d drops bad strings)", "dissect [-d]".green());
    println!("  {}       Progress of the running dissection", "dissect-status".green());
    println!("  {}       Stop the dissection at the next chunk", "dissect-cancel".green());
    println!("  {}        Forget the index", "dissect-reset".green());
    println!("  {}                 Reference counts", "refs".green());
    println!("  {}  Referenced data (-i -r -utf16 -i32 ...)", "strings [-flags] <pat>".green());
    println!("  {}    Referenced calls", "calls [-i] [-r] <pat>".green());
    println!("  {}     Jumps and calls to an address", "referrers <addr>".green());

    println!("\n{}", "Expressions:".bold().yellow());
    println!("  {}    Resolve expressions", "eval <e>[, <e>...]".green());
    println!("  {}    Search functions", "funcs [-i] <regex>".green());

    println!("\n{}", "Tracing:".bold().yellow());
    println!(
        "  {}",
        "trace <addr> [max] [over] [stop] [noregs] [fregs] [until <cond>]".green()
    );
    println!("  {} | {} | {}", "trace-status <id>".green(), "trace-cancel <id>".green(), "trace-show <id>".green());
    println!("  {} | {}", "trace-save <id> <path>".green(), "trace-load <path>".green());

    println!("\n{}", "Access tracking:".bold().yellow());
    println!("  {}  Track accesses with a watchpoint", "watch <addr> <len> [w|r|rw]".green());
    println!("  {}  Track expressions at a breakpoint", "track <addr> <e>[, <e>...]".green());
    println!("  {} | {}", "watch-info <id>".green(), "track-info <id>".green());
    println!("  {}      Stop a session (! interrupts a running target)", "untrack <id>[!]".green());

    println!("\n{}", "Run control:".bold().yellow());
    println!("  {} | {} | {} | {}", "status".green(), "interrupt".green(), "continue".green(), "detach".green());
    println!("  {} | {}  Detach and attach back, keeping the executor", "phase-out".green(), "phase-in".green());
    println!("  {} | {}", "?".green(), "q".green());
}

fn print_registers(registers: RegisterSnapshot) {
    for (name, value) in registers {
        println!("    {:>8} = {}", name.yellow(), value);
    }
}

/// Sixteen bytes per row, addresses wrapping at the top of the address space
fn hex_dump_rows(address: u64, bytes: &[String]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(row, chunk)| format!("{:#014x}  {}", address.wrapping_add(row as u64 * 16), chunk.join(" ")))
        .collect()
}

fn print_trace(arena: &TraceArena) {
    if arena.instruction_count() == 0 {
        println!("    {}", "(empty trace)".dimmed());
        return;
    }
    for line in arena.render().lines() {
        println!("  {}", line);
    }
    println!("[*] {} instructions", arena.instruction_count());
}

/// Execute a parsed command; returns false when the REPL should exit
fn execute_command(cmd: AppCommand, controller: &Arc<Controller>, state: &mut AppState) -> Result<bool, ControllerError> {
    match cmd {
        AppCommand::Registers => print_registers(controller.read_registers()?),
        AppCommand::FloatRegisters => print_registers(controller.read_float_registers()?),
        AppCommand::Stack => {
            for entry in controller.stack_info()? {
                println!("  {:<28} {:<20} {}", entry.indicator, entry.value.green(), entry.pointee);
            }
        }
        AppCommand::Backtrace => {
            for (i, frame) in controller.stack_trace()?.iter().enumerate() {
                println!("  #{:<3} {:<40} {}", i, frame.return_address.green(), frame.frame_address);
            }
        }
        AppCommand::Frame(index) => match controller.frame_info(index)? {
            Some(frame) => println!("{}", frame.description),
            None => println!("{} No frame at level {}", "[!]".red(), index),
        },
        AppCommand::HexDump { address, length } => {
            for row in hex_dump_rows(address, &controller.hex_dump(address, length)?) {
                println!("  {}", row);
            }
        }
        AppCommand::Maps => {
            for region in controller.executable_regions()? {
                println!("  {} {} {}", region.range_label().green(), region.permissions, region.backing_path);
            }
        }

        AppCommand::Dissect { discard_invalid_strings } => {
            if state.is_dissecting() {
                println!("{} A dissection is already running", "[!]".red());
                return Ok(true);
            }
            let worker = Arc::clone(controller);
            state.dissection = Some(std::thread::spawn(move || {
                worker
                    .dissect_code(Vec::new(), discard_invalid_strings)
                    .map_err(|e| e.to_string())
            }));
            println!("[*] Dissection started; use dissect-status to follow it");
        }
        AppCommand::DissectStatus => match controller.dissect_status()? {
            Some(status) => {
                let state_label = match status.state {
                    DissectState::Running => "running".yellow(),
                    DissectState::Finished => "finished".green(),
                    DissectState::Canceled => "canceled".red(),
                };
                println!("[*] Dissection {}", state_label);
                if let Some(progress) = status.progress {
                    println!(
                        "    {} {} scanned {:#x}-{:#x}",
                        progress.region_label(),
                        progress.current_region.backing_path,
                        progress.scanned_range.0,
                        progress.scanned_range.1
                    );
                    println!(
                        "    strings {}  jumps {}  calls {}",
                        progress.counts.strings, progress.counts.jumps, progress.counts.calls
                    );
                }
            }
            None => println!("[*] No dissection has run"),
        },
        AppCommand::DissectCancel => controller.cancel_dissect_code()?,
        AppCommand::DissectReset => {
            controller.reset_dissect_code()?;
            println!("[*] Index cleared");
        }
        AppCommand::ReferenceCounts => {
            let counts = controller.reference_counts()?;
            println!(
                "[*] strings {}  jumps {}  calls {}",
                counts.strings, counts.jumps, counts.calls
            );
        }
        AppCommand::Strings { search, value_type } => {
            for found in controller.search_referenced_strings(&search.pattern, search.case_sensitive, search.regex, value_type)? {
                println!(
                    "  {:#014x} {:>5}  {}",
                    found.address,
                    found.referrers,
                    found.value.unwrap_or_else(|| "??".into())
                );
            }
        }
        AppCommand::Calls(search) => {
            for call in controller.search_referenced_calls(&search.pattern, search.case_sensitive, search.regex)? {
                println!("  {:<50} {:>5}", call.symbol.green(), call.referrers);
            }
        }
        AppCommand::Referrers(address) => {
            let referrers = controller.referrers(address)?;
            for (origin, mnemonic) in &referrers.jumps {
                println!("  {:<6} {}", mnemonic.yellow(), origin);
            }
            for origin in &referrers.calls {
                println!("  {:<6} {}", "call".yellow(), origin);
            }
        }

        AppCommand::Examine(expressions) => {
            for (expression, result) in expressions.iter().zip(controller.examine(expressions.clone())?) {
                println!("  {} = {}", expression.cyan(), result.all);
            }
        }
        AppCommand::Functions(search) => {
            for (address, name) in controller.search_functions(&search.pattern, search.case_sensitive)? {
                match address {
                    Some(address) => println!("  {:#014x} {}", address, name),
                    None => println!("  {:>14} {}", "", name.green()),
                }
            }
        }

        AppCommand::Trace { address, params } => {
            let id = controller.trace_instructions(address, params)?;
            state.add_session(id, SessionKind::Trace);
            println!("[*] Trace {} armed at {:#x}", id, address);
        }
        AppCommand::TraceStatus(id) => match controller.trace_status(id)? {
            Some(status) => println!("[*] Trace {}: {}", id, status),
            None => println!("{} No trace {}", "[!]".red(), id),
        },
        AppCommand::TraceCancel(id) => controller.cancel_trace(id)?,
        AppCommand::TraceShow(id) => match controller.trace_result(id)? {
            Some(arena) => print_trace(&arena),
            None => println!("{} Trace {} has no result yet", "[!]".red(), id),
        },
        AppCommand::TraceSave { id, path } => match controller.trace_result(id)? {
            Some(arena) => controller.save_trace(&arena, &path)?,
            None => println!("{} Trace {} has no result yet", "[!]".red(), id),
        },
        AppCommand::TraceLoad(path) => {
            let arena = Controller::load_trace(&path)?;
            print_trace(&arena);
            state.loaded_trace = Some(arena);
        }

        AppCommand::Watch { address, length, kind } => {
            let id = controller.track_watchpoint(address, length, kind)?;
            state.add_session(id, SessionKind::Watchpoint);
            println!("[*] Watchpoint {} tracking {:#x} ({} bytes)", id, address, length);
        }
        AppCommand::WatchInfo(id) => {
            for (pc, hit) in controller.watchpoint_info(id)? {
                println!(
                    "  {} {:#x} hits {} (previous {:#x})",
                    "pc".yellow(),
                    pc,
                    hit.hit_count,
                    hit.previous_instruction
                );
                for line in &hit.disassembly {
                    println!("      {}", line);
                }
            }
        }
        AppCommand::Track { address, expressions } => {
            let id = controller.track_breakpoint(address, expressions)?;
            state.add_session(id, SessionKind::Breakpoint);
            println!("[*] Breakpoint {} tracking at {:#x}", id, address);
        }
        AppCommand::TrackInfo(id) => {
            for (expression, addresses) in controller.breakpoint_info(id)? {
                println!("  {}", expression.cyan());
                for (address, count) in addresses {
                    println!("      {:#014x} {}", address, count);
                }
            }
        }
        AppCommand::Untrack { id, interrupt } => match controller.stop_tracking(id, interrupt)? {
            Teardown::Done => {
                state.remove_session(id);
                println!("[*] Session {} closed", id);
            }
            Teardown::Deferred => {
                println!("[*] Target is running; session {} closes when it stops", id);
            }
        },

        AppCommand::Status => {
            state.status = controller.status()?;
            println!("[*] Target {} is {:?}", controller.pid(), state.status);
            for (id, kind) in &state.sessions {
                println!("    {:<4} {:?}", id, kind);
            }
        }
        AppCommand::Interrupt => {
            controller.interrupt()?;
            state.status = InferiorStatus::Stopped;
            for id in controller.flush_deferred()? {
                state.remove_session(id);
                println!("[*] Session {} closed", id);
            }
        }
        AppCommand::Continue => {
            controller.resume()?;
            state.status = InferiorStatus::Running;
        }
        AppCommand::Detach => {
            controller.detach()?;
            println!("[*] Detached from {}", controller.pid());
            return Ok(false);
        }
        AppCommand::PhaseOut => {
            controller.phase_out()?;
            state.status = InferiorStatus::Detached;
            println!("[*] Detached from {}; phase-in to attach back", controller.pid());
        }
        AppCommand::PhaseIn => {
            controller.phase_in()?;
            state.status = InferiorStatus::Stopped;
            println!("[*] Attached back to {}", controller.pid());
        }
        AppCommand::Help => print_help(),
        AppCommand::Quit => {
            println!("[*] Shutting down...");
            return Ok(false);
        }
        AppCommand::Unknown(reason) => {
            println!("{} {}", "[!]".red(), reason);
            println!("    Type '?' for help");
        }
    }
    Ok(true)
}

/// Run the CLI REPL against `controller`
pub fn run_cli(controller: Arc<Controller>) -> Result<()> {
    let mut line_editor = Reedline::create();
    let mut prompt = ScryerPrompt::new(controller.pid());
    let mut state = AppState::new();

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║  Scryer CLI - Type '?' for help, 'q' to quit                 ║".cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    match controller.try_request(crate::ipc::Request::InferiorStatus) {
        Ok(crate::ipc::Payload::Status(status)) => state.status = status,
        Ok(_) => {}
        Err(e) => println!("{} {}", "[!]".red(), e),
    }

    loop {
        if let Some(outcome) = state.take_finished_dissection() {
            match outcome {
                Ok(outcome) => println!("[*] Dissection {:?}", outcome),
                Err(e) => println!("{} Dissection failed: {}", "[!]".red(), e),
            }
        }
        prompt.update(&state);

        let sig = line_editor.read_line(&prompt)?;
        match sig {
            Signal::Success(buffer) => {
                let input = buffer.trim();
                if input.is_empty() {
                    continue;
                }

                match execute_command(parse_command(input), &controller, &mut state) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(ControllerError::ExecutorUnavailable(reason)) => {
                        println!("{} Executor unavailable: {}", "[!]".red(), reason);
                    }
                    Err(e) => println!("{} {}", "[!]".red(), e),
                }
            }
            Signal::CtrlD | Signal::CtrlC => {
                println!("\n[*] Interrupted");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_rows_wrap_at_top_of_address_space() {
        let bytes: Vec<String> = (0..20).map(|b| format!("{:02x}", b)).collect();
        let rows = hex_dump_rows(u64::MAX - 7, &bytes);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("0xfffffffffffffff8  00 01"));
        assert_eq!(rows[1], "0x000000000008  10 11 12 13");
    }
}
