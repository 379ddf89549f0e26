//! App module - REPL session state and commands
//!
//! Command parsing and per-session bookkeeping used by `ui::cli`.

mod commands;
mod state;

pub use commands::*;
pub use state::*;
