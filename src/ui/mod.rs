//! UI module - Command Line Interface
//!
//! Provides the reedline-based controller REPL.

pub mod cli;
