//! Scryer - debugger automation and code indexing for live processes
//!
//! An executor attached to the target owns every per-process store and
//! answers requests; a controller issues those requests over a transport
//! and reads progress from a process-keyed side channel.
//!
//! - `dissect`: cross-reference index of executable regions
//! - `trace`: instruction traces as call trees
//! - `track`: watchpoint and breakpoint access tracking

pub mod analysis;
pub mod app;
pub mod config;
pub mod controller;
pub mod core;
pub mod debug;
pub mod disasm;
pub mod dissect;
pub mod executor;
pub mod ipc;
pub mod trace;
pub mod track;
pub mod ui;

pub use config::EngineConfig;
pub use controller::{Controller, ControllerError};
pub use executor::Executor;
