//! Analysis Module - Binary analysis engines
//!
//! Contains symbol loading for the mapped objects of the target.

pub mod loader;

pub use loader::{FunctionKind, FunctionSymbol, LoadedBinary, SymbolTable};
