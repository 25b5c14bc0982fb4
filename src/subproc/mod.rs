// src/subproc/mod.rs

//! External command execution.
//!
//! - [`context`]: the command description and its captured results.
//! - [`pool`]: bounded non-blocking execution with timeouts and
//!   unreachable-host classification.
//! - [`process_tree`]: process-group setup and kill.

pub mod context;
pub mod pool;
pub mod process_tree;

pub use context::{CommandContext, CommandLine, RemoteTools, StdinSource};
pub use pool::{Callbacks, PoolOptions, StopHandle, SubProcPool};
