// src/engine/mod.rs

//! Orchestration engine.
//!
//! The synchronous core lives in [`core`]; the async shell that ticks it
//! and feeds it outside events is [`runtime`].

use crate::task::TaskMessage;

/// Events flowing into the runtime from outside the main loop.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A message from a running job.
    TaskMessage {
        point: String,
        name: String,
        msg: TaskMessage,
    },
    /// Stop submitting; exit once active jobs are done.
    StopRequested,
    /// Exit now, killing anything still running (e.g. a second Ctrl-C).
    ShutdownRequested,
}

/// Runtime options used by the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Seconds between main-loop ticks.
    pub main_loop_interval: f64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            main_loop_interval: 1.0,
        }
    }
}

pub mod core;
pub mod ledger;
pub mod runtime;

pub use core::{SchedulerCore, TickReport};
pub use ledger::OutputLedger;
pub use runtime::{RunSummary, Runtime};
