// src/task/mod.rs

//! Task instances and their lifecycle vocabulary.

pub mod message;
pub mod outputs;
pub mod proxy;
pub mod status;

pub use message::{MessageFlag, MessageOutcome, Severity, TaskMessage};
pub use outputs::TaskOutputs;
pub use proxy::{JobSummary, RunMode, TaskProxy, TaskState, TimerFlag};
pub use status::TaskStatus;
