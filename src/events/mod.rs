// src/events/mod.rs

//! Task events: job messages in, state transitions, retries and
//! notification handlers out.
//!
//! - [`manager`]: `TaskEventsManager` and `process_message`.
//! - [`handlers`]: handler setup and dispatch (`process_events`).
//! - [`polling`]: poll timers and job timeouts.
//! - [`timers`]: the per-key handler timer registry.
//! - [`activity`]: per-job activity log.

pub mod activity;
pub mod handlers;
pub mod manager;
pub mod polling;
pub mod timers;

use std::fmt;

pub use manager::{EventsSettings, TaskEventsManager};
pub use timers::EventTimers;

pub const EVENT_EXPIRED: &str = "expired";
pub const EVENT_FAILED: &str = "failed";
pub const EVENT_LATE: &str = "late";
pub const EVENT_RETRY: &str = "retry";
pub const EVENT_STARTED: &str = "started";
pub const EVENT_SUBMITTED: &str = "submitted";
pub const EVENT_SUBMIT_FAILED: &str = "submission failed";
pub const EVENT_SUBMIT_RETRY: &str = "submission retry";
pub const EVENT_SUCCEEDED: &str = "succeeded";
pub const EVENT_EXECUTION_TIMEOUT: &str = "execution timeout";
pub const EVENT_SUBMISSION_TIMEOUT: &str = "submission timeout";

pub const HANDLER_CUSTOM: &str = "event-handler";
pub const HANDLER_MAIL: &str = "event-mail";
pub const HANDLER_JOB_LOGS_RETRIEVE: &str = "job-logs-retrieve";

pub const JOB_FAILED: &str = "job failed";
pub const JOB_SUBMIT_FAILED: &str = "job submission failed";

/// Identity of one pending handler action.
///
/// At most one timer exists per key; later events for a pending key are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    /// `event-mail`, `job-logs-retrieve` or `event-handler-NN`.
    pub handler: String,
    /// Event name; non-unique events carry a `-<n>` suffix.
    pub event: String,
    pub message: String,
    pub point: String,
    pub name: String,
    pub submit_num: u32,
}

impl EventKey {
    pub fn job_identity(&self) -> String {
        format!("{}/{}/{:02}", self.point, self.name, self.submit_num)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] {}", self.job_identity(), self.handler, self.event)
    }
}

/// How to act on a due handler timer. Mail and log retrieval timers with
/// equal contexts are batched into one command.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerContext {
    Mail {
        mail_from: String,
        mail_to: String,
    },
    JobLogsRetrieve {
        platform: String,
        max_size: Option<String>,
    },
    Custom {
        /// `event-handler-NN`, also used as the command key.
        key: String,
        cmd: String,
    },
}
