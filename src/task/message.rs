// src/task/message.rs

//! Job messages as they reach the event manager.

use std::fmt;

/// Prefix of `failed/<signal>` messages.
pub const FAIL_MESSAGE_PREFIX: &str = "failed/";
/// Prefix of `aborted/<reason>` messages.
pub const ABORT_MESSAGE_PREFIX: &str = "aborted/";
/// Prefix of `vacated/<signal>` messages.
pub const VACATION_MESSAGE_PREFIX: &str = "vacated/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Custom,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Severity> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Some(Severity::Debug),
            "info" | "normal" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            "custom" => Some(Severity::Custom),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
            Severity::Custom => "custom",
        }
    }

    /// Severities whose messages may fire handlers repeatedly.
    pub fn is_non_unique_event(self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical | Severity::Custom)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageFlag {
    /// Synthesised by the scheduler itself.
    Internal,
    /// Sent by the job.
    Received,
    /// Found by polling the job.
    Polled,
}

impl MessageFlag {
    pub fn tag(self) -> &'static str {
        match self {
            MessageFlag::Internal => "(internal)",
            MessageFlag::Received => "(received)",
            MessageFlag::Polled => "(polled)",
        }
    }

    pub fn ignored_tag(self) -> &'static str {
        match self {
            MessageFlag::Internal => "(internal-ignored)",
            MessageFlag::Received => "(received-ignored)",
            MessageFlag::Polled => "(polled-ignored)",
        }
    }
}

/// A job message for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub severity: Severity,
    pub message: String,
    /// Defaults to "now" when processed.
    pub event_time: Option<String>,
    pub flag: MessageFlag,
    /// Defaults to the task's current submit number.
    pub submit_num: Option<u32>,
}

impl TaskMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
            event_time: None,
            flag: MessageFlag::Received,
            submit_num: None,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn flag(mut self, flag: MessageFlag) -> Self {
        self.flag = flag;
        self
    }

    pub fn submit_num(mut self, submit_num: u32) -> Self {
        self.submit_num = Some(submit_num);
        self
    }

    pub fn event_time(mut self, event_time: impl Into<String>) -> Self {
        self.event_time = Some(event_time.into());
        self
    }
}

/// What `process_message` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Applied,
    Ignored,
    /// Backward transition claimed by the job; poll to confirm.
    PollRequired,
}
