// src/task/status.rs

use std::fmt;

/// Task status, ordered by progress.
///
/// The order matters: a message whose target status is *below* the current
/// one is a backward transition and needs confirmation by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskStatus {
    Waiting,
    Expired,
    Preparing,
    SubmitFailed,
    Submitted,
    Running,
    Failed,
    Succeeded,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Expired => "expired",
            TaskStatus::Preparing => "preparing",
            TaskStatus::SubmitFailed => "submit-failed",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
            TaskStatus::Succeeded => "succeeded",
        }
    }

    /// A job exists and has not finished.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Submitted | TaskStatus::Running)
    }

    /// No further transition without outside intervention.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Expired
                | TaskStatus::SubmitFailed
                | TaskStatus::Failed
                | TaskStatus::Succeeded
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
