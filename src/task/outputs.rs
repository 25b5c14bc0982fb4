// src/task/outputs.rs

//! Task outputs: the standard job lifecycle outputs plus custom ones.

use std::collections::BTreeMap;

pub const TASK_OUTPUT_EXPIRED: &str = "expired";
pub const TASK_OUTPUT_SUBMITTED: &str = "submitted";
pub const TASK_OUTPUT_SUBMIT_FAILED: &str = "submit-failed";
pub const TASK_OUTPUT_STARTED: &str = "started";
pub const TASK_OUTPUT_SUCCEEDED: &str = "succeeded";
pub const TASK_OUTPUT_FAILED: &str = "failed";

pub const STANDARD_OUTPUTS: [&str; 6] = [
    TASK_OUTPUT_EXPIRED,
    TASK_OUTPUT_SUBMITTED,
    TASK_OUTPUT_SUBMIT_FAILED,
    TASK_OUTPUT_STARTED,
    TASK_OUTPUT_SUCCEEDED,
    TASK_OUTPUT_FAILED,
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputEntry {
    trigger: String,
    message: String,
    completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutputs {
    entries: Vec<OutputEntry>,
}

impl TaskOutputs {
    /// Standard outputs (trigger == message) plus `custom` trigger -> message.
    pub fn new(custom: &BTreeMap<String, String>) -> Self {
        let mut entries: Vec<OutputEntry> = STANDARD_OUTPUTS
            .iter()
            .map(|o| OutputEntry {
                trigger: o.to_string(),
                message: o.to_string(),
                completed: false,
            })
            .collect();
        entries.extend(custom.iter().map(|(trigger, message)| OutputEntry {
            trigger: trigger.clone(),
            message: message.clone(),
            completed: false,
        }));
        Self { entries }
    }

    pub fn trigger_for_message(&self, message: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.message == message)
            .map(|e| e.trigger.as_str())
    }

    pub fn is_custom_message(&self, message: &str) -> bool {
        self.trigger_for_message(message)
            .is_some_and(|t| !STANDARD_OUTPUTS.contains(&t))
    }

    pub fn is_completed(&self, trigger: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.trigger == trigger && e.completed)
    }

    /// Set the completion of `trigger`. Returns the trigger only if this
    /// changed anything, so a repeated completion is a no-op.
    pub fn set_trigger_completion(&mut self, trigger: &str, completed: bool) -> Option<String> {
        let entry = self.entries.iter_mut().find(|e| e.trigger == trigger)?;
        if entry.completed == completed {
            return None;
        }
        entry.completed = completed;
        Some(entry.trigger.clone())
    }

    pub fn set_message_completion(&mut self, message: &str, completed: bool) -> Option<String> {
        let trigger = self.trigger_for_message(message)?.to_string();
        self.set_trigger_completion(&trigger, completed)
    }

    pub fn completed_triggers(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.completed)
            .map(|e| e.trigger.as_str())
    }

    /// Forget every completion (a new try starts from scratch).
    pub fn reset(&mut self) {
        for e in &mut self.entries {
            e.completed = false;
        }
    }
}
