//! Collaborator doubles that remember what they were told.

use std::collections::HashSet;
use std::sync::Mutex;

use cyclexec::collab::{JobUpdate, TaskRecorder, TaskSpawner};
use cyclexec::platform::HostResolver;
use cyclexec::task::{Severity, TaskProxy};

/// Keeps every recorder call as a readable line.
#[derive(Debug, Default)]
pub struct RecordingRecorder {
    lines: Mutex<Vec<String>>,
}

impl RecordingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Task events recorded, as `(event, message)`.
    pub fn events(&self) -> Vec<(String, String)> {
        self.lines()
            .iter()
            .filter_map(|l| l.strip_prefix("event "))
            .filter_map(|l| l.split_once(" | "))
            .map(|(e, m)| (e.to_string(), m.to_string()))
            .collect()
    }

    fn push(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}

impl TaskRecorder for RecordingRecorder {
    fn job_message(&self, itask: &TaskProxy, _event_time: &str, severity: Severity, message: &str) {
        self.push(format!("message {} {severity} {message}", itask.job_identity()));
    }

    fn task_output(&self, itask: &TaskProxy, output: &str) {
        self.push(format!("output {} {output}", itask.identity()));
    }

    fn task_state(&self, itask: &TaskProxy) {
        self.push(format!("state {} {}", itask.identity(), itask.status()));
    }

    fn task_event(&self, _itask: &TaskProxy, event: &str, message: &str) {
        self.push(format!("event {event} | {message}"));
    }

    fn job_update(&self, itask: &TaskProxy, update: &JobUpdate) {
        self.push(format!("job {} {update:?}", itask.job_identity()));
    }
}

/// Remembers `(identity, output)` for every spawn notification.
#[derive(Debug, Default)]
pub struct RecordingSpawner {
    outputs: Mutex<Vec<(String, String)>>,
}

impl RecordingSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<(String, String)> {
        self.outputs.lock().unwrap().clone()
    }
}

impl TaskSpawner for RecordingSpawner {
    fn spawn_on_output(&self, itask: &TaskProxy, output: &str) {
        self.outputs
            .lock()
            .unwrap()
            .push((itask.identity(), output.to_string()));
    }
}

/// Fixed host facts; hosts in `remote` count as remote.
#[derive(Debug, Clone)]
pub struct StaticHosts {
    pub host: String,
    pub user: String,
    pub remote: HashSet<String>,
}

impl StaticHosts {
    pub fn new(remote: &[&str]) -> Self {
        Self {
            host: "testhost".to_string(),
            user: "tester".to_string(),
            remote: remote.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl HostResolver for StaticHosts {
    fn local_host(&self) -> String {
        self.host.clone()
    }

    fn user(&self) -> String {
        self.user.clone()
    }

    fn is_remote_host(&self, host: &str) -> bool {
        self.remote.contains(host)
    }
}
