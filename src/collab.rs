// src/collab.rs

//! Collaborators the engine reports to or reads from but does not own:
//! persistence, broadcast overrides and downstream spawning.
//!
//! All of them are shared as `Arc<dyn _>` and take `&self`; implementations
//! use interior mutability.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::model::{EventsConfig, RemoteConfig};
use crate::platform::{HostResolver, LocalHostResolver};
use crate::task::{Severity, TaskProxy};

/// What the engine knows about the running workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowContext {
    pub name: String,
    pub uuid: String,
    pub run_dir: PathBuf,
    pub meta: BTreeMap<String, String>,
}

impl WorkflowContext {
    pub fn new(name: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            run_dir: run_dir.into(),
            meta: BTreeMap::new(),
        }
    }

    /// Local job log root: `<run_dir>/log/job`.
    pub fn job_log_dir(&self) -> PathBuf {
        self.run_dir.join("log").join("job")
    }

    pub fn share_dir(&self) -> PathBuf {
        self.run_dir.join("share")
    }

    /// Job log root as seen from a remote host.
    pub fn remote_job_log_dir(&self) -> String {
        format!("~/.cyclexec/{}/log/job", self.name)
    }
}

/// Partial job row update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub submit_status: Option<i32>,
    pub run_status: Option<i32>,
    pub run_signal: Option<String>,
    pub time_submit: Option<String>,
    pub time_run: Option<String>,
    pub time_run_exit: Option<String>,
    pub job_id: Option<String>,
    pub job_runner_name: Option<String>,
    pub platform_name: Option<String>,
}

/// Fire-and-forget persistence of task and job history.
pub trait TaskRecorder: Send + Sync {
    fn job_message(&self, _itask: &TaskProxy, _event_time: &str, _severity: Severity, _message: &str) {}
    fn task_output(&self, _itask: &TaskProxy, _output: &str) {}
    fn task_state(&self, _itask: &TaskProxy) {}
    fn task_event(&self, _itask: &TaskProxy, _event: &str, _message: &str) {}
    fn job_update(&self, _itask: &TaskProxy, _update: &JobUpdate) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl TaskRecorder for NullRecorder {}

/// Runtime overrides broadcast to a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOverrides {
    pub events: EventsConfig,
    pub remote: RemoteConfig,
    pub submission_polling_intervals: Option<Vec<f64>>,
    pub execution_polling_intervals: Option<Vec<f64>>,
    pub execution_time_limit: Option<f64>,
    pub environment: BTreeMap<String, String>,
}

pub trait BroadcastStore: Send + Sync {
    fn get_broadcast(&self, point: &str, name: &str) -> TaskOverrides;
    /// Merge environment variables into the overrides of `point`/`name`.
    fn put_broadcast(&self, point: &str, name: &str, environment: BTreeMap<String, String>);
}

/// Broadcasts held in memory for the life of the scheduler.
#[derive(Debug, Default)]
pub struct InMemoryBroadcasts {
    inner: Mutex<BTreeMap<(String, String), TaskOverrides>>,
}

impl InMemoryBroadcasts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the overrides of `point`/`name`.
    pub fn set_overrides(&self, point: &str, name: &str, overrides: TaskOverrides) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert((point.to_string(), name.to_string()), overrides);
    }
}

impl BroadcastStore for InMemoryBroadcasts {
    fn get_broadcast(&self, point: &str, name: &str) -> TaskOverrides {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get(&(point.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn put_broadcast(&self, point: &str, name: &str, environment: BTreeMap<String, String>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry((point.to_string(), name.to_string()))
            .or_default()
            .environment
            .extend(environment);
    }
}

/// Told about every newly completed output so dependents can be spawned.
pub trait TaskSpawner: Send + Sync {
    fn spawn_on_output(&self, itask: &TaskProxy, output: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSpawner;

impl TaskSpawner for NullSpawner {
    fn spawn_on_output(&self, _itask: &TaskProxy, _output: &str) {}
}

/// The collaborator set handed to the managers.
#[derive(Clone)]
pub struct Collaborators {
    pub recorder: Arc<dyn TaskRecorder>,
    pub broadcasts: Arc<dyn BroadcastStore>,
    pub spawner: Arc<dyn TaskSpawner>,
    pub hosts: Arc<dyn HostResolver>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            recorder: Arc::new(NullRecorder),
            broadcasts: Arc::new(InMemoryBroadcasts::new()),
            spawner: Arc::new(NullSpawner),
            hosts: Arc::new(LocalHostResolver::new()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
