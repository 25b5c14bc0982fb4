#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use cyclexec::config::{
    ConfigFile, EventsConfig, PlatformConfig, RawConfigFile, RemoteConfig, TaskConfig,
};
use cyclexec::errors::Result;
use cyclexec::platform::Platform;
use cyclexec::task::TaskProxy;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.workflow.name = "test-flow".to_string();
        Self { config }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.workflow.name = name.to_string();
        self
    }

    pub fn run_dir(mut self, dir: &Path) -> Self {
        self.config.workflow.run_dir = Some(dir.to_path_buf());
        self
    }

    pub fn xtrigger_dir(mut self, dir: &Path) -> Self {
        self.config.workflow.xtrigger_dirs.push(dir.to_path_buf());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.scheduler.process_pool_size = size;
        self
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.tasks.insert(name.to_string(), task);
        self
    }

    pub fn with_platform(mut self, name: &str, platform: PlatformConfig) -> Self {
        self.config.platforms.insert(name.to_string(), platform);
        self
    }

    pub fn with_xtrigger(mut self, label: &str, decl: &str) -> Self {
        self.config.xtriggers.insert(label.to_string(), decl.to_string());
        self
    }

    pub fn with_task_events(mut self, events: EventsConfig) -> Self {
        self.config.task_events = events;
        self
    }

    pub fn mail_interval(mut self, secs: f64) -> Self {
        self.config.scheduler.mail.interval = secs;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(script: &str) -> Self {
        Self {
            task: TaskConfig {
                script: script.to_string(),
                ..TaskConfig::default()
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn points(mut self, points: &[&str]) -> Self {
        self.task.points = points.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn platform(mut self, name: &str) -> Self {
        self.task.platform = Some(name.to_string());
        self
    }

    pub fn xtrigger(mut self, label: &str) -> Self {
        self.task.xtriggers.push(label.to_string());
        self
    }

    pub fn execution_retry_delays(mut self, delays: &[f64]) -> Self {
        self.task.execution_retry_delays = delays.to_vec();
        self
    }

    pub fn submission_retry_delays(mut self, delays: &[f64]) -> Self {
        self.task.submission_retry_delays = delays.to_vec();
        self
    }

    pub fn submission_polling_intervals(mut self, delays: &[f64]) -> Self {
        self.task.submission_polling_intervals = Some(delays.to_vec());
        self
    }

    pub fn execution_time_limit(mut self, secs: f64) -> Self {
        self.task.execution_time_limit = Some(secs);
        self
    }

    pub fn output(mut self, trigger: &str, message: &str) -> Self {
        self.task.outputs.insert(trigger.to_string(), message.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.task.meta.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.task.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn events(mut self, events: EventsConfig) -> Self {
        self.task.events = events;
        self
    }

    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.task.remote = remote;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// A standalone task proxy on the localhost platform.
pub fn task_proxy(point: &str, name: &str, cfg: TaskConfig) -> TaskProxy {
    TaskProxy::new("test-flow", point, name, cfg, Platform::localhost())
}

/// Event handler settings with `handlers` fired for `events`.
pub fn handler_events(handlers: &[&str], events: &[&str]) -> EventsConfig {
    EventsConfig {
        handlers: Some(handlers.iter().map(|s| s.to_string()).collect()),
        handler_events: Some(events.iter().map(|s| s.to_string()).collect()),
        ..EventsConfig::default()
    }
}

/// `BTreeMap` from string pairs.
pub fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
