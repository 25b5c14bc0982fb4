// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::duration::{de_opt_secs, de_opt_secs_list, de_secs, de_secs_list};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [workflow]
/// name = "demo"
///
/// [scheduler]
/// process_pool_size = 4
/// process_pool_timeout = "10m"
///
/// [scheduler.mail]
/// interval = "5m"
///
/// [task_events]
/// mail_events = ["failed"]
///
/// [platforms.hpc]
/// hosts = ["login1", "login2"]
/// retrieve_job_logs = true
///
/// [xtriggers]
/// upstream = "check_upstream(point=%(point)s):30s"
///
/// [tasks.foo]
/// script = "echo hello"
/// points = ["20260101T0000Z"]
/// xtriggers = ["upstream"]
/// execution_retry_delays = ["PT1M", "PT5M"]
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub workflow: WorkflowSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Workflow-wide event handler and mail defaults.
    #[serde(default)]
    pub task_events: EventsConfig,

    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,

    /// Label -> `func(args, k=v):interval`.
    #[serde(default)]
    pub xtriggers: BTreeMap<String, String>,

    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
}

/// A validated configuration. Build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub workflow: WorkflowSection,
    pub scheduler: SchedulerSection,
    pub task_events: EventsConfig,
    pub platforms: BTreeMap<String, PlatformConfig>,
    pub xtriggers: BTreeMap<String, String>,
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        let mut platforms = raw.platforms;
        platforms
            .entry("localhost".to_string())
            .or_insert_with(PlatformConfig::default);
        Self {
            workflow: raw.workflow,
            scheduler: raw.scheduler,
            task_events: raw.task_events,
            platforms,
            xtriggers: raw.xtriggers,
            tasks: raw.tasks,
        }
    }
}

/// `[workflow]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_workflow_name")]
    pub name: String,

    /// Run directory; job logs live under `<run_dir>/log/job`.
    /// Defaults to `.cyclexec/<name>` under the config file's directory.
    #[serde(default)]
    pub run_dir: Option<PathBuf>,

    /// Directories searched for xtrigger function executables.
    /// Defaults to `<run_dir>/lib/xtriggers`.
    #[serde(default)]
    pub xtrigger_dirs: Vec<PathBuf>,

    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

fn default_workflow_name() -> String {
    "workflow".to_string()
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            name: default_workflow_name(),
            run_dir: None,
            xtrigger_dirs: Vec::new(),
            meta: BTreeMap::new(),
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_process_pool_size")]
    pub process_pool_size: usize,

    #[serde(default = "default_process_pool_timeout", deserialize_with = "de_secs")]
    pub process_pool_timeout: f64,

    #[serde(default = "default_main_loop_interval", deserialize_with = "de_secs")]
    pub main_loop_interval: f64,

    #[serde(default)]
    pub mail: MailSection,
}

fn default_process_pool_size() -> usize {
    4
}

fn default_process_pool_timeout() -> f64 {
    600.0
}

fn default_main_loop_interval() -> f64 {
    1.0
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            process_pool_size: default_process_pool_size(),
            process_pool_timeout: default_process_pool_timeout(),
            main_loop_interval: default_main_loop_interval(),
            mail: MailSection::default(),
        }
    }
}

/// `[scheduler.mail]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MailSection {
    #[serde(default)]
    pub from: Option<String>,

    #[serde(default)]
    pub to: Option<String>,

    /// SMTP server handed to `mail` through the `smtp` environment variable.
    #[serde(default)]
    pub smtp: Option<String>,

    /// Appended to every mail body; may use `%(workflow)s`, `%(host)s`,
    /// `%(port)s`, `%(owner)s`.
    #[serde(default)]
    pub footer: Option<String>,

    /// Minimum spacing between two notification mails.
    #[serde(default = "default_mail_interval", deserialize_with = "de_secs")]
    pub interval: f64,
}

fn default_mail_interval() -> f64 {
    300.0
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            smtp: None,
            footer: None,
            interval: default_mail_interval(),
        }
    }
}

/// Event handler, mail and timeout settings.
///
/// Appears as the workflow-wide `[task_events]`, per task as
/// `[tasks.<name>.events]`, and in broadcast overrides. Unset fields fall
/// through to the next layer.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct EventsConfig {
    /// Handlers run for every event listed in `handler_events`.
    #[serde(default)]
    pub handlers: Option<Vec<String>>,

    #[serde(default)]
    pub handler_events: Option<Vec<String>>,

    #[serde(default, deserialize_with = "de_opt_secs_list")]
    pub handler_retry_delays: Option<Vec<f64>>,

    /// Per-event handlers, e.g. `"submission failed" = ["notify.sh"]`.
    /// Takes precedence over `handlers`.
    #[serde(default)]
    pub event_handlers: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub mail_events: Option<Vec<String>>,

    #[serde(default)]
    pub mail_from: Option<String>,

    #[serde(default)]
    pub mail_to: Option<String>,

    #[serde(default, deserialize_with = "de_opt_secs")]
    pub submission_timeout: Option<f64>,

    #[serde(default, deserialize_with = "de_opt_secs")]
    pub execution_timeout: Option<f64>,
}

/// Job log retrieval overrides.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RemoteConfig {
    #[serde(default)]
    pub retrieve_job_logs: Option<bool>,

    #[serde(default)]
    pub retrieve_job_logs_max_size: Option<String>,

    #[serde(default, deserialize_with = "de_opt_secs_list")]
    pub retrieve_job_logs_retry_delays: Option<Vec<f64>>,
}

/// `[platforms.<name>]` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlatformConfig {
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    #[serde(default = "default_job_runner")]
    pub job_runner: String,

    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,

    #[serde(default)]
    pub retrieve_job_logs: bool,

    #[serde(default = "default_rsync_command")]
    pub retrieve_job_logs_command: String,

    #[serde(default)]
    pub retrieve_job_logs_max_size: Option<String>,

    #[serde(default, deserialize_with = "de_opt_secs_list")]
    pub retrieve_job_logs_retry_delays: Option<Vec<f64>>,

    #[serde(default = "default_polling", deserialize_with = "de_secs_list")]
    pub submission_polling_intervals: Vec<f64>,

    #[serde(default = "default_polling", deserialize_with = "de_secs_list")]
    pub execution_polling_intervals: Vec<f64>,

    #[serde(
        default = "default_time_limit_polling",
        deserialize_with = "de_secs_list"
    )]
    pub execution_time_limit_polling_intervals: Vec<f64>,
}

fn default_hosts() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_job_runner() -> String {
    "background".to_string()
}

fn default_ssh_command() -> String {
    "ssh -oBatchMode=yes -oConnectTimeout=10".to_string()
}

fn default_rsync_command() -> String {
    "rsync -a".to_string()
}

fn default_polling() -> Vec<f64> {
    vec![900.0]
}

fn default_time_limit_polling() -> Vec<f64> {
    vec![60.0, 120.0, 420.0]
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            job_runner: default_job_runner(),
            ssh_command: default_ssh_command(),
            retrieve_job_logs: false,
            retrieve_job_logs_command: default_rsync_command(),
            retrieve_job_logs_max_size: None,
            retrieve_job_logs_retry_delays: None,
            submission_polling_intervals: default_polling(),
            execution_polling_intervals: default_polling(),
            execution_time_limit_polling_intervals: default_time_limit_polling(),
        }
    }
}

/// `[tasks.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct TaskConfig {
    /// Shell script run as the job.
    #[serde(default)]
    pub script: String,

    /// Cycle points this task runs at. Defaults to a single point `"1"`.
    #[serde(default)]
    pub points: Vec<String>,

    #[serde(default)]
    pub platform: Option<String>,

    /// Prerequisites at the same point: `"other"` (succeeded) or
    /// `"other:output"`.
    #[serde(default)]
    pub after: Vec<String>,

    /// Labels from `[xtriggers]` gating this task.
    #[serde(default)]
    pub xtriggers: Vec<String>,

    #[serde(default, deserialize_with = "de_secs_list")]
    pub execution_retry_delays: Vec<f64>,

    #[serde(default, deserialize_with = "de_secs_list")]
    pub submission_retry_delays: Vec<f64>,

    #[serde(default, deserialize_with = "de_opt_secs")]
    pub execution_time_limit: Option<f64>,

    #[serde(default, deserialize_with = "de_opt_secs_list")]
    pub submission_polling_intervals: Option<Vec<f64>>,

    #[serde(default, deserialize_with = "de_opt_secs_list")]
    pub execution_polling_intervals: Option<Vec<f64>>,

    /// Custom outputs: trigger -> message.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    #[serde(default)]
    pub meta: BTreeMap<String, String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub remote: RemoteConfig,
}

impl TaskConfig {
    pub fn effective_points(&self) -> Vec<String> {
        if self.points.is_empty() {
            vec!["1".to_string()]
        } else {
            self.points.clone()
        }
    }

    pub fn effective_platform(&self) -> &str {
        self.platform.as_deref().unwrap_or("localhost")
    }

    /// `after` entries split into `(task, output)`.
    pub fn prerequisites(&self) -> Vec<(String, String)> {
        self.after
            .iter()
            .map(|entry| match entry.split_once(':') {
                Some((task, output)) => (task.to_string(), output.to_string()),
                None => (entry.clone(), "succeeded".to_string()),
            })
            .collect()
    }
}
