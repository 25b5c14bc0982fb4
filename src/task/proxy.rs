// src/task/proxy.rs

use std::collections::BTreeMap;
use std::fmt;

use crate::config::model::TaskConfig;
use crate::platform::Platform;
use crate::task::outputs::TaskOutputs;
use crate::task::status::TaskStatus;
use crate::timer::RetryTimer;
use crate::wallclock;
use crate::xtrigger::spec::XtriggerSpec;

/// Which try timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerFlag {
    ExecutionRetry,
    SubmissionRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Live,
    /// Jobs are not really run; no event handlers fire.
    Simulation,
}

/// Status plus the things whose satisfaction decides the next status.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub status: TaskStatus,
    /// xtrigger label -> satisfied.
    pub xtriggers: BTreeMap<String, bool>,
    pub outputs: TaskOutputs,
}

impl TaskState {
    pub fn xtriggers_all_satisfied(&self) -> bool {
        self.xtriggers.values().all(|s| *s)
    }
}

/// Times and identifiers of the latest job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSummary {
    pub submitted_time: Option<f64>,
    pub started_time: Option<f64>,
    pub finished_time: Option<f64>,
    pub job_id: Option<String>,
    pub job_runner_name: Option<String>,
    pub execution_time_limit: Option<f64>,
    /// submit number -> platform name.
    pub platforms_used: BTreeMap<u32, String>,
}

/// One task at one cycle point.
#[derive(Debug, Clone)]
pub struct TaskProxy {
    pub workflow: String,
    pub point: String,
    pub name: String,
    /// Cycle point as epoch seconds, when the point is a date-time.
    pub point_seconds: Option<f64>,
    pub submit_num: u32,
    pub state: TaskState,
    pub try_timers: BTreeMap<TimerFlag, RetryTimer<()>>,
    /// Keyed by `(submit_num, status)` so a stale schedule is detectable.
    pub poll_timer: Option<RetryTimer<(u32, TaskStatus)>>,
    /// Absolute submission/execution timeout.
    pub timeout: Option<f64>,
    pub summary: JobSummary,
    pub non_unique_events: BTreeMap<String, u32>,
    pub job_vacated: bool,
    pub platform: Platform,
    pub rtconfig: TaskConfig,
    /// Task-local retry triggers, consulted before the workflow's xtriggers.
    pub retry_xtriggers: BTreeMap<String, XtriggerSpec>,
    pub run_mode: RunMode,
}

impl TaskProxy {
    pub fn new(
        workflow: impl Into<String>,
        point: impl Into<String>,
        name: impl Into<String>,
        rtconfig: TaskConfig,
        platform: Platform,
    ) -> Self {
        let point = point.into();
        let mut try_timers = BTreeMap::new();
        if !rtconfig.execution_retry_delays.is_empty() {
            try_timers.insert(
                TimerFlag::ExecutionRetry,
                RetryTimer::new((), rtconfig.execution_retry_delays.clone()),
            );
        }
        if !rtconfig.submission_retry_delays.is_empty() {
            try_timers.insert(
                TimerFlag::SubmissionRetry,
                RetryTimer::new((), rtconfig.submission_retry_delays.clone()),
            );
        }
        let xtriggers = rtconfig
            .xtriggers
            .iter()
            .map(|label| (label.clone(), false))
            .collect();
        let summary = JobSummary {
            execution_time_limit: rtconfig.execution_time_limit,
            ..JobSummary::default()
        };

        Self {
            workflow: workflow.into(),
            point_seconds: wallclock::parse_time_string(&point),
            point,
            name: name.into(),
            submit_num: 0,
            state: TaskState {
                status: TaskStatus::Waiting,
                xtriggers,
                outputs: TaskOutputs::new(&rtconfig.outputs),
            },
            try_timers,
            poll_timer: None,
            timeout: None,
            summary,
            non_unique_events: BTreeMap::new(),
            job_vacated: false,
            platform,
            rtconfig,
            retry_xtriggers: BTreeMap::new(),
            run_mode: RunMode::Live,
        }
    }

    /// `point/name`
    pub fn identity(&self) -> String {
        format!("{}/{}", self.point, self.name)
    }

    /// `point/name/NN` for the current submit.
    pub fn job_identity(&self) -> String {
        format!("{}/{}/{:02}", self.point, self.name, self.submit_num)
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status
    }

    /// Change status; returns `false` if it was already `status`.
    pub fn state_reset(&mut self, status: TaskStatus) -> bool {
        if self.state.status == status {
            return false;
        }
        tracing::info!(task = %self, from = %self.state.status, to = %status, "state changed");
        self.state.status = status;
        true
    }

    /// 1-based try number of the current (or next) execution.
    pub fn try_num(&self) -> usize {
        self.try_timers
            .get(&TimerFlag::ExecutionRetry)
            .map(|t| t.num() + 1)
            .unwrap_or(1)
    }

    /// A retry is lined up on either try timer.
    pub fn has_retry_lined_up(&self) -> bool {
        self.try_timers.values().any(|t| t.num() > 0)
    }

    pub fn is_ready_to_run(&self) -> bool {
        self.state.status == TaskStatus::Waiting && self.state.xtriggers_all_satisfied()
    }
}

impl fmt::Display for TaskProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:02}:{}",
            self.identity(),
            self.submit_num,
            self.state.status
        )
    }
}
