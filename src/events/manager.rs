// src/events/manager.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::collab::{Collaborators, JobUpdate, TaskOverrides, WorkflowContext};
use crate::config::model::{EventsConfig, MailSection};
use crate::events::handlers::HandlerOutcome;
use crate::events::timers::EventTimers;
use crate::events::{
    EVENT_EXPIRED, EVENT_FAILED, EVENT_RETRY, EVENT_STARTED, EVENT_SUBMIT_FAILED,
    EVENT_SUBMIT_RETRY, EVENT_SUBMITTED, EVENT_SUCCEEDED, JOB_FAILED, JOB_SUBMIT_FAILED,
};
use crate::platform::{BadHosts, Platform};
use crate::task::message::{
    ABORT_MESSAGE_PREFIX, FAIL_MESSAGE_PREFIX, VACATION_MESSAGE_PREFIX,
};
use crate::task::outputs::{
    TASK_OUTPUT_EXPIRED, TASK_OUTPUT_FAILED, TASK_OUTPUT_STARTED, TASK_OUTPUT_SUBMIT_FAILED,
    TASK_OUTPUT_SUBMITTED, TASK_OUTPUT_SUCCEEDED,
};
use crate::task::{
    MessageFlag, MessageOutcome, Severity, TaskMessage, TaskProxy, TaskStatus, TimerFlag,
};
use crate::wallclock;
use crate::xtrigger::spec::{WALL_CLOCK, XtriggerSpec};

/// Workflow-wide notification settings.
#[derive(Debug, Clone, Default)]
pub struct EventsSettings {
    pub mail: MailSection,
    /// `[task_events]` defaults.
    pub task_events: EventsConfig,
}

/// Turns job messages into task state transitions and schedules the
/// resulting retries and notifications.
pub struct TaskEventsManager {
    pub(crate) workflow: WorkflowContext,
    pub(crate) settings: EventsSettings,
    pub(crate) platforms: BTreeMap<String, Platform>,
    pub(crate) collab: Collaborators,
    pub(crate) bad_hosts: BadHosts,
    pub(crate) timers: EventTimers,
    pub(crate) next_mail_time: Option<f64>,
    pub(crate) stopping: bool,
    pub(crate) outcome_tx: mpsc::UnboundedSender<HandlerOutcome>,
    pub(crate) outcome_rx: mpsc::UnboundedReceiver<HandlerOutcome>,
    last_activity: f64,
}

impl std::fmt::Debug for TaskEventsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEventsManager")
            .field("workflow", &self.workflow.name)
            .field("timers", &self.timers.len())
            .field("next_mail_time", &self.next_mail_time)
            .finish_non_exhaustive()
    }
}

impl TaskEventsManager {
    pub fn new(
        workflow: WorkflowContext,
        settings: EventsSettings,
        platforms: BTreeMap<String, Platform>,
        bad_hosts: BadHosts,
        collab: Collaborators,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            workflow,
            settings,
            platforms,
            collab,
            bad_hosts,
            timers: EventTimers::new(),
            next_mail_time: None,
            stopping: false,
            outcome_tx,
            outcome_rx,
            last_activity: wallclock::now(),
        }
    }

    pub fn timers(&self) -> &EventTimers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut EventTimers {
        &mut self.timers
    }

    pub fn bad_hosts(&self) -> &BadHosts {
        &self.bad_hosts
    }

    pub fn reset_bad_hosts(&self) {
        if !self.bad_hosts.is_empty() {
            info!(count = self.bad_hosts.len(), "clearing unreachable hosts");
        }
        self.bad_hosts.clear();
    }

    /// Stop mode: mail is flushed regardless of the mail interval.
    pub fn set_stopping(&mut self, stopping: bool) {
        self.stopping = stopping;
    }

    pub fn next_mail_time(&self) -> Option<f64> {
        self.next_mail_time
    }

    /// Time of the most recent job message.
    pub fn last_activity(&self) -> f64 {
        self.last_activity
    }

    pub(crate) fn job_log_dir(&self) -> PathBuf {
        self.workflow.job_log_dir()
    }

    pub(crate) fn overrides(&self, itask: &TaskProxy) -> TaskOverrides {
        self.collab.broadcasts.get_broadcast(&itask.point, &itask.name)
    }

    /// Events setting lookup: broadcast, then task, then workflow defaults.
    pub(crate) fn events_conf<T>(
        &self,
        itask: &TaskProxy,
        get: impl Fn(&EventsConfig) -> Option<T>,
    ) -> Option<T> {
        let overrides = self.overrides(itask);
        get(&overrides.events)
            .or_else(|| get(&itask.rtconfig.events))
            .or_else(|| get(&self.settings.task_events))
    }

    pub fn process_message(&mut self, itask: &mut TaskProxy, msg: &TaskMessage) -> MessageOutcome {
        self.process_message_at(itask, msg, wallclock::now())
    }

    /// Apply one job message to `itask`.
    ///
    /// Re-delivery of a message whose output is already complete is a
    /// no-op; a received message implying a backward transition changes
    /// nothing and asks the caller to poll instead.
    pub fn process_message_at(
        &mut self,
        itask: &mut TaskProxy,
        msg: &TaskMessage,
        now: f64,
    ) -> MessageOutcome {
        let message = msg.message.as_str();
        let event_time = msg
            .event_time
            .clone()
            .unwrap_or_else(|| wallclock::time_string(now));
        let submit_num = msg.submit_num.unwrap_or(itask.submit_num);
        self.last_activity = now;

        if msg.flag == MessageFlag::Received && submit_num != itask.submit_num {
            warn!(
                task = %itask,
                submit_num,
                "{}{message} at {event_time} for a previous submit; ignored",
                MessageFlag::Received.tag()
            );
            return MessageOutcome::Ignored;
        }

        if itask.status() == TaskStatus::Waiting && itask.has_retry_lined_up() {
            warn!(task = %itask, "{}{message} at {event_time}", msg.flag.ignored_tag());
            return MessageOutcome::Ignored;
        }

        if let Some(trigger) = target_output(itask, message) {
            if itask.state.outputs.is_completed(&trigger) {
                debug!(task = %itask, "{}{message} at {event_time} (duplicate)", msg.flag.tag());
                return MessageOutcome::Ignored;
            }
        }

        if msg.flag == MessageFlag::Received {
            if let Some(target) = target_status(message) {
                if itask.status() > target {
                    info!(
                        task = %itask,
                        "{}{message} at {event_time}: backward transition from {}; poll to confirm",
                        msg.flag.tag(),
                        itask.status()
                    );
                    return MessageOutcome::PollRequired;
                }
            }
        }

        let log_line = format!("{}{message} at {event_time}", msg.flag.tag());
        match msg.severity {
            Severity::Critical | Severity::Error | Severity::Warning => {
                warn!(task = %itask, "{log_line}")
            }
            Severity::Debug => debug!(task = %itask, "{log_line}"),
            _ => info!(task = %itask, "{log_line}"),
        }
        self.collab
            .recorder
            .job_message(itask, &event_time, msg.severity, message);

        // A job that says anything beyond submission has started.
        let implies_started = !matches!(
            message,
            TASK_OUTPUT_SUBMITTED | TASK_OUTPUT_SUBMIT_FAILED | TASK_OUTPUT_STARTED | TASK_OUTPUT_EXPIRED
        );
        if implies_started
            && !itask.state.outputs.is_completed(TASK_OUTPUT_STARTED)
            && matches!(itask.status(), TaskStatus::Preparing | TaskStatus::Submitted)
        {
            self.process_message_at(itask, &internal(TASK_OUTPUT_STARTED, &event_time, submit_num), now);
        }

        match message {
            TASK_OUTPUT_STARTED => {
                if itask.status() == TaskStatus::Preparing {
                    self.process_message_at(
                        itask,
                        &internal(TASK_OUTPUT_SUBMITTED, &event_time, submit_num),
                        now,
                    );
                }
                self.process_message_started(itask, &event_time, now);
            }
            TASK_OUTPUT_SUCCEEDED => self.process_message_succeeded(itask, &event_time, now),
            TASK_OUTPUT_FAILED => self.process_message_failed(itask, &event_time, JOB_FAILED, now),
            TASK_OUTPUT_SUBMITTED => self.process_message_submitted(itask, &event_time, now),
            TASK_OUTPUT_SUBMIT_FAILED => self.process_message_submit_failed(itask, &event_time, now),
            TASK_OUTPUT_EXPIRED => self.process_message_expired(itask, now),
            m if m.starts_with(FAIL_MESSAGE_PREFIX) || m.starts_with(ABORT_MESSAGE_PREFIX) => {
                let signal = m.split_once('/').map(|(_, s)| s).unwrap_or_default();
                self.collab.recorder.job_update(
                    itask,
                    &JobUpdate {
                        run_signal: Some(signal.to_string()),
                        ..JobUpdate::default()
                    },
                );
                self.process_message_failed(itask, &event_time, m, now);
            }
            m if m.starts_with(VACATION_MESSAGE_PREFIX) => {
                self.process_message_vacated(itask, &event_time, m, now);
            }
            m if itask.state.outputs.is_custom_message(m) => {
                if let Some(trigger) = itask.state.outputs.set_message_completion(m, true) {
                    self.output_completed(itask, &trigger);
                    self.setup_event_handlers(itask, &trigger, m);
                }
            }
            m if msg.severity.is_non_unique_event() => {
                self.setup_event_handlers(itask, msg.severity.as_str(), m);
            }
            m => {
                self.collab.recorder.task_event(
                    itask,
                    &format!("message {}", msg.severity),
                    m,
                );
            }
        }
        MessageOutcome::Applied
    }

    fn output_completed(&self, itask: &TaskProxy, trigger: &str) {
        self.collab.recorder.task_output(itask, trigger);
        self.collab.spawner.spawn_on_output(itask, trigger);
    }

    fn complete_output(&self, itask: &mut TaskProxy, trigger: &str) {
        if itask.state.outputs.set_trigger_completion(trigger, true).is_some() {
            self.output_completed(itask, trigger);
        }
    }

    fn reset_state(&self, itask: &mut TaskProxy, status: TaskStatus) -> bool {
        let changed = itask.state_reset(status);
        if changed {
            self.collab.recorder.task_state(itask);
        }
        changed
    }

    fn process_message_started(&mut self, itask: &mut TaskProxy, event_time: &str, now: f64) {
        if itask.job_vacated {
            itask.job_vacated = false;
            warn!(task = %itask, "vacated job restarted");
        }
        itask.summary.started_time = Some(wallclock::parse_time_string(event_time).unwrap_or(now));
        self.collab.recorder.job_update(
            itask,
            &JobUpdate {
                time_run: Some(event_time.to_string()),
                ..JobUpdate::default()
            },
        );
        self.complete_output(itask, TASK_OUTPUT_STARTED);
        if self.reset_state(itask, TaskStatus::Running) {
            self.setup_event_handlers(itask, EVENT_STARTED, "job started");
        }
        self.reset_job_timers_at(itask, now);

        // The submission was good, so submission retries start over.
        if let Some(timer) = itask.try_timers.get_mut(&TimerFlag::SubmissionRetry) {
            timer.set_num(0);
        }
    }

    fn process_message_succeeded(&mut self, itask: &mut TaskProxy, event_time: &str, now: f64) {
        self.collab.recorder.job_update(
            itask,
            &JobUpdate {
                run_status: Some(0),
                time_run_exit: Some(event_time.to_string()),
                ..JobUpdate::default()
            },
        );
        itask.summary.finished_time =
            Some(wallclock::parse_time_string(event_time).unwrap_or(now));
        self.complete_output(itask, TASK_OUTPUT_SUCCEEDED);
        if self.reset_state(itask, TaskStatus::Succeeded) {
            self.setup_event_handlers(itask, EVENT_SUCCEEDED, "job succeeded");
        }
        self.reset_job_timers_at(itask, now);
    }

    fn process_message_failed(
        &mut self,
        itask: &mut TaskProxy,
        event_time: &str,
        message: &str,
        now: f64,
    ) {
        itask.summary.finished_time =
            Some(wallclock::parse_time_string(event_time).unwrap_or(now));
        self.collab.recorder.job_update(
            itask,
            &JobUpdate {
                run_status: Some(1),
                time_run_exit: Some(event_time.to_string()),
                ..JobUpdate::default()
            },
        );
        match next_retry(itask, TimerFlag::ExecutionRetry, now) {
            None => {
                self.complete_output(itask, TASK_OUTPUT_FAILED);
                if self.reset_state(itask, TaskStatus::Failed) {
                    self.setup_event_handlers(itask, EVENT_FAILED, message);
                }
                info!(task = %itask, "job failed; no retries left");
            }
            Some((delay, due)) => {
                self.retry_task(itask, due, false);
                let retry_msg = format!(
                    "{JOB_FAILED}, retrying in {}",
                    wallclock::interval_as_str(delay)
                );
                info!(task = %itask, "{retry_msg}");
                self.setup_event_handlers(itask, EVENT_RETRY, &retry_msg);
            }
        }
        self.reset_job_timers_at(itask, now);
    }

    fn process_message_submitted(&mut self, itask: &mut TaskProxy, event_time: &str, now: f64) {
        itask.summary.submitted_time =
            Some(wallclock::parse_time_string(event_time).unwrap_or(now));
        itask
            .summary
            .platforms_used
            .insert(itask.submit_num, itask.platform.name.clone());
        self.collab.recorder.job_update(
            itask,
            &JobUpdate {
                submit_status: Some(0),
                time_submit: Some(event_time.to_string()),
                job_id: itask.summary.job_id.clone(),
                job_runner_name: itask.summary.job_runner_name.clone(),
                platform_name: Some(itask.platform.name.clone()),
                ..JobUpdate::default()
            },
        );
        self.complete_output(itask, TASK_OUTPUT_SUBMITTED);
        if itask.status() < TaskStatus::Submitted && self.reset_state(itask, TaskStatus::Submitted) {
            self.setup_event_handlers(itask, EVENT_SUBMITTED, "job submitted");
        }
        self.reset_job_timers_at(itask, now);
    }

    fn process_message_submit_failed(&mut self, itask: &mut TaskProxy, event_time: &str, now: f64) {
        self.collab.recorder.job_update(
            itask,
            &JobUpdate {
                submit_status: Some(1),
                time_submit: Some(event_time.to_string()),
                ..JobUpdate::default()
            },
        );
        match next_retry(itask, TimerFlag::SubmissionRetry, now) {
            None => {
                self.complete_output(itask, TASK_OUTPUT_SUBMIT_FAILED);
                if self.reset_state(itask, TaskStatus::SubmitFailed) {
                    self.setup_event_handlers(itask, EVENT_SUBMIT_FAILED, JOB_SUBMIT_FAILED);
                }
                info!(task = %itask, "job submission failed; no retries left");
            }
            Some((delay, due)) => {
                self.retry_task(itask, due, true);
                let retry_msg = format!(
                    "{JOB_SUBMIT_FAILED}, retrying in {}",
                    wallclock::interval_as_str(delay)
                );
                info!(task = %itask, "{retry_msg}");
                self.setup_event_handlers(itask, EVENT_SUBMIT_RETRY, &retry_msg);
            }
        }
        self.reset_job_timers_at(itask, now);
    }

    fn process_message_vacated(
        &mut self,
        itask: &mut TaskProxy,
        event_time: &str,
        message: &str,
        now: f64,
    ) {
        itask.job_vacated = true;
        itask.summary.started_time = None;
        itask
            .state
            .outputs
            .set_trigger_completion(TASK_OUTPUT_STARTED, false);
        if let Some(timer) = itask.try_timers.get_mut(&TimerFlag::SubmissionRetry) {
            timer.set_num(0);
        }
        warn!(task = %itask, "job vacated: {message} at {event_time}");
        self.reset_state(itask, TaskStatus::Submitted);
        self.reset_job_timers_at(itask, now);
    }

    fn process_message_expired(&mut self, itask: &mut TaskProxy, now: f64) {
        self.complete_output(itask, TASK_OUTPUT_EXPIRED);
        if self.reset_state(itask, TaskStatus::Expired) {
            self.setup_event_handlers(itask, EVENT_EXPIRED, "task expired");
        }
        self.reset_job_timers_at(itask, now);
    }

    /// Send the task back to waiting behind a task-local clock trigger.
    fn retry_task(&self, itask: &mut TaskProxy, due: f64, submit_retry: bool) {
        let label = if submit_retry {
            format!("_submit_retry_{}", itask.identity())
        } else {
            format!("_retry_{}", itask.identity())
        };
        let trigger = XtriggerSpec::new(WALL_CLOCK).kwarg("trigger_time", due);
        debug!(task = %itask, %label, signature = %trigger.signature(), "retry trigger installed");
        itask.retry_xtriggers.insert(label.clone(), trigger);
        itask.state.xtriggers.insert(label, false);
        itask.state.outputs.reset();
        self.reset_state(itask, TaskStatus::Waiting);
    }
}

fn internal(message: &str, event_time: &str, submit_num: u32) -> TaskMessage {
    TaskMessage::new(message)
        .flag(MessageFlag::Internal)
        .event_time(event_time)
        .submit_num(submit_num)
}

/// Output completed by `message`, if it maps onto one.
fn target_output(itask: &TaskProxy, message: &str) -> Option<String> {
    if message.starts_with(FAIL_MESSAGE_PREFIX) || message.starts_with(ABORT_MESSAGE_PREFIX) {
        return Some(TASK_OUTPUT_FAILED.to_string());
    }
    itask
        .state
        .outputs
        .trigger_for_message(message)
        .map(str::to_string)
}

/// Status a received message moves the task to.
fn target_status(message: &str) -> Option<TaskStatus> {
    match message {
        TASK_OUTPUT_SUBMITTED => Some(TaskStatus::Submitted),
        TASK_OUTPUT_SUBMIT_FAILED => Some(TaskStatus::SubmitFailed),
        TASK_OUTPUT_STARTED => Some(TaskStatus::Running),
        TASK_OUTPUT_FAILED => Some(TaskStatus::Failed),
        m if m.starts_with(FAIL_MESSAGE_PREFIX) || m.starts_with(ABORT_MESSAGE_PREFIX) => {
            Some(TaskStatus::Failed)
        }
        _ => None,
    }
}

/// Consume the next retry delay, if another try is allowed.
///
/// A delay list of length K allows K tries: failure `i < K` waits
/// `delays[i - 1]`, failure K is final.
fn next_retry(itask: &mut TaskProxy, flag: TimerFlag, now: f64) -> Option<(f64, f64)> {
    let timer = itask.try_timers.get_mut(&flag)?;
    if timer.num() + 1 >= timer.delays().len() {
        return None;
    }
    let due = timer.next_at(now, false)?;
    Some((timer.delay().unwrap_or(0.0), due))
}
