// src/engine/core.rs

//! Synchronous scheduler core.
//!
//! [`SchedulerCore`] owns the subprocess pool, both managers and the task
//! table. Each [`SchedulerCore::tick`] is one main-loop iteration with an
//! explicit clock, so the whole lifecycle can be driven from tests without
//! Tokio timers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collab::{Collaborators, WorkflowContext};
use crate::config::model::ConfigFile;
use crate::errors::{CyclexecError, Result};
use crate::events::activity::job_dir;
use crate::events::{EventsSettings, TaskEventsManager};
use crate::job_runner::{self, JobConf, JobRunnerHandler, JobScript};
use crate::platform::{BadHosts, Platform};
use crate::subproc::context::{JOBS_POLL, JOBS_SUBMIT, RET_CODE_WORKFLOW_STOPPING};
use crate::subproc::{Callbacks, CommandContext, PoolOptions, SubProcPool};
use crate::task::outputs::{
    TASK_OUTPUT_FAILED, TASK_OUTPUT_STARTED, TASK_OUTPUT_SUBMIT_FAILED, TASK_OUTPUT_SUBMITTED,
    TASK_OUTPUT_SUCCEEDED,
};
use crate::task::{MessageFlag, MessageOutcome, TaskMessage, TaskProxy, TaskStatus};
use crate::wallclock;
use crate::xtrigger::{XtriggerManager, XtriggerSpec};

use super::ledger::OutputLedger;

/// Progress of a `jobs-submit` command.
#[derive(Debug, Clone)]
enum JobEvent {
    Launched { id: String, submit_num: u32, pid: u32 },
    Finished { id: String, submit_num: u32, ctx: CommandContext },
}

/// What one tick left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub submitted: usize,
    /// Nothing left to do: every task finished (or, when stopping, nothing
    /// is active any more) and no command or handler is pending.
    pub done: bool,
    /// Waiting tasks remain but none of them can ever run.
    pub stalled: bool,
}

pub struct SchedulerCore {
    workflow: WorkflowContext,
    pool: SubProcPool,
    events: TaskEventsManager,
    xtriggers: XtriggerManager,
    tasks: BTreeMap<String, TaskProxy>,
    ledger: Arc<OutputLedger>,
    runners: BTreeMap<String, Arc<dyn JobRunnerHandler>>,
    job_tx: mpsc::UnboundedSender<JobEvent>,
    job_rx: mpsc::UnboundedReceiver<JobEvent>,
    stopping: bool,
}

impl std::fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("workflow", &self.workflow.name)
            .field("tasks", &self.tasks.len())
            .field("pool", &self.pool)
            .field("stopping", &self.stopping)
            .finish_non_exhaustive()
    }
}

impl SchedulerCore {
    /// Build the task table and managers from a validated config.
    pub fn new(cfg: &ConfigFile, workflow: WorkflowContext, collab: Collaborators) -> Result<Self> {
        let ledger = Arc::new(OutputLedger::new(collab.spawner.clone()));
        let collab = Collaborators {
            spawner: ledger.clone(),
            ..collab
        };

        let platforms: BTreeMap<String, Platform> = cfg
            .platforms
            .iter()
            .map(|(name, conf)| (name.clone(), Platform::new(name, conf.clone())))
            .collect();
        let mut runners = BTreeMap::new();
        for platform in platforms.values() {
            let runner = job_runner::get_runner(&platform.config.job_runner).ok_or_else(|| {
                CyclexecError::ConfigError(format!(
                    "platform '{}': unknown job runner '{}'",
                    platform.name, platform.config.job_runner
                ))
            })?;
            runners.insert(platform.name.clone(), runner);
        }

        let pool = SubProcPool::new(
            PoolOptions {
                size: cfg.scheduler.process_pool_size,
                timeout: cfg.scheduler.process_pool_timeout,
            },
            collab.hosts.clone(),
        );

        let xtrigger_dirs = if cfg.workflow.xtrigger_dirs.is_empty() {
            vec![workflow.run_dir.join("lib").join("xtriggers")]
        } else {
            cfg.workflow.xtrigger_dirs.clone()
        };
        let mut xtriggers = XtriggerManager::new(workflow.clone(), xtrigger_dirs, collab.clone())
        .with_debug(tracing::enabled!(tracing::Level::DEBUG));
        for (label, decl) in &cfg.xtriggers {
            let spec = XtriggerSpec::parse(decl).map_err(|reason| CyclexecError::XtriggerError {
                label: label.clone(),
                reason,
            })?;
            xtriggers.add_trig(label, spec)?;
        }

        let events = TaskEventsManager::new(
            workflow.clone(),
            EventsSettings {
                mail: cfg.scheduler.mail.clone(),
                task_events: cfg.task_events.clone(),
            },
            platforms.clone(),
            BadHosts::new(),
            collab,
        );

        let mut tasks = BTreeMap::new();
        for (name, tconf) in &cfg.tasks {
            let platform_name = tconf.effective_platform();
            let platform = platforms
                .get(platform_name)
                .cloned()
                .ok_or_else(|| CyclexecError::PlatformLookup(platform_name.to_string()))?;
            for point in tconf.effective_points() {
                let itask = TaskProxy::new(&workflow.name, point, name, tconf.clone(), platform.clone());
                tasks.insert(itask.identity(), itask);
            }
        }
        info!(workflow = %workflow.name, tasks = tasks.len(), "scheduler core ready");

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        Ok(Self {
            workflow,
            pool,
            events,
            xtriggers,
            tasks,
            ledger,
            runners,
            job_tx,
            job_rx,
            stopping: false,
        })
    }

    pub fn workflow(&self) -> &WorkflowContext {
        &self.workflow
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskProxy> {
        self.tasks.values()
    }

    pub fn task(&self, id: &str) -> Option<&TaskProxy> {
        self.tasks.get(id)
    }

    pub fn events(&self) -> &TaskEventsManager {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut TaskEventsManager {
        &mut self.events
    }

    pub fn xtriggers(&self) -> &XtriggerManager {
        &self.xtriggers
    }

    pub fn pool(&self) -> &SubProcPool {
        &self.pool
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Stop submitting; let active jobs finish and flush handlers.
    pub fn request_stop(&mut self) {
        if self.stopping {
            return;
        }
        info!("stop requested; no further jobs will be submitted");
        self.stopping = true;
        self.pool.set_stopping();
        self.events.set_stopping(true);
    }

    /// Kill everything in flight. Called once the loop has exited.
    pub fn shutdown(&mut self) {
        self.pool.drain_and_terminate();
        self.drain_job_outcomes(wallclock::now());
        self.events.drain_outcomes();
    }

    /// Deliver a message reported by (or on behalf of) a job.
    pub fn handle_message(&mut self, point: &str, name: &str, msg: &TaskMessage) -> MessageOutcome {
        self.handle_message_at(point, name, msg, wallclock::now())
    }

    pub fn handle_message_at(
        &mut self,
        point: &str,
        name: &str,
        msg: &TaskMessage,
        now: f64,
    ) -> MessageOutcome {
        let id = format!("{point}/{name}");
        let Some(itask) = self.tasks.get_mut(&id) else {
            warn!(task = %id, message = %msg.message, "message for unknown task ignored");
            return MessageOutcome::Ignored;
        };
        let outcome = self.events.process_message_at(itask, msg, now);
        if outcome == MessageOutcome::PollRequired {
            self.poll_job(&id);
        }
        outcome
    }

    pub fn tick(&mut self) -> TickReport {
        self.tick_at(wallclock::now())
    }

    /// One main-loop iteration.
    pub fn tick_at(&mut self, now: f64) -> TickReport {
        self.pool.advance_at(now);
        self.drain_job_outcomes(now);

        self.xtriggers
            .check_xtriggers_at(self.tasks.values_mut(), &mut self.pool, now);
        self.xtriggers.housekeep();

        let submitted = if self.stopping {
            0
        } else {
            self.submit_ready(now)
        };

        let mut poll_due = Vec::new();
        for itask in self.tasks.values_mut() {
            if self.events.check_job_time(itask, now) {
                debug!(task = %itask, "job health check due");
                poll_due.push(itask.identity());
            }
        }
        for id in &poll_due {
            self.poll_job(id);
        }

        // Nothing more will happen: send held mail now.
        if self.tasks.values().all(|t| t.status().is_final()) {
            self.events.set_stopping(true);
        }
        self.events.process_events_at(&mut self.pool, now);

        let idle = !self.pool.is_not_done() && self.events.timers().is_empty();
        let any_busy = self
            .tasks
            .values()
            .any(|t| matches!(t.status(), TaskStatus::Preparing) || t.status().is_active());
        let all_final = self.tasks.values().all(|t| t.status().is_final());
        let stalled = idle && !any_busy && !all_final && self.is_stalled();
        let done = idle && !any_busy && (all_final || self.stopping || stalled);

        TickReport {
            submitted,
            done,
            stalled,
        }
    }

    fn prerequisites_met(&self, itask: &TaskProxy) -> bool {
        itask
            .rtconfig
            .prerequisites()
            .iter()
            .all(|(dep, output)| self.ledger.is_completed(&itask.point, dep, output))
    }

    /// A waiting task is blocked for good when some prerequisite's task
    /// finished without producing the required output.
    fn is_stalled(&self) -> bool {
        let waiting: Vec<&TaskProxy> = self
            .tasks
            .values()
            .filter(|t| t.status() == TaskStatus::Waiting)
            .collect();
        !waiting.is_empty()
            && waiting.iter().all(|itask| {
                itask.rtconfig.prerequisites().iter().any(|(dep, output)| {
                    let dep_id = format!("{}/{dep}", itask.point);
                    self.tasks.get(&dep_id).is_some_and(|d| {
                        d.status().is_final() && !self.ledger.is_completed(&itask.point, dep, output)
                    })
                })
            })
    }

    fn submit_ready(&mut self, now: f64) -> usize {
        let ready: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.is_ready_to_run() && self.prerequisites_met(t))
            .map(TaskProxy::identity)
            .collect();
        for id in &ready {
            self.submit_task(id, now);
        }
        ready.len()
    }

    fn submit_task(&mut self, id: &str, now: f64) {
        let job_log_root = self.workflow.job_log_dir();
        let Some(itask) = self.tasks.get_mut(id) else {
            return;
        };
        let Some(runner) = self.runners.get(&itask.platform.name).cloned() else {
            error!(task = %itask, platform = %itask.platform.name, "no job runner for platform");
            return;
        };

        for label in std::mem::take(&mut itask.retry_xtriggers).into_keys() {
            itask.state.xtriggers.remove(&label);
        }
        itask.submit_num += 1;
        itask.summary.job_id = None;
        itask.summary.job_runner_name = Some(runner.name().to_string());
        itask.state_reset(TaskStatus::Preparing);

        let dir = job_dir(&job_log_root, &itask.point, &itask.name, itask.submit_num);
        let job_file = dir.join("job");
        let script = job_script(&self.workflow, itask, &dir, &job_file, &self.events);
        if let Err(err) = script.write(runner.as_ref(), &job_file) {
            error!(task = %itask, error = %err, path = %job_file.display(), "cannot write job script");
            let msg = internal(TASK_OUTPUT_SUBMIT_FAILED, now, itask.submit_num);
            self.events.process_message_at(itask, &msg, now);
            return;
        }

        let ctx = CommandContext::new(JOBS_SUBMIT, runner.submit_command(&job_file));
        info!(task = %itask, job = %job_file.display(), "submitting job");
        let done_tx = self.job_tx.clone();
        let launch_tx = self.job_tx.clone();
        let done_id = id.to_string();
        let launch_id = id.to_string();
        let submit_num = itask.submit_num;
        self.pool.enqueue(
            ctx,
            Callbacks::new(move |ctx| {
                let _ = done_tx.send(JobEvent::Finished {
                    id: done_id,
                    submit_num,
                    ctx: ctx.clone(),
                });
            })
            .on_launch(move |pid| {
                let _ = launch_tx.send(JobEvent::Launched {
                    id: launch_id,
                    submit_num,
                    pid,
                });
            }),
        );
    }

    /// Ask the job runner whether the task's last job still exists. The
    /// answer is only logged; state changes come from the job itself.
    fn poll_job(&mut self, id: &str) {
        let Some(itask) = self.tasks.get(id) else {
            return;
        };
        let Some(job_id) = itask.summary.job_id.clone() else {
            info!(task = %itask, "poll requested but no job id known yet");
            return;
        };
        let Some(runner) = self.runners.get(&itask.platform.name) else {
            return;
        };
        let ctx = CommandContext::new(JOBS_POLL, runner.poll_command(std::slice::from_ref(&job_id)));
        info!(task = %itask, job_id = %job_id, "polling job");
        let task = id.to_string();
        self.pool.enqueue(
            ctx,
            Callbacks::new(move |ctx| {
                if ctx.out.lines().any(|l| l.trim() == job_id) {
                    info!(task = %task, job_id = %job_id, "job still present");
                } else {
                    info!(task = %task, job_id = %job_id, "job gone");
                }
            }),
        );
    }

    /// Turn job command progress into task messages.
    fn drain_job_outcomes(&mut self, now: f64) {
        while let Ok(event) = self.job_rx.try_recv() {
            let (id, submit_num) = match &event {
                JobEvent::Launched { id, submit_num, .. }
                | JobEvent::Finished { id, submit_num, .. } => (id.clone(), *submit_num),
            };
            let Some(itask) = self.tasks.get_mut(&id) else {
                continue;
            };
            if itask.submit_num != submit_num {
                debug!(task = %itask, submit_num, "outcome for an old submit ignored");
                continue;
            }
            let ctx = match event {
                JobEvent::Launched { pid, .. } => {
                    // The background job id is the pid of the job script.
                    itask.summary.job_id = Some(pid.to_string());
                    self.events.process_message_at(
                        itask,
                        &internal(TASK_OUTPUT_SUBMITTED, now, submit_num),
                        now,
                    );
                    continue;
                }
                JobEvent::Finished { ctx, .. } => ctx,
            };
            let launched = ctx.pid.is_some() && ctx.ret_code != Some(RET_CODE_WORKFLOW_STOPPING);
            if !launched {
                warn!(task = %itask, "job submission failed\n{ctx}");
                self.events
                    .process_message_at(itask, &internal(TASK_OUTPUT_SUBMIT_FAILED, now, submit_num), now);
                continue;
            }

            let runner = self.runners.get(&itask.platform.name);
            let job_id = runner
                .and_then(|r| {
                    let (out, _) = r.filter_submit_output(&ctx.out, &ctx.err);
                    r.job_id_from_submit_output(&out)
                })
                .or_else(|| ctx.pid.map(|p| p.to_string()));
            itask.summary.job_id = job_id;

            self.events
                .process_message_at(itask, &internal(TASK_OUTPUT_STARTED, now, submit_num), now);
            let last = if ctx.succeeded() {
                TASK_OUTPUT_SUCCEEDED
            } else {
                debug!(task = %itask, ret_code = ?ctx.ret_code, "job exited non-zero");
                TASK_OUTPUT_FAILED
            };
            self.events
                .process_message_at(itask, &internal(last, now, submit_num), now);
        }
    }
}

fn internal(message: &str, now: f64, submit_num: u32) -> TaskMessage {
    TaskMessage::new(message)
        .flag(MessageFlag::Internal)
        .event_time(wallclock::time_string(now))
        .submit_num(submit_num)
}

fn job_script(
    workflow: &WorkflowContext,
    itask: &TaskProxy,
    dir: &Path,
    job_file: &Path,
    events: &TaskEventsManager,
) -> JobScript {
    let mut env = itask.rtconfig.env.clone();
    env.extend(events.overrides(itask).environment);
    JobScript {
        conf: JobConf {
            task_id: itask.identity(),
            job_file_path: job_file.display().to_string(),
            execution_time_limit: itask.summary.execution_time_limit,
            directives: BTreeMap::new(),
        },
        workflow: workflow.name.clone(),
        submit_num: itask.submit_num,
        try_num: itask.try_num(),
        run_dir: workflow.run_dir.display().to_string(),
        job_log_dir: dir.display().to_string(),
        env,
        script: itask.rtconfig.script.clone(),
    }
}
