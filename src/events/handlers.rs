// src/events/handlers.rs

//! Event handler setup and dispatch.
//!
//! `setup_event_handlers` turns one task event into zero or more handler
//! timers (log retrieval, mail, custom commands). `process_events` fires
//! the due ones through the pool; their outcomes come back over a channel
//! and are applied at the start of the next `process_events` call.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use crate::events::activity::{job_dir, log_task_job_activity};
use crate::events::manager::TaskEventsManager;
use crate::events::{
    EVENT_FAILED, EVENT_RETRY, EVENT_SUCCEEDED, EventKey, HANDLER_CUSTOM, HANDLER_JOB_LOGS_RETRIEVE,
    HANDLER_MAIL, HandlerContext,
};
use crate::shell;
use crate::subproc::{Callbacks, CommandContext, CommandLine, StdinSource, SubProcPool};
use crate::task::{RunMode, TaskProxy};
use crate::template::{self, EventTemplateVars, EventVar};
use crate::timer::RetryTimer;
use crate::wallclock;

/// Completed handler command, sent from the pool callback.
#[derive(Debug, Clone)]
pub(crate) enum HandlerOutcome {
    Custom {
        key: EventKey,
        ctx: CommandContext,
    },
    Mail {
        keys: Vec<EventKey>,
        ctx: CommandContext,
    },
    JobLogs {
        keys: Vec<EventKey>,
        ctx: CommandContext,
        unreachable: bool,
    },
}

const NON_UNIQUE_EVENTS: [&str; 3] = ["warning", "critical", "custom"];

impl TaskEventsManager {
    /// Record `event` and set up whichever handlers its configuration asks
    /// for. Nothing fires outside live mode.
    pub fn setup_event_handlers(&mut self, itask: &mut TaskProxy, event: &str, message: &str) {
        if itask.run_mode != RunMode::Live {
            return;
        }
        self.collab.recorder.task_event(itask, event, message);

        let event_id = if NON_UNIQUE_EVENTS.contains(&event) {
            let n = itask.non_unique_events.entry(event.to_string()).or_insert(0);
            *n += 1;
            format!("{event}-{n}")
        } else {
            event.to_string()
        };

        self.setup_job_logs_retrieval(itask, event);
        self.setup_event_mail(itask, &event_id, event, message);
        self.setup_custom_event_handlers(itask, &event_id, event, message);
    }

    fn event_key(&self, itask: &TaskProxy, handler: &str, event_id: &str, message: &str) -> EventKey {
        EventKey {
            handler: handler.to_string(),
            event: event_id.to_string(),
            message: message.to_string(),
            point: itask.point.clone(),
            name: itask.name.clone(),
            submit_num: itask.submit_num,
        }
    }

    fn setup_job_logs_retrieval(&mut self, itask: &TaskProxy, event: &str) {
        if ![EVENT_FAILED, EVENT_RETRY, EVENT_SUCCEEDED].contains(&event) {
            return;
        }
        if !itask.platform.is_remote(self.collab.hosts.as_ref()) {
            return;
        }
        let overrides = self.overrides(itask);
        let remote = &itask.rtconfig.remote;
        let platform = &itask.platform.config;

        let retrieve = overrides
            .remote
            .retrieve_job_logs
            .or(remote.retrieve_job_logs)
            .unwrap_or(platform.retrieve_job_logs);
        if !retrieve {
            return;
        }
        let key = self.event_key(itask, HANDLER_JOB_LOGS_RETRIEVE, event, event);
        if self.timers.contains(&key) {
            return;
        }
        let delays = overrides
            .remote
            .retrieve_job_logs_retry_delays
            .or_else(|| remote.retrieve_job_logs_retry_delays.clone())
            .or_else(|| platform.retrieve_job_logs_retry_delays.clone())
            .unwrap_or_else(|| vec![0.0]);
        let max_size = overrides
            .remote
            .retrieve_job_logs_max_size
            .or_else(|| remote.retrieve_job_logs_max_size.clone())
            .or_else(|| platform.retrieve_job_logs_max_size.clone());

        debug!(task = %itask, %key, "job log retrieval set up");
        self.timers.add(
            key,
            RetryTimer::new(
                HandlerContext::JobLogsRetrieve {
                    platform: itask.platform.name.clone(),
                    max_size,
                },
                delays,
            ),
        );
    }

    fn setup_event_mail(&mut self, itask: &TaskProxy, event_id: &str, event: &str, message: &str) {
        let mail_events = self
            .events_conf(itask, |c| c.mail_events.clone())
            .unwrap_or_default();
        if !mail_events.iter().any(|e| e == event) {
            return;
        }
        let key = self.event_key(itask, HANDLER_MAIL, event_id, message);
        if self.timers.contains(&key) {
            return;
        }
        let mail_from = self
            .events_conf(itask, |c| c.mail_from.clone())
            .or_else(|| self.settings.mail.from.clone())
            .unwrap_or_else(|| format!("notifications@{}", self.collab.hosts.local_host()));
        let mail_to = self
            .events_conf(itask, |c| c.mail_to.clone())
            .or_else(|| self.settings.mail.to.clone())
            .unwrap_or_else(|| self.collab.hosts.user());

        self.timers.add(
            key,
            RetryTimer::new(HandlerContext::Mail { mail_from, mail_to }, vec![0.0]),
        );
    }

    fn setup_custom_event_handlers(
        &mut self,
        itask: &TaskProxy,
        event_id: &str,
        event: &str,
        message: &str,
    ) {
        let handlers = self
            .events_conf(itask, |c| c.event_handlers.get(event).cloned())
            .or_else(|| {
                let handler_events = self
                    .events_conf(itask, |c| c.handler_events.clone())
                    .unwrap_or_default();
                handler_events
                    .iter()
                    .any(|e| e == event)
                    .then(|| self.events_conf(itask, |c| c.handlers.clone()))
                    .flatten()
            })
            .unwrap_or_default();
        if handlers.is_empty() {
            return;
        }
        let delays = self
            .events_conf(itask, |c| c.handler_retry_delays.clone())
            .unwrap_or_else(|| vec![0.0]);
        let vars = self.template_vars(itask, event, message);

        for (i, handler) in handlers.iter().enumerate() {
            let cmd_key = format!("{HANDLER_CUSTOM}-{i:02}");
            let key = self.event_key(itask, &cmd_key, event_id, message);
            if self.timers.contains(&key) {
                continue;
            }
            let cmd = if template::has_placeholders(handler) {
                match vars.render(handler) {
                    Ok(cmd) => cmd,
                    Err(err) => {
                        error!(task = %itask, %event, error = %err, "bad event handler template");
                        continue;
                    }
                }
            } else {
                template::legacy_handler_command(
                    handler,
                    event,
                    &self.workflow.name,
                    &itask.identity(),
                    message,
                )
            };
            debug!(task = %itask, %key, %cmd, "event handler set up");
            self.timers.add(
                key,
                RetryTimer::new(HandlerContext::Custom { key: cmd_key, cmd }, delays.clone()),
            );
        }
    }

    pub(crate) fn template_vars(&self, itask: &TaskProxy, event: &str, message: &str) -> EventTemplateVars {
        let time_or_empty = |t: Option<f64>| t.map(wallclock::time_string).unwrap_or_default();
        let summary = &itask.summary;
        let mut vars = EventTemplateVars::new();
        vars.set(EventVar::Event, event)
            .set(EventVar::Workflow, &self.workflow.name)
            .set(EventVar::Uuid, &self.workflow.uuid)
            .set(EventVar::Point, &itask.point)
            .set(EventVar::SubmitNum, itask.submit_num.to_string())
            .set(EventVar::TryNum, itask.try_num().to_string())
            .set(EventVar::Id, itask.identity())
            .set(EventVar::Message, message)
            .set(
                EventVar::JobRunnerName,
                summary.job_runner_name.as_deref().unwrap_or_default(),
            )
            .set(EventVar::JobId, summary.job_id.as_deref().unwrap_or_default())
            .set(EventVar::SubmitTime, time_or_empty(summary.submitted_time))
            .set(EventVar::StartTime, time_or_empty(summary.started_time))
            .set(EventVar::FinishTime, time_or_empty(summary.finished_time))
            .set(EventVar::PlatformName, &itask.platform.name)
            .set(EventVar::Name, &itask.name)
            .set_task_meta(&itask.rtconfig.meta)
            .set_workflow_meta(&self.workflow.meta);
        vars
    }

    pub fn process_events(&mut self, pool: &mut SubProcPool) {
        self.process_events_at(pool, wallclock::now());
    }

    /// Fire every due handler timer.
    pub fn process_events_at(&mut self, pool: &mut SubProcPool, now: f64) {
        self.drain_outcomes();

        let mut mail_groups: BTreeMap<(String, String), Vec<EventKey>> = BTreeMap::new();
        let mut log_groups: BTreeMap<(String, Option<String>), Vec<EventKey>> = BTreeMap::new();

        let keys: Vec<EventKey> = self.timers.keys().cloned().collect();
        for key in keys {
            let Some(timer) = self.timers.get_mut(&key) else {
                continue;
            };
            if timer.is_waiting() {
                continue;
            }
            if !timer.is_timeout_set() && timer.next_at(now, false).is_none() {
                warn!(%key, "event handler failed; no retries left");
                self.timers.remove(&key);
                continue;
            }
            if !timer.is_delay_done_at(now) {
                continue;
            }
            let ctx = timer.ctx().clone();
            if matches!(ctx, HandlerContext::Mail { .. })
                && !self.stopping
                && self.next_mail_time.is_some_and(|t| t > now)
            {
                continue;
            }
            self.timers.set_waiting(&key);

            match ctx {
                HandlerContext::Custom { key: cmd_key, cmd } => {
                    self.submit_custom_handler(pool, key, cmd_key, cmd);
                }
                HandlerContext::Mail { mail_from, mail_to } => {
                    mail_groups.entry((mail_from, mail_to)).or_default().push(key);
                }
                HandlerContext::JobLogsRetrieve { platform, max_size } => {
                    log_groups.entry((platform, max_size)).or_default().push(key);
                }
            }
        }

        if !mail_groups.is_empty() {
            for ((mail_from, mail_to), keys) in mail_groups {
                self.submit_event_mail(pool, &mail_from, &mail_to, keys);
            }
            self.next_mail_time = Some(now + self.settings.mail.interval);
        }
        for ((platform, max_size), keys) in log_groups {
            self.submit_job_logs_retrieval(pool, &platform, max_size.as_deref(), keys);
        }
    }

    fn submit_custom_handler(
        &self,
        pool: &mut SubProcPool,
        key: EventKey,
        cmd_key: String,
        cmd: String,
    ) {
        info!(%key, %cmd, "running event handler");
        let ctx = CommandContext::new(cmd_key, CommandLine::shell(cmd));
        let tx = self.outcome_tx.clone();
        pool.enqueue(
            ctx,
            Callbacks::new(move |ctx| {
                let _ = tx.send(HandlerOutcome::Custom {
                    key,
                    ctx: ctx.clone(),
                });
            }),
        );
    }

    fn submit_event_mail(
        &self,
        pool: &mut SubProcPool,
        mail_from: &str,
        mail_to: &str,
        mut keys: Vec<EventKey>,
    ) {
        keys.sort();
        let workflow = &self.workflow.name;
        let subject = mail_subject(workflow, &keys);

        let mut body = String::new();
        for key in &keys {
            body.push_str(&format!("{}: {}\n", key.event, key.job_identity()));
        }
        body.push('\n');
        let host = self.collab.hosts.local_host();
        let owner = self.collab.hosts.user();
        for (label, value) in [
            ("workflow", workflow.as_str()),
            ("host", host.as_str()),
            ("owner", owner.as_str()),
        ] {
            if !value.is_empty() {
                body.push_str(&format!("{label}: {value}\n"));
            }
        }
        if let Some(footer) = &self.settings.mail.footer {
            let rendered = template::render(footer, |k| match k {
                "workflow" => Some(workflow.clone()),
                "host" => Some(host.clone()),
                "owner" => Some(owner.clone()),
                "port" => Some(String::new()),
                _ => None,
            });
            match rendered {
                Ok(text) => body.push_str(&format!("{text}\n")),
                Err(err) => warn!(error = %err, "ignoring bad mail footer"),
            }
        }

        let mut ctx = CommandContext::new(
            HANDLER_MAIL,
            CommandLine::argv(["mail", "-s", subject.as_str(), "-r", mail_from, mail_to]),
        )
        .with_stdin(StdinSource::Text(body));
        if let Some(smtp) = &self.settings.mail.smtp {
            ctx = ctx.with_env("smtp", smtp);
        }
        info!(%subject, count = keys.len(), "sending event mail");
        let tx = self.outcome_tx.clone();
        pool.enqueue(
            ctx,
            Callbacks::new(move |ctx| {
                let _ = tx.send(HandlerOutcome::Mail {
                    keys,
                    ctx: ctx.clone(),
                });
            }),
        );
    }

    fn submit_job_logs_retrieval(
        &mut self,
        pool: &mut SubProcPool,
        platform_name: &str,
        max_size: Option<&str>,
        mut keys: Vec<EventKey>,
    ) {
        let Some(platform) = self.platforms.get(platform_name).cloned() else {
            error!(platform = %platform_name, "job log retrieval for unknown platform");
            for key in &keys {
                self.timers.unset_waiting(key);
            }
            return;
        };
        let host = match platform.select_host_or_reset(&self.bad_hosts) {
            Ok(host) => host,
            Err(err) => {
                warn!(error = %err, "job log retrieval postponed");
                for key in &keys {
                    self.timers.unset_waiting(key);
                }
                return;
            }
        };
        keys.sort();

        let mut cmd = shell::split(&platform.config.retrieve_job_logs_command);
        cmd.push(format!("--rsh={}", platform.config.ssh_command));
        if let Some(size) = max_size {
            cmd.push(format!("--max-size={size}"));
        }
        for key in &keys {
            let (point, name) = (&key.point, &key.name);
            let nn = format!("{:02}", key.submit_num);
            for include in [
                format!("/{point}"),
                format!("/{point}/{name}"),
                format!("/{point}/{name}/{nn}"),
                format!("/{point}/{name}/{nn}/**"),
            ] {
                let arg = format!("--include={include}");
                if !cmd.contains(&arg) {
                    cmd.push(arg);
                }
            }
        }
        cmd.push("--exclude=/**".to_string());
        cmd.push(format!("{host}:{}/", self.workflow.remote_job_log_dir()));
        cmd.push(format!("{}/", self.job_log_dir().display()));

        let ctx = CommandContext::new(HANDLER_JOB_LOGS_RETRIEVE, CommandLine::Argv(cmd))
            .with_host(&host)
            .with_remote(platform.remote_tools());
        info!(%host, count = keys.len(), "retrieving job logs");

        let tx = self.outcome_tx.clone();
        let tx_unreachable = self.outcome_tx.clone();
        let keys_unreachable = keys.clone();
        pool.enqueue(
            ctx,
            Callbacks::new(move |ctx| {
                let _ = tx.send(HandlerOutcome::JobLogs {
                    keys,
                    ctx: ctx.clone(),
                    unreachable: false,
                });
            })
            .on_unreachable(move |ctx| {
                let _ = tx_unreachable.send(HandlerOutcome::JobLogs {
                    keys: keys_unreachable,
                    ctx: ctx.clone(),
                    unreachable: true,
                });
                true
            })
            .bad_hosts(self.bad_hosts.clone()),
        );
    }

    /// Apply every handler outcome received since the last call.
    pub(crate) fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            match outcome {
                HandlerOutcome::Custom { key, ctx } => {
                    self.log_activity(&ctx, &key);
                    self.finish_handler(&key, &ctx);
                }
                HandlerOutcome::Mail { keys, ctx } => {
                    for key in &keys {
                        self.log_activity(&ctx, key);
                        self.finish_handler(key, &ctx);
                    }
                }
                HandlerOutcome::JobLogs {
                    keys,
                    ctx,
                    unreachable,
                } => self.job_logs_retrieval_done(keys, &ctx, unreachable),
            }
        }
    }

    fn finish_handler(&mut self, key: &EventKey, ctx: &CommandContext) {
        if ctx.succeeded() {
            debug!(%key, "event handler succeeded");
            self.timers.remove(key);
        } else {
            warn!(%key, ret_code = ?ctx.ret_code, "event handler failed\n{ctx}");
            self.timers.unset_waiting(key);
        }
    }

    fn job_logs_retrieval_done(&mut self, keys: Vec<EventKey>, ctx: &CommandContext, unreachable: bool) {
        for key in &keys {
            self.log_activity(ctx, key);
        }
        if unreachable {
            warn!(host = %ctx.host, "job log retrieval host unreachable; will retry");
            for key in &keys {
                self.timers.reset(key);
            }
            return;
        }
        if !ctx.succeeded() {
            warn!(host = %ctx.host, ret_code = ?ctx.ret_code, "job log retrieval failed");
            for key in &keys {
                self.timers.unset_waiting(key);
            }
            return;
        }
        let job_log_dir = self.job_log_dir();
        for key in &keys {
            let dir = job_dir(&job_log_dir, &key.point, &key.name, key.submit_num);
            let mut wanted = vec!["job.out"];
            if key.event != EVENT_SUCCEEDED {
                wanted.push("job.err");
            }
            let missing: Vec<&str> = wanted
                .into_iter()
                .filter(|f| !dir.join(f).exists())
                .collect();
            if missing.is_empty() {
                self.timers.remove(key);
            } else {
                warn!(%key, ?missing, "job log retrieval incomplete");
                self.timers.unset_waiting(key);
            }
        }
    }

    fn log_activity(&self, ctx: &CommandContext, key: &EventKey) {
        log_task_job_activity(ctx, &self.job_log_dir(), &key.point, &key.name, key.submit_num);
    }
}

/// `[point/name/NN event] workflow` for one key, otherwise a count.
pub(crate) fn mail_subject(workflow: &str, keys: &[EventKey]) -> String {
    match keys {
        [key] => format!("[{} {}] {}", key.job_identity(), key.event, workflow),
        _ => {
            let first = keys.first().map(|k| k.event.as_str()).unwrap_or_default();
            if keys.iter().all(|k| k.event == first) {
                format!("[{} tasks {}] {}", keys.len(), first, workflow)
            } else {
                format!("[{} task events] {}", keys.len(), workflow)
            }
        }
    }
}
