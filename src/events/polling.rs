// src/events/polling.rs

//! Job health timers: poll schedule plus submission/execution timeout.

use tracing::{info, warn};

use crate::events::manager::TaskEventsManager;
use crate::events::{EVENT_EXECUTION_TIMEOUT, EVENT_SUBMISSION_TIMEOUT};
use crate::task::{TaskProxy, TaskStatus};
use crate::timer::RetryTimer;
use crate::wallclock;

impl TaskEventsManager {
    pub fn reset_job_timers(&self, itask: &mut TaskProxy) {
        self.reset_job_timers_at(itask, wallclock::now());
    }

    /// (Re)build the poll schedule and timeout for the task's current
    /// submit and status. Inactive tasks lose both.
    pub fn reset_job_timers_at(&self, itask: &mut TaskProxy, now: f64) {
        let status = itask.status();
        if !status.is_active() {
            itask.timeout = None;
            itask.poll_timer = None;
            return;
        }
        let ctx = (itask.submit_num, status);
        if itask.poll_timer.as_ref().is_some_and(|t| *t.ctx() == ctx) {
            return;
        }
        let overrides = self.overrides(itask);

        let (timeref, timeout_key, timeout, delays) = if status == TaskStatus::Running {
            let mut delays = overrides
                .execution_polling_intervals
                .clone()
                .or_else(|| itask.rtconfig.execution_polling_intervals.clone())
                .unwrap_or_else(|| itask.platform.config.execution_polling_intervals.clone());
            let time_limit = overrides
                .execution_time_limit
                .or(itask.summary.execution_time_limit);
            if let Some(limit) = time_limit {
                delays = fit_to_time_limit(
                    delays,
                    limit,
                    &itask.platform.config.execution_time_limit_polling_intervals,
                );
            }
            (
                itask.summary.started_time,
                EVENT_EXECUTION_TIMEOUT,
                self.events_conf(itask, |c| c.execution_timeout),
                delays,
            )
        } else {
            let delays = overrides
                .submission_polling_intervals
                .clone()
                .or_else(|| itask.rtconfig.submission_polling_intervals.clone())
                .unwrap_or_else(|| itask.platform.config.submission_polling_intervals.clone());
            (
                itask.summary.submitted_time,
                EVENT_SUBMISSION_TIMEOUT,
                self.events_conf(itask, |c| c.submission_timeout),
                delays,
            )
        };

        itask.timeout = match (timeref, timeout) {
            (Some(t), Some(d)) => Some(t + d),
            _ => None,
        };
        let timeout_str = timeout
            .map(wallclock::interval_as_str)
            .unwrap_or_else(|| "None".to_string());
        let mut message = format!("health: {timeout_key}={timeout_str}");
        if !delays.is_empty() {
            message.push_str(", polling intervals=");
            message.push_str(&group_delays(&delays));
            message.push_str("...");
        }
        info!(task = %itask, "{message}");

        let mut timer = RetryTimer::new(ctx, delays);
        timer.next_at(now, true);
        itask.poll_timer = Some(timer);
    }

    /// Advance the poll timer if its delay is done.
    ///
    /// `None` when there is no live schedule (it is cleared), `Some(false)`
    /// when not yet due, `Some(true)` when a poll is due now.
    pub fn check_poll_time(itask: &mut TaskProxy, now: f64) -> Option<bool> {
        let ctx = (itask.submit_num, itask.status());
        let live = itask.status().is_active()
            && itask.poll_timer.as_ref().is_some_and(|t| *t.ctx() == ctx);
        if !live {
            itask.timeout = None;
            itask.poll_timer = None;
            return None;
        }
        let timer = itask.poll_timer.as_mut()?;
        if !timer.is_delay_done_at(now) {
            return Some(false);
        }
        timer.next_at(now, true);
        Some(true)
    }

    /// Fire the one-shot timeout event if it has passed.
    ///
    /// Returns `true` when a poll is due or a timeout fired.
    pub fn check_job_time(&mut self, itask: &mut TaskProxy, now: f64) -> bool {
        let can_poll = Self::check_poll_time(itask, now).unwrap_or(false);
        let Some(timeout) = itask.timeout else {
            return can_poll;
        };
        if now <= timeout {
            return can_poll;
        }
        let (event, timeref) = match itask.status() {
            TaskStatus::Running => (EVENT_EXECUTION_TIMEOUT, itask.summary.started_time),
            TaskStatus::Submitted => (EVENT_SUBMISSION_TIMEOUT, itask.summary.submitted_time),
            _ => {
                itask.timeout = None;
                return can_poll;
            }
        };
        let msg = match timeref {
            Some(t) => format!("{event} after {}", wallclock::interval_as_str(timeout - t)),
            None => event.to_string(),
        };
        itask.timeout = None;
        warn!(task = %itask, "{msg}");
        self.setup_event_handlers(itask, event, &msg);
        true
    }
}

/// Trim or pad `delays` so polling lines up with the time limit, then
/// append the post-limit intervals.
pub(crate) fn fit_to_time_limit(mut delays: Vec<f64>, limit: f64, after_limit: &[f64]) -> Vec<f64> {
    let limit = limit.max(0.0);
    let sum = |d: &[f64]| d.iter().sum::<f64>();
    if sum(&delays) > limit {
        while !delays.is_empty() && sum(&delays) > limit {
            delays.pop();
        }
    } else if let Some(&last) = delays.last() {
        if last > 0.0 {
            let size = ((limit - sum(&delays)) / last) as usize;
            delays.extend(std::iter::repeat_n(last, size));
        }
    }
    let mut tail = after_limit.to_vec();
    if let Some(first) = tail.first_mut() {
        *first += limit - sum(&delays);
    }
    delays.extend(tail);
    delays
}

/// `3*PT1M,PT5M,` style grouping of consecutive equal delays.
pub(crate) fn group_delays(delays: &[f64]) -> String {
    let mut groups: Vec<(usize, f64)> = Vec::new();
    for &delay in delays {
        match groups.last_mut() {
            Some((n, d)) if *d == delay => *n += 1,
            _ => groups.push((1, delay)),
        }
    }
    groups
        .into_iter()
        .map(|(n, d)| {
            if n > 1 {
                format!("{n}*{},", wallclock::interval_as_str(d))
            } else {
                format!("{},", wallclock::interval_as_str(d))
            }
        })
        .collect()
}
