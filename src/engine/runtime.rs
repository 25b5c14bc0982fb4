// src/engine/runtime.rs

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::errors::Result;

use super::core::SchedulerCore;
use super::{RuntimeEvent, RuntimeOptions};

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSummary {
    /// Every task finished.
    Completed,
    /// Stopped on request before every task finished.
    Stopped,
    /// Some tasks can never run.
    Stalled,
}

/// Ticks a [`SchedulerCore`] on a fixed interval and feeds it outside
/// events. All scheduling semantics live in the core.
pub struct Runtime {
    core: SchedulerCore,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    options: RuntimeOptions,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        core: SchedulerCore,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            core,
            event_rx,
            options,
        }
    }

    pub fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// Main loop: tick until the core reports done, or until shutdown.
    pub async fn run(mut self) -> Result<RunSummary> {
        info!(workflow = %self.core.workflow().name, "runtime started");
        let period = Duration::from_secs_f64(self.options.main_loop_interval.max(0.01));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        let summary = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.core.tick();
                    if report.submitted > 0 {
                        debug!(submitted = report.submitted, "jobs submitted");
                    }
                    if report.done {
                        break if report.stalled {
                            warn!("workflow stalled: waiting tasks can never run");
                            RunSummary::Stalled
                        } else if self.core.is_stopping() {
                            RunSummary::Stopped
                        } else {
                            RunSummary::Completed
                        };
                    }
                }
                event = self.event_rx.recv(), if events_open => {
                    match event {
                        Some(RuntimeEvent::TaskMessage { point, name, msg }) => {
                            self.core.handle_message(&point, &name, &msg);
                        }
                        Some(RuntimeEvent::StopRequested) => self.core.request_stop(),
                        Some(RuntimeEvent::ShutdownRequested) => {
                            info!("shutdown requested");
                            break RunSummary::Stopped;
                        }
                        None => {
                            debug!("runtime event channel closed");
                            events_open = false;
                        }
                    }
                }
            }
        };

        self.core.shutdown();
        info!(?summary, "runtime exiting");
        Ok(summary)
    }
}
