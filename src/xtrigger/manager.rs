// src/xtrigger/manager.rs

//! Evaluation of external triggers.
//!
//! Calls are deduplicated by signature: tasks whose rendered triggers share
//! a signature are satisfied by one function call. Satisfied results are
//! cached until no current task uses the signature any more.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collab::{Collaborators, WorkflowContext};
use crate::config::duration::parse_duration;
use crate::errors::{CyclexecError, Result};
use crate::subproc::context::XTRIGGER_FUNC;
use crate::subproc::{Callbacks, CommandContext, CommandLine, SubProcPool};
use crate::task::TaskProxy;
use crate::wallclock;
use crate::xtrigger::spec::{ARG_TEMPLATE_KEYS, XtriggerSpec};

/// Finished xtrigger function call, sent from the pool callback.
#[derive(Debug, Clone)]
pub struct XtriggerResult {
    pub label: String,
    pub signature: String,
    pub ctx: CommandContext,
}

pub struct XtriggerManager {
    workflow: WorkflowContext,
    function_dirs: Vec<PathBuf>,
    collab: Collaborators,
    debug: bool,
    /// Declared triggers by label.
    functx_map: BTreeMap<String, XtriggerSpec>,
    /// When each signature may next be called.
    t_next_call: HashMap<String, f64>,
    /// Satisfied results by signature.
    sat_xtrig: BTreeMap<String, Map<String, Value>>,
    /// Signatures with a call in flight.
    active: HashSet<String>,
    /// Signatures used by the current task set.
    all_xtrig: HashSet<String>,
    pflag: bool,
    result_tx: mpsc::UnboundedSender<XtriggerResult>,
    result_rx: mpsc::UnboundedReceiver<XtriggerResult>,
}

impl std::fmt::Debug for XtriggerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtriggerManager")
            .field("labels", &self.functx_map.keys().collect::<Vec<_>>())
            .field("satisfied", &self.sat_xtrig.len())
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl XtriggerManager {
    pub fn new(workflow: WorkflowContext, function_dirs: Vec<PathBuf>, collab: Collaborators) -> Self {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            workflow,
            function_dirs,
            collab,
            debug: false,
            functx_map: BTreeMap::new(),
            t_next_call: HashMap::new(),
            sat_xtrig: BTreeMap::new(),
            active: HashSet::new(),
            all_xtrig: HashSet::new(),
            pflag: false,
            result_tx,
            result_rx,
        }
    }

    /// Value substituted for `%(debug)s`.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Register a trigger after checking its function and argument templates.
    pub fn add_trig(&mut self, label: &str, spec: XtriggerSpec) -> Result<()> {
        let fail = |reason: String| CyclexecError::XtriggerError {
            label: label.to_string(),
            reason,
        };
        if !spec.is_wall_clock() && self.function_path(&spec.func_name).is_none() {
            return Err(fail(format!(
                "function '{}' not found in {:?}",
                spec.func_name, self.function_dirs
            )));
        }
        let keys = spec.template_keys().map_err(|e| fail(e.to_string()))?;
        if let Some(bad) = keys.iter().find(|k| !ARG_TEMPLATE_KEYS.contains(&k.as_str())) {
            return Err(fail(format!("illegal template in arguments: {bad}")));
        }
        debug!(%label, %spec, "xtrigger added");
        self.functx_map.insert(label.to_string(), spec);
        Ok(())
    }

    /// Seed the satisfied cache with a result saved by an earlier run.
    pub fn load_xtrigger_for_restart(&mut self, signature: &str, results: &str) -> Result<()> {
        let value: Value = serde_json::from_str(results).map_err(|e| CyclexecError::XtriggerError {
            label: signature.to_string(),
            reason: format!("bad saved results: {e}"),
        })?;
        let results = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.sat_xtrig.insert(signature.to_string(), results);
        Ok(())
    }

    /// Set when a trigger was newly satisfied; reading clears it.
    pub fn pflag(&mut self) -> bool {
        std::mem::take(&mut self.pflag)
    }

    pub fn is_satisfied(&self, signature: &str) -> bool {
        self.sat_xtrig.contains_key(signature)
    }

    pub fn satisfied_results(&self) -> &BTreeMap<String, Map<String, Value>> {
        &self.sat_xtrig
    }

    pub fn is_active(&self, signature: &str) -> bool {
        self.active.contains(signature)
    }

    fn function_path(&self, func_name: &str) -> Option<PathBuf> {
        self.function_dirs
            .iter()
            .map(|dir| dir.join(func_name))
            .find(|path| is_executable(path))
    }

    /// The trigger `label` of `itask` with its arguments rendered.
    ///
    /// Task-local retry triggers shadow workflow triggers of the same label.
    pub fn get_xtrig_ctx(&self, itask: &TaskProxy, label: &str) -> Result<XtriggerSpec> {
        let spec = itask
            .retry_xtriggers
            .get(label)
            .or_else(|| self.functx_map.get(label))
            .ok_or_else(|| CyclexecError::XtriggerError {
                label: label.to_string(),
                reason: "not defined".to_string(),
            })?;
        let user = self.collab.hosts.user();
        let run_dir = self.workflow.run_dir.display().to_string();
        let share_dir = self.workflow.share_dir().display().to_string();
        let rendered = spec.render(|key| {
            let value = match key {
                "point" => itask.point.clone(),
                "name" => itask.name.clone(),
                "id" => itask.identity(),
                "workflow" => self.workflow.name.clone(),
                "user_name" => user.clone(),
                "workflow_run_dir" => run_dir.clone(),
                "workflow_share_dir" => share_dir.clone(),
                "debug" => self.debug.to_string(),
                _ => return None,
            };
            Some(value)
        })?;
        Ok(rendered)
    }

    pub fn call_xtriggers_async(&mut self, itask: &mut TaskProxy, pool: &mut SubProcPool) {
        self.call_xtriggers_async_at(itask, pool, wallclock::now());
    }

    /// Try to satisfy each unsatisfied trigger of `itask`.
    pub fn call_xtriggers_async_at(&mut self, itask: &mut TaskProxy, pool: &mut SubProcPool, now: f64) {
        let unsatisfied: Vec<String> = itask
            .state
            .xtriggers
            .iter()
            .filter(|(_, sat)| !**sat)
            .map(|(label, _)| label.clone())
            .collect();

        for label in unsatisfied {
            let spec = match self.get_xtrig_ctx(itask, &label) {
                Ok(spec) => spec,
                Err(err) => {
                    error!(task = %itask, error = %err, "cannot evaluate xtrigger");
                    continue;
                }
            };
            let sig = spec.signature();

            if spec.is_wall_clock() {
                if wall_clock_satisfied(&spec, itask.point_seconds, now, &itask.identity()) {
                    info!(task = %itask, %label, %sig, "xtrigger satisfied");
                    itask.state.xtriggers.insert(label, true);
                    self.sat_xtrig.insert(sig, Map::new());
                }
                continue;
            }

            if let Some(results) = self.sat_xtrig.get(&sig) {
                itask.state.xtriggers.insert(label.clone(), true);
                let env: BTreeMap<String, String> = results
                    .iter()
                    .map(|(k, v)| (format!("{label}_{k}"), json_str(v)))
                    .collect();
                if !env.is_empty() {
                    self.collab
                        .broadcasts
                        .put_broadcast(&itask.point, &itask.name, env);
                }
                continue;
            }
            if self.active.contains(&sig) {
                continue;
            }
            if self.t_next_call.get(&sig).is_some_and(|&t| now < t) {
                continue;
            }
            self.t_next_call.insert(sig.clone(), now + spec.interval);
            self.submit(pool, label, sig, &spec);
        }
    }

    fn submit(&mut self, pool: &mut SubProcPool, label: String, sig: String, spec: &XtriggerSpec) {
        let Some(path) = self.function_path(&spec.func_name) else {
            error!(%label, %sig, "xtrigger function not found");
            return;
        };
        let args = Value::Array(spec.args.clone()).to_string();
        let kwargs = Value::Object(spec.kwargs.clone().into_iter().collect()).to_string();
        let ctx = CommandContext::new(
            XTRIGGER_FUNC,
            CommandLine::Argv(vec![path.display().to_string(), args, kwargs]),
        );
        debug!(%label, %sig, "calling xtrigger function");
        self.active.insert(sig.clone());

        let tx = self.result_tx.clone();
        pool.enqueue(
            ctx,
            Callbacks::new(move |ctx| {
                let _ = tx.send(XtriggerResult {
                    label,
                    signature: sig,
                    ctx: ctx.clone(),
                });
            }),
        );
    }

    /// Apply every function result received so far.
    pub fn process_results(&mut self) {
        while let Ok(result) = self.result_rx.try_recv() {
            self.callback(result);
        }
    }

    /// Record one function result.
    ///
    /// Output must be JSON `[satisfied, {results}]`; anything else is
    /// logged and the call is retried after its interval.
    pub fn callback(&mut self, result: XtriggerResult) {
        let XtriggerResult { label, signature, ctx } = result;
        debug!("{ctx}");
        self.active.remove(&signature);
        let parsed: std::result::Result<(bool, Value), _> =
            serde_json::from_str(ctx.out.trim());
        let (satisfied, results) = match parsed {
            Ok(v) => v,
            Err(err) => {
                warn!(%label, %signature, error = %err, "malformed xtrigger output ignored");
                return;
            }
        };
        debug!(%signature, %results, "xtrigger returned");
        if satisfied {
            info!(%label, %signature, "xtrigger satisfied");
            self.pflag = true;
            let results = match results {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            self.sat_xtrig.insert(signature, results);
        }
    }

    /// Note every signature used by `tasks`.
    pub fn collate<'a>(&mut self, tasks: impl IntoIterator<Item = &'a TaskProxy>) {
        self.all_xtrig.clear();
        for itask in tasks {
            for label in itask.state.xtriggers.keys() {
                if let Ok(spec) = self.get_xtrig_ctx(itask, label) {
                    self.all_xtrig.insert(spec.signature());
                }
            }
        }
    }

    /// Drop cached results no current task uses.
    pub fn housekeep(&mut self) {
        let before = self.sat_xtrig.len();
        let all = &self.all_xtrig;
        self.sat_xtrig.retain(|sig, _| all.contains(sig));
        self.t_next_call.retain(|sig, _| all.contains(sig));
        if self.sat_xtrig.len() != before {
            debug!(removed = before - self.sat_xtrig.len(), "housekept satisfied xtriggers");
        }
    }

    pub fn check_xtriggers<'a>(
        &mut self,
        tasks: impl IntoIterator<Item = &'a mut TaskProxy>,
        pool: &mut SubProcPool,
    ) {
        self.check_xtriggers_at(tasks, pool, wallclock::now());
    }

    /// Collate, then evaluate triggers of every task that has any.
    pub fn check_xtriggers_at<'a>(
        &mut self,
        tasks: impl IntoIterator<Item = &'a mut TaskProxy>,
        pool: &mut SubProcPool,
        now: f64,
    ) {
        self.process_results();
        let mut tasks: Vec<&mut TaskProxy> = tasks.into_iter().collect();
        self.collate(tasks.iter().map(|t| &**t));
        for itask in tasks.iter_mut() {
            if !itask.state.xtriggers.is_empty() {
                self.call_xtriggers_async_at(itask, pool, now);
            }
        }
    }
}

/// Clock trigger check.
///
/// `trigger_time` (absolute) wins; otherwise the trigger is due `offset`
/// after the cycle point. A point that is not a date-time satisfies it.
fn wall_clock_satisfied(spec: &XtriggerSpec, point_seconds: Option<f64>, now: f64, task: &str) -> bool {
    if let Some(t) = spec.kwargs.get("trigger_time").and_then(Value::as_f64) {
        return now >= t;
    }
    let offset = spec
        .kwargs
        .get("offset")
        .or_else(|| spec.args.first())
        .map(|v| match v {
            Value::String(s) => parse_signed_duration(s),
            other => other.as_f64().ok_or_else(|| format!("bad offset {other}")),
        })
        .transpose();
    let offset = match offset {
        Ok(o) => o.unwrap_or(0.0),
        Err(err) => {
            warn!(%task, error = %err, "bad wall_clock offset; using zero");
            0.0
        }
    };
    match point_seconds {
        Some(p) => now >= p + offset,
        None => {
            warn!(%task, "wall_clock on a non date-time point is always satisfied");
            true
        }
    }
}

fn parse_signed_duration(s: &str) -> std::result::Result<f64, String> {
    let s = s.trim();
    match s.strip_prefix('-') {
        Some(rest) => parse_duration(rest).map(|d| -d),
        None => parse_duration(s.strip_prefix('+').unwrap_or(s)),
    }
}

fn json_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_time_beats_offset() {
        let spec = XtriggerSpec::new("wall_clock").kwarg("trigger_time", 100.0);
        assert!(!wall_clock_satisfied(&spec, Some(0.0), 99.0, "1/a"));
        assert!(wall_clock_satisfied(&spec, Some(0.0), 100.0, "1/a"));
    }

    #[test]
    fn offset_from_point() {
        let spec = XtriggerSpec::new("wall_clock").arg("PT1H");
        assert!(!wall_clock_satisfied(&spec, Some(1000.0), 1000.0, "1/a"));
        assert!(wall_clock_satisfied(&spec, Some(1000.0), 4600.0, "1/a"));

        let negative = XtriggerSpec::new("wall_clock").kwarg("offset", "-PT10S");
        assert!(wall_clock_satisfied(&negative, Some(1000.0), 990.0, "1/a"));
    }

    #[test]
    fn integer_point_is_always_due() {
        let spec = XtriggerSpec::new("wall_clock");
        assert!(wall_clock_satisfied(&spec, None, 0.0, "1/a"));
    }
}
