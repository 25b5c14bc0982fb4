// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{CyclexecError, Result};
use crate::job_runner;
use crate::task::outputs::STANDARD_OUTPUTS;
use crate::xtrigger::spec::{ARG_TEMPLATE_KEYS, XtriggerSpec};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::CyclexecError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_global_config(cfg)?;
    validate_platforms(cfg)?;
    validate_xtriggers(cfg)?;
    validate_task_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn config_error(msg: impl Into<String>) -> CyclexecError {
    CyclexecError::ConfigError(msg.into())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.tasks.is_empty() {
        return Err(config_error(
            "config must contain at least one [tasks.<name>] section",
        ));
    }
    for name in cfg.tasks.keys() {
        if name.is_empty() || name.contains(['/', ' ', ':']) {
            return Err(config_error(format!(
                "invalid task name '{name}' (no '/', ':' or spaces)"
            )));
        }
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.scheduler.process_pool_size == 0 {
        return Err(config_error(
            "[scheduler].process_pool_size must be >= 1 (got 0)",
        ));
    }
    if cfg.scheduler.main_loop_interval <= 0.0 {
        return Err(config_error("[scheduler].main_loop_interval must be > 0"));
    }
    Ok(())
}

fn validate_platforms(cfg: &RawConfigFile) -> Result<()> {
    for (name, platform) in cfg.platforms.iter() {
        if platform.hosts.is_empty() {
            return Err(config_error(format!(
                "platform '{name}' must list at least one host"
            )));
        }
        if job_runner::get_runner(&platform.job_runner).is_none() {
            return Err(config_error(format!(
                "platform '{name}' uses unknown job runner '{}'",
                platform.job_runner
            )));
        }
    }
    for (name, task) in cfg.tasks.iter() {
        let platform = task.effective_platform();
        if platform != "localhost" && !cfg.platforms.contains_key(platform) {
            return Err(CyclexecError::PlatformLookup(format!(
                "task '{name}' uses undefined platform '{platform}'"
            )));
        }
    }
    Ok(())
}

fn validate_xtriggers(cfg: &RawConfigFile) -> Result<()> {
    for (label, decl) in cfg.xtriggers.iter() {
        let spec = XtriggerSpec::parse(decl).map_err(|reason| CyclexecError::XtriggerError {
            label: label.clone(),
            reason,
        })?;
        for key in spec.template_keys()? {
            if !ARG_TEMPLATE_KEYS.contains(&key.as_str()) {
                return Err(CyclexecError::XtriggerError {
                    label: label.clone(),
                    reason: format!("illegal argument template '%({key})s'"),
                });
            }
        }
    }
    for (name, task) in cfg.tasks.iter() {
        for label in task.xtriggers.iter() {
            if !cfg.xtriggers.contains_key(label) {
                return Err(config_error(format!(
                    "task '{name}' references undefined xtrigger '{label}'"
                )));
            }
        }
    }
    Ok(())
}

fn validate_task_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.tasks.iter() {
        for (dep, output) in task.prerequisites() {
            let Some(dep_task) = cfg.tasks.get(&dep) else {
                return Err(config_error(format!(
                    "task '{}' has unknown dependency '{}' in `after`",
                    name, dep
                )));
            };
            if &dep == name {
                return Err(config_error(format!(
                    "task '{}' cannot depend on itself in `after`",
                    name
                )));
            }
            if !STANDARD_OUTPUTS.contains(&output.as_str())
                && !dep_task.outputs.contains_key(&output)
            {
                return Err(config_error(format!(
                    "task '{}' depends on unknown output '{}:{}'",
                    name, dep, output
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.tasks.keys() {
        graph.add_node(name.as_str());
    }

    for (name, task) in cfg.tasks.iter() {
        for entry in task.after.iter() {
            let dep = entry.split_once(':').map(|(d, _)| d).unwrap_or(entry);
            graph.add_edge(dep, name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(CyclexecError::DependencyCycle(format!(
            "cycle detected in task graph involving task '{}'",
            cycle.node_id()
        ))),
    }
}
