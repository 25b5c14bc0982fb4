// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and run validation:
///
/// - at least one task, sane scheduler settings,
/// - known platforms and xtrigger labels, legal xtrigger templates,
/// - known `after` references and an acyclic task graph.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("flow.toml")
}

/// Resolve the run directory: explicit `[workflow].run_dir`, else
/// `.cyclexec/<name>` next to the config file.
pub fn resolve_run_dir(cfg: &ConfigFile, config_path: &Path) -> PathBuf {
    if let Some(dir) = &cfg.workflow.run_dir {
        return dir.clone();
    }
    let base = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    base.join(".cyclexec").join(&cfg.workflow.name)
}
