// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::platform::NoHostsError;
use crate::template::TemplateError;

#[derive(Error, Debug)]
pub enum CyclexecError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cycle detected in task graph: {0}")]
    DependencyCycle(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("xtrigger '{label}': {reason}")]
    XtriggerError { label: String, reason: String },

    #[error(transparent)]
    TemplateError(#[from] TemplateError),

    #[error(transparent)]
    NoHosts(#[from] NoHostsError),

    #[error("Platform not found: {0}")]
    PlatformLookup(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CyclexecError>;
