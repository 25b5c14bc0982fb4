// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - TOML-backed data model (`model.rs`) with duration parsing (`duration.rs`).
//! - Loading from disk (`loader.rs`).
//! - Semantic validation (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, resolve_run_dir};
pub use model::{
    ConfigFile, EventsConfig, MailSection, PlatformConfig, RawConfigFile, RemoteConfig,
    SchedulerSection, TaskConfig, WorkflowSection,
};
