// tests/config_validation.rs

mod common;
use crate::common::TestResult;
use crate::common::builders::{ConfigFileBuilder, TaskConfigBuilder};

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use cyclexec::config::{PlatformConfig, load_and_validate, resolve_run_dir};
use cyclexec::errors::CyclexecError;

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn full_config_loads_with_durations() -> TestResult {
    let file = toml_file(
        r#"
[workflow]
name = "demo"

[scheduler]
process_pool_size = 2
process_pool_timeout = "PT5M"

[scheduler.mail]
interval = "1m"

[task_events]
mail_events = ["failed"]
execution_timeout = "PT1H"

[platforms.hpc]
hosts = ["login1", "login2"]
retrieve_job_logs = true
execution_polling_intervals = ["PT1M", 300]

[xtriggers]
upstream = "check_upstream(%(point)s, kind=obs):30s"

[tasks.fetch]
script = "echo fetch"
points = ["20260101T0000Z"]
xtriggers = ["upstream"]
execution_retry_delays = ["PT1M", "5m"]

[tasks.process]
script = "echo process"
points = ["20260101T0000Z"]
platform = "hpc"
after = ["fetch:ready"]
execution_time_limit = "PT10M"

[tasks.fetch.outputs]
ready = "data ready"
"#,
    );

    let cfg = load_and_validate(file.path())?;

    assert_eq!(cfg.workflow.name, "demo");
    assert_eq!(cfg.scheduler.process_pool_size, 2);
    assert_eq!(cfg.scheduler.process_pool_timeout, 300.0);
    assert_eq!(cfg.scheduler.mail.interval, 60.0);
    assert_eq!(cfg.task_events.execution_timeout, Some(3600.0));
    assert_eq!(
        cfg.platforms["hpc"].execution_polling_intervals,
        vec![60.0, 300.0]
    );
    assert!(cfg.platforms.contains_key("localhost"));
    assert_eq!(cfg.tasks["fetch"].execution_retry_delays, vec![60.0, 300.0]);
    assert_eq!(cfg.tasks["process"].execution_time_limit, Some(600.0));
    assert_eq!(
        cfg.tasks["process"].prerequisites(),
        vec![("fetch".to_string(), "ready".to_string())]
    );
    Ok(())
}

#[test]
fn dependency_cycle_returns_structured_error() {
    let file = toml_file(
        r#"
[tasks.A]
script = "echo A"
after = ["B"]

[tasks.B]
script = "echo B"
after = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(CyclexecError::DependencyCycle(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains('A') || msg.contains('B'));
        }
        Err(e) => panic!("Expected DependencyCycle error, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn unknown_dependency_returns_config_error() {
    let result = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("echo A").after("NonExistent").build())
        .try_build();

    match result {
        Err(CyclexecError::ConfigError(msg)) => {
            assert!(msg.contains("unknown dependency"));
            assert!(msg.contains("NonExistent"));
        }
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn unknown_custom_output_is_rejected() {
    let result = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .with_task("B", TaskConfigBuilder::new("echo B").after("A:ready").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::ConfigError(msg)) if msg.contains("A:ready")));
}

#[test]
fn standard_outputs_need_no_declaration() {
    let result = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .with_task("B", TaskConfigBuilder::new("echo B").after("A:failed").build())
        .try_build();

    assert!(result.is_ok());
}

#[test]
fn self_dependency_is_rejected() {
    let result = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("echo A").after("A").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::ConfigError(msg)) if msg.contains("itself")));
}

#[test]
fn undefined_platform_is_a_lookup_error() {
    let result = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("echo A").platform("nowhere").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::PlatformLookup(msg)) if msg.contains("nowhere")));
}

#[test]
fn unknown_job_runner_is_rejected() {
    let platform = PlatformConfig {
        job_runner: "slurmish".to_string(),
        ..PlatformConfig::default()
    };
    let result = ConfigFileBuilder::new()
        .with_platform("hpc", platform)
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::ConfigError(msg)) if msg.contains("slurmish")));
}

#[test]
fn platform_without_hosts_is_rejected() {
    let platform = PlatformConfig {
        hosts: Vec::new(),
        ..PlatformConfig::default()
    };
    let result = ConfigFileBuilder::new()
        .with_platform("hpc", platform)
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::ConfigError(_))));
}

#[test]
fn undefined_xtrigger_label_is_rejected() {
    let result = ConfigFileBuilder::new()
        .with_task("A", TaskConfigBuilder::new("echo A").xtrigger("upstream").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::ConfigError(msg)) if msg.contains("upstream")));
}

#[test]
fn illegal_xtrigger_template_is_rejected() {
    let result = ConfigFileBuilder::new()
        .with_xtrigger("up", "check(%(cycle)s)")
        .with_task("A", TaskConfigBuilder::new("echo A").xtrigger("up").build())
        .try_build();

    match result {
        Err(CyclexecError::XtriggerError { label, reason }) => {
            assert_eq!(label, "up");
            assert!(reason.contains("cycle"));
        }
        Err(e) => panic!("Expected XtriggerError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn malformed_xtrigger_declaration_is_rejected() {
    let result = ConfigFileBuilder::new()
        .with_xtrigger("up", "check(:30s")
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::XtriggerError { .. })));
}

#[test]
fn zero_pool_size_is_rejected() {
    let result = ConfigFileBuilder::new()
        .pool_size(0)
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .try_build();

    assert!(matches!(result, Err(CyclexecError::ConfigError(msg)) if msg.contains("process_pool_size")));
}

#[test]
fn empty_config_is_rejected() {
    assert!(matches!(
        ConfigFileBuilder::new().try_build(),
        Err(CyclexecError::ConfigError(_))
    ));
}

#[test]
fn bad_duration_fails_to_parse() {
    let file = toml_file(
        r#"
[tasks.A]
script = "echo A"
execution_retry_delays = ["soon"]
"#,
    );

    assert!(matches!(
        load_and_validate(file.path()),
        Err(CyclexecError::TomlError(_))
    ));
}

#[test]
fn negative_or_non_finite_duration_strings_are_rejected() {
    for value in ["\"-60\"", "\"NaN\"", "\"inf\"", "-5"] {
        let file = toml_file(&format!(
            r#"
[tasks.A]
script = "echo A"
execution_time_limit = {value}
"#
        ));

        match load_and_validate(file.path()) {
            Err(CyclexecError::TomlError(e)) => {
                assert!(e.to_string().contains("duration"), "unexpected error: {e}");
            }
            Err(e) => panic!("Expected TomlError for {value}, got: {:?}", e),
            Ok(_) => panic!("Expected error for {value}, got Ok"),
        }
    }
}

#[test]
fn run_dir_defaults_next_to_config() -> TestResult {
    let cfg = ConfigFileBuilder::new()
        .name("demo")
        .with_task("A", TaskConfigBuilder::new("echo A").build())
        .try_build()?;

    let run_dir = resolve_run_dir(&cfg, Path::new("/srv/flows/flow.toml"));

    assert_eq!(run_dir, Path::new("/srv/flows/.cyclexec/demo"));
    Ok(())
}
