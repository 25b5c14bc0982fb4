// tests/engine_run.rs

mod common;
use crate::common::builders::{ConfigFileBuilder, TaskConfigBuilder};
use crate::common::recorders::RecordingSpawner;
use crate::common::{TestResult, init_tracing, with_timeout};

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use cyclexec::collab::{Collaborators, WorkflowContext};
use cyclexec::config::ConfigFile;
use cyclexec::engine::{RunSummary, Runtime, RuntimeEvent, RuntimeOptions, SchedulerCore, TickReport};
use cyclexec::task::{MessageOutcome, TaskMessage, TaskStatus};
use cyclexec::wallclock;

fn build_core(cfg: &ConfigFile, run_dir: &Path, collab: Collaborators) -> SchedulerCore {
    SchedulerCore::new(cfg, WorkflowContext::new("test-flow", run_dir), collab)
        .expect("scheduler core")
}

/// Tick on the real clock until done or `secs` pass.
fn drive(core: &mut SchedulerCore, secs: f64) -> TickReport {
    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    loop {
        let report = core.tick_at(wallclock::now());
        if report.done || Instant::now() >= deadline {
            return report;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn status(core: &SchedulerCore, id: &str) -> Option<TaskStatus> {
    core.task(id).map(|t| t.status())
}

#[test]
fn chain_runs_to_completion() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("echo hello from $CYCLEXEC_TASK_ID").build())
        .with_task(
            "b",
            TaskConfigBuilder::new("echo $GREETING > \"$CYCLEXEC_WORKFLOW_RUN_DIR/b.txt\"")
                .after("a")
                .env("GREETING", "hi there")
                .build(),
        )
        .build();
    let spawner = Arc::new(RecordingSpawner::new());
    let collab = Collaborators {
        spawner: spawner.clone(),
        ..Collaborators::default()
    };
    let mut core = build_core(&cfg, tmp.path(), collab);

    let report = drive(&mut core, 10.0);

    assert!(report.done);
    assert!(!report.stalled);
    assert_eq!(status(&core, "1/a"), Some(TaskStatus::Succeeded));
    assert_eq!(status(&core, "1/b"), Some(TaskStatus::Succeeded));

    let a = core.task("1/a").ok_or("no 1/a")?;
    assert_eq!(a.submit_num, 1);
    assert!(a.summary.job_id.is_some());
    assert_eq!(a.summary.job_runner_name.as_deref(), Some("background"));

    let job_out = tmp.path().join("log/job/1/a/01/job.out");
    assert_eq!(fs::read_to_string(job_out)?.trim(), "hello from 1/a");
    assert_eq!(fs::read_to_string(tmp.path().join("b.txt"))?.trim(), "hi there");

    let outputs = spawner.outputs();
    let a_done = outputs
        .iter()
        .position(|o| *o == ("1/a".to_string(), "succeeded".to_string()))
        .ok_or("1/a never succeeded")?;
    let b_started = outputs
        .iter()
        .position(|o| *o == ("1/b".to_string(), "started".to_string()))
        .ok_or("1/b never started")?;
    assert!(a_done < b_started);
    Ok(())
}

#[test]
fn failed_job_is_retried() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task(
            "a",
            TaskConfigBuilder::new("[ \"$CYCLEXEC_TASK_TRY_NUMBER\" -gt 1 ] || exit 1")
                .execution_retry_delays(&[0.0, 0.0])
                .build(),
        )
        .build();
    let mut core = build_core(&cfg, tmp.path(), Collaborators::default());

    let report = drive(&mut core, 10.0);

    assert!(report.done);
    let a = core.task("1/a").ok_or("no 1/a")?;
    assert_eq!(a.status(), TaskStatus::Succeeded);
    assert_eq!(a.submit_num, 2);
    assert!(a.retry_xtriggers.is_empty());
    assert!(tmp.path().join("log/job/1/a/01/job").exists());
    assert!(tmp.path().join("log/job/1/a/02/job").exists());
    Ok(())
}

#[test]
fn failed_dependency_stalls_the_workflow() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("exit 3").build())
        .with_task("b", TaskConfigBuilder::new("true").after("a").build())
        .build();
    let mut core = build_core(&cfg, tmp.path(), Collaborators::default());

    let report = drive(&mut core, 10.0);

    assert!(report.done);
    assert!(report.stalled);
    assert_eq!(status(&core, "1/a"), Some(TaskStatus::Failed));
    assert_eq!(status(&core, "1/b"), Some(TaskStatus::Waiting));
    Ok(())
}

#[test]
fn failure_path_dependency_runs_after_failure() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("exit 1").build())
        .with_task("recover", TaskConfigBuilder::new("true").after("a:failed").build())
        .build();
    let mut core = build_core(&cfg, tmp.path(), Collaborators::default());

    let report = drive(&mut core, 10.0);

    assert!(report.done);
    assert!(!report.stalled);
    assert_eq!(status(&core, "1/recover"), Some(TaskStatus::Succeeded));
    Ok(())
}

#[test]
fn xtrigger_gates_submission_and_broadcasts_results() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let lib = tmp.path().join("lib");
    fs::create_dir_all(&lib)?;
    let func = lib.join("ready");
    fs::write(&func, "#!/bin/sh\necho '[true, {\"file\": \"data.nc\"}]'\n")?;
    fs::set_permissions(&func, fs::Permissions::from_mode(0o755))?;

    let cfg = ConfigFileBuilder::new()
        .xtrigger_dir(&lib)
        .with_xtrigger("up", "ready(%(point)s):1s")
        .with_task(
            "a",
            TaskConfigBuilder::new("echo $up_file > \"$CYCLEXEC_WORKFLOW_RUN_DIR/a.txt\"")
                .xtrigger("up")
                .build(),
        )
        .build();
    let mut core = build_core(&cfg, tmp.path(), Collaborators::default());

    let first = core.tick_at(wallclock::now());
    assert_eq!(first.submitted, 0, "xtrigger not yet satisfied");

    let report = drive(&mut core, 10.0);

    assert!(report.done);
    assert_eq!(status(&core, "1/a"), Some(TaskStatus::Succeeded));
    assert_eq!(fs::read_to_string(tmp.path().join("a.txt"))?.trim(), "data.nc");
    Ok(())
}

#[test]
fn missing_xtrigger_function_fails_core_setup() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .xtrigger_dir(tmp.path())
        .with_xtrigger("up", "absent()")
        .with_task("a", TaskConfigBuilder::new("true").xtrigger("up").build())
        .build();

    let result = SchedulerCore::new(
        &cfg,
        WorkflowContext::new("test-flow", tmp.path()),
        Collaborators::default(),
    );

    assert!(result.is_err());
    Ok(())
}

#[test]
fn backward_message_queues_a_job_poll() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("true").build())
        .build();
    let mut core = build_core(&cfg, tmp.path(), Collaborators::default());
    assert!(drive(&mut core, 10.0).done);
    assert_eq!(core.pool().queued_len(), 0);

    let late = TaskMessage::new("failed").submit_num(1);
    let outcome = core.handle_message("1", "a", &late);

    assert_eq!(outcome, MessageOutcome::PollRequired);
    assert_eq!(core.pool().queued_len(), 1);
    assert_eq!(status(&core, "1/a"), Some(TaskStatus::Succeeded));
    Ok(())
}

#[test]
fn due_health_poll_queues_a_job_poll() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task(
            "a",
            TaskConfigBuilder::new("sleep 30")
                .submission_polling_intervals(&[60.0])
                .build(),
        )
        .build();
    let mut core = build_core(&cfg, tmp.path(), Collaborators::default());
    let t0 = wallclock::now();

    // Submit, then launch.
    core.tick_at(t0);
    core.tick_at(t0);
    let a = core.task("1/a").ok_or("no 1/a")?;
    assert_eq!(a.status(), TaskStatus::Submitted);
    assert!(a.summary.job_id.is_some());
    assert_eq!(core.pool().queued_len(), 0);

    core.tick_at(t0 + 30.0);
    assert_eq!(core.pool().queued_len(), 0, "poll not yet due");

    core.tick_at(t0 + 61.0);
    assert_eq!(core.pool().queued_len(), 1);

    core.shutdown();
    Ok(())
}

#[test]
fn stop_request_prevents_new_submissions() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("true").build())
        .build();
    let mut core = build_core(&cfg, tmp.path(), Collaborators::default());

    core.request_stop();
    let report = core.tick_at(wallclock::now());

    assert_eq!(report.submitted, 0);
    assert!(report.done);
    assert_eq!(status(&core, "1/a"), Some(TaskStatus::Waiting));
    Ok(())
}

#[tokio::test]
async fn runtime_completes_workflow() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("true").points(&["1", "2"]).build())
        .build();
    let core = build_core(&cfg, tmp.path(), Collaborators::default());
    let (_tx, rx) = mpsc::channel(8);
    let runtime = Runtime::new(core, rx, RuntimeOptions { main_loop_interval: 0.05 });

    let summary = with_timeout(runtime.run()).await?;

    assert_eq!(summary, RunSummary::Completed);
    assert!(tmp.path().join("log/job/2/a/01/job.out").exists());
    Ok(())
}

#[tokio::test]
async fn runtime_shutdown_request_exits() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let cfg = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("sleep 30").build())
        .build();
    let core = build_core(&cfg, tmp.path(), Collaborators::default());
    let (tx, rx) = mpsc::channel(8);
    let runtime = Runtime::new(core, rx, RuntimeOptions { main_loop_interval: 0.05 });

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(RuntimeEvent::ShutdownRequested).await
    };

    let (summary, sent) = with_timeout(async { tokio::join!(runtime.run(), stopper) }).await;
    sent?;
    assert_eq!(summary?, RunSummary::Stopped);
    Ok(())
}
