// tests/task_events.rs

mod common;
use crate::common::builders::{TaskConfigBuilder, handler_events, task_proxy};
use crate::common::recorders::{RecordingRecorder, RecordingSpawner, StaticHosts};
use crate::common::{TestResult, drain_pool, init_tracing};

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use cyclexec::collab::{Collaborators, InMemoryBroadcasts, WorkflowContext};
use cyclexec::config::{EventsConfig, MailSection, PlatformConfig, TaskConfig};
use cyclexec::events::{EventsSettings, HANDLER_JOB_LOGS_RETRIEVE, HANDLER_MAIL, TaskEventsManager};
use cyclexec::platform::{BadHosts, Platform};
use cyclexec::subproc::{PoolOptions, SubProcPool};
use cyclexec::task::{MessageFlag, MessageOutcome, Severity, TaskMessage, TaskProxy, TaskStatus};

const NOW: f64 = 1_800_000_000.0;

struct Harness {
    events: TaskEventsManager,
    recorder: Arc<RecordingRecorder>,
    spawner: Arc<RecordingSpawner>,
    pool: SubProcPool,
}

fn harness(run_dir: &Path, task_events: EventsConfig, hosts: StaticHosts) -> Harness {
    let recorder = Arc::new(RecordingRecorder::new());
    let spawner = Arc::new(RecordingSpawner::new());
    let hosts = Arc::new(hosts);
    let collab = Collaborators {
        recorder: recorder.clone(),
        broadcasts: Arc::new(InMemoryBroadcasts::new()),
        spawner: spawner.clone(),
        hosts: hosts.clone(),
    };
    let mut platforms = BTreeMap::new();
    platforms.insert("localhost".to_string(), Platform::localhost());
    platforms.insert("hpc".to_string(), hpc_platform());
    let settings = EventsSettings {
        mail: MailSection::default(),
        task_events,
    };
    let events = TaskEventsManager::new(
        WorkflowContext::new("test-flow", run_dir),
        settings,
        platforms,
        BadHosts::new(),
        collab,
    );
    let pool = SubProcPool::new(PoolOptions { size: 4, timeout: 30.0 }, hosts);
    Harness {
        events,
        recorder,
        spawner,
        pool,
    }
}

fn hpc_platform() -> Platform {
    Platform::new(
        "hpc",
        PlatformConfig {
            hosts: vec!["hpc1".to_string()],
            retrieve_job_logs: true,
            ..PlatformConfig::default()
        },
    )
}

fn received(message: &str, submit_num: u32) -> TaskMessage {
    TaskMessage::new(message).submit_num(submit_num)
}

fn internal(message: &str, submit_num: u32) -> TaskMessage {
    TaskMessage::new(message)
        .flag(MessageFlag::Internal)
        .submit_num(submit_num)
}

/// Put `itask` into a fresh submit, as the scheduler does before a job runs.
fn prepare(itask: &mut TaskProxy) {
    itask.submit_num += 1;
    itask.state_reset(TaskStatus::Preparing);
}

fn start(h: &mut Harness, itask: &mut TaskProxy, now: f64) {
    prepare(itask);
    let outcome = h
        .events
        .process_message_at(itask, &internal("started", itask.submit_num), now);
    assert_eq!(outcome, MessageOutcome::Applied);
    assert_eq!(itask.status(), TaskStatus::Running);
}

#[test]
fn failed_job_with_retries_waits_behind_a_clock_trigger() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let cfg = TaskConfigBuilder::new("false")
        .execution_retry_delays(&[10.0, 20.0])
        .build();
    let mut itask = task_proxy("1", "a", cfg);

    start(&mut h, &mut itask, NOW);
    let outcome = h.events.process_message_at(&mut itask, &received("failed", 1), NOW);
    assert_eq!(outcome, MessageOutcome::Applied);

    assert_eq!(itask.status(), TaskStatus::Waiting);
    assert_eq!(itask.try_num(), 2);
    let trigger = itask
        .retry_xtriggers
        .get("_retry_1/a")
        .ok_or("retry trigger missing")?;
    assert!(trigger.is_wall_clock());
    assert_eq!(trigger.kwargs["trigger_time"], serde_json::json!(NOW + 10.0));
    assert_eq!(itask.state.xtriggers.get("_retry_1/a"), Some(&false));
    assert!(
        h.recorder
            .events()
            .contains(&("retry".to_string(), "job failed, retrying in PT10S".to_string()))
    );

    // The retry is lined up, so a late message from the failed job is ignored.
    let outcome = h.events.process_message_at(&mut itask, &received("succeeded", 1), NOW + 1.0);
    assert_eq!(outcome, MessageOutcome::Ignored);
    assert_eq!(itask.status(), TaskStatus::Waiting);

    // Second and last try.
    itask.retry_xtriggers.clear();
    itask.state.xtriggers.clear();
    start(&mut h, &mut itask, NOW + 20.0);
    h.events.process_message_at(&mut itask, &received("failed", 2), NOW + 30.0);
    assert_eq!(itask.status(), TaskStatus::Failed);
    assert!(
        h.recorder
            .events()
            .contains(&("failed".to_string(), "job failed".to_string()))
    );
    Ok(())
}

#[test]
fn single_retry_delay_means_single_try() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let cfg = TaskConfigBuilder::new("false")
        .execution_retry_delays(&[10.0])
        .build();
    let mut itask = task_proxy("1", "a", cfg);

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("failed", 1), NOW);
    assert_eq!(itask.status(), TaskStatus::Failed);
    assert!(itask.retry_xtriggers.is_empty());
    Ok(())
}

#[test]
fn submission_failure_retries_with_its_own_label() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let cfg = TaskConfigBuilder::new("true")
        .submission_retry_delays(&[5.0, 5.0])
        .build();
    let mut itask = task_proxy("1", "a", cfg);

    prepare(&mut itask);
    h.events
        .process_message_at(&mut itask, &internal("submit-failed", 1), NOW);

    assert_eq!(itask.status(), TaskStatus::Waiting);
    assert!(itask.retry_xtriggers.contains_key("_submit_retry_1/a"));
    assert!(h.recorder.events().contains(&(
        "submission retry".to_string(),
        "job submission failed, retrying in PT5S".to_string()
    )));
    Ok(())
}

#[test]
fn duplicate_outputs_are_ignored() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());

    start(&mut h, &mut itask, NOW);
    let first = h.events.process_message_at(&mut itask, &received("succeeded", 1), NOW);
    let second = h.events.process_message_at(&mut itask, &received("succeeded", 1), NOW);

    assert_eq!(first, MessageOutcome::Applied);
    assert_eq!(second, MessageOutcome::Ignored);
    assert_eq!(itask.status(), TaskStatus::Succeeded);
    let succeeded: Vec<_> = h
        .spawner
        .outputs()
        .into_iter()
        .filter(|(_, output)| output == "succeeded")
        .collect();
    assert_eq!(succeeded.len(), 1);
    Ok(())
}

#[test]
fn started_implies_submitted() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());

    start(&mut h, &mut itask, NOW);

    let outputs: Vec<String> = h.spawner.outputs().into_iter().map(|(_, o)| o).collect();
    assert_eq!(outputs, vec!["submitted".to_string(), "started".to_string()]);
    assert_eq!(itask.summary.started_time, Some(NOW));
    assert_eq!(itask.summary.submitted_time, Some(NOW));
    Ok(())
}

#[test]
fn backward_transition_requires_poll() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());
    itask.submit_num = 1;
    itask.state_reset(TaskStatus::Succeeded);

    let outcome = h.events.process_message_at(&mut itask, &received("started", 1), NOW);

    assert_eq!(outcome, MessageOutcome::PollRequired);
    assert_eq!(itask.status(), TaskStatus::Succeeded);
    Ok(())
}

#[test]
fn messages_for_previous_submits_are_ignored() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());
    itask.submit_num = 2;
    itask.state_reset(TaskStatus::Running);

    let outcome = h.events.process_message_at(&mut itask, &received("failed", 1), NOW);

    assert_eq!(outcome, MessageOutcome::Ignored);
    assert_eq!(itask.status(), TaskStatus::Running);
    Ok(())
}

#[test]
fn custom_output_message_completes_output() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let cfg = TaskConfigBuilder::new("true")
        .output("ready", "file ready")
        .build();
    let mut itask = task_proxy("1", "a", cfg);

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("file ready", 1), NOW);

    assert!(itask.state.outputs.is_completed("ready"));
    assert!(
        h.spawner
            .outputs()
            .contains(&("1/a".to_string(), "ready".to_string()))
    );
    Ok(())
}

#[test]
fn failure_signal_message_fails_task() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(
        &mut itask,
        &received("failed/ERR", 1).severity(Severity::Critical),
        NOW,
    );

    assert_eq!(itask.status(), TaskStatus::Failed);
    assert!(itask.state.outputs.is_completed("failed"));
    Ok(())
}

#[test]
fn vacated_job_goes_back_to_submitted() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("vacated/USR1", 1), NOW);

    assert_eq!(itask.status(), TaskStatus::Submitted);
    assert!(itask.job_vacated);
    assert!(!itask.state.outputs.is_completed("started"));
    assert_eq!(itask.summary.started_time, None);

    h.events.process_message_at(&mut itask, &received("started", 1), NOW + 5.0);
    assert_eq!(itask.status(), TaskStatus::Running);
    assert!(!itask.job_vacated);
    Ok(())
}

#[test]
fn non_unique_events_get_numbered_handlers() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(
        tmp.path(),
        handler_events(&["true"], &["warning"]),
        StaticHosts::new(&[]),
    );
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());

    start(&mut h, &mut itask, NOW);
    for _ in 0..2 {
        h.events.process_message_at(
            &mut itask,
            &received("disk low", 1).severity(Severity::Warning),
            NOW,
        );
    }

    let mut events: Vec<String> = h.events.timers().keys().map(|k| k.event.clone()).collect();
    events.sort();
    assert_eq!(events, vec!["warning-1".to_string(), "warning-2".to_string()]);
    Ok(())
}

#[test]
fn direct_event_setup_records_and_numbers_events() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(
        tmp.path(),
        handler_events(&["true"], &["custom", "submitted"]),
        StaticHosts::new(&[]),
    );
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());
    itask.submit_num = 1;

    h.events.setup_event_handlers(&mut itask, "custom", "checkpoint reached");
    h.events.setup_event_handlers(&mut itask, "custom", "checkpoint reached");
    h.events.setup_event_handlers(&mut itask, "submitted", "job submitted");

    let mut events: Vec<String> = h.events.timers().keys().map(|k| k.event.clone()).collect();
    events.sort();
    assert_eq!(events, vec!["custom-1", "custom-2", "submitted"]);
    assert_eq!(
        h.recorder.events().first(),
        Some(&("custom".to_string(), "checkpoint reached".to_string()))
    );
    Ok(())
}

#[test]
fn custom_handler_runs_with_rendered_arguments() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("handler.out");
    let handler = format!("echo %(event)s %(id)s %(try_num)s > {}", out.display());
    let mut h = harness(
        tmp.path(),
        handler_events(&[handler.as_str()], &["succeeded"]),
        StaticHosts::new(&[]),
    );
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("succeeded", 1), NOW);
    assert_eq!(h.events.timers().len(), 1);

    h.events.process_events_at(&mut h.pool, NOW);
    assert_eq!(h.pool.queued_len(), 1);
    assert!(drain_pool(&mut h.pool, 5.0));
    h.events.process_events_at(&mut h.pool, NOW);

    assert!(h.events.timers().is_empty());
    assert_eq!(fs::read_to_string(&out)?.trim(), "succeeded 1/a 1");
    let activity = tmp
        .path()
        .join("log/job/1/a/01/job-activity.log");
    assert!(fs::read_to_string(activity)?.contains("event-handler-00"));
    Ok(())
}

#[test]
fn failing_handler_is_retried_then_dropped() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let events = EventsConfig {
        handler_retry_delays: Some(vec![0.0, 0.0]),
        ..handler_events(&["false"], &["succeeded"])
    };
    let mut h = harness(tmp.path(), events, StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("true").build());

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("succeeded", 1), NOW);

    let mut runs = 0;
    while !h.events.timers().is_empty() && runs < 5 {
        h.events.process_events_at(&mut h.pool, NOW);
        if h.pool.is_not_done() {
            runs += 1;
            assert!(drain_pool(&mut h.pool, 5.0));
        }
    }
    assert_eq!(runs, 2);
    assert!(h.events.timers().is_empty());
    Ok(())
}

#[test]
fn mail_is_batched_and_held_for_the_interval() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let events = EventsConfig {
        mail_events: Some(vec!["failed".to_string()]),
        ..EventsConfig::default()
    };
    let mut h = harness(tmp.path(), events, StaticHosts::new(&[]));
    let mut tasks: Vec<TaskProxy> = ["a", "b", "c"]
        .iter()
        .map(|name| task_proxy("1", name, TaskConfigBuilder::new("false").build()))
        .collect();

    for itask in tasks.iter_mut().take(2) {
        start(&mut h, itask, NOW);
        h.events.process_message_at(itask, &received("failed", 1), NOW);
    }
    assert_eq!(h.events.timers().len(), 2);
    assert!(h.events.timers().keys().all(|k| k.handler == HANDLER_MAIL));

    h.events.process_events_at(&mut h.pool, NOW);
    assert_eq!(h.pool.queued_len(), 1, "two events, one mail");
    assert_eq!(h.events.next_mail_time(), Some(NOW + 300.0));

    let c = &mut tasks[2];
    start(&mut h, c, NOW + 1.0);
    h.events.process_message_at(c, &received("failed", 1), NOW + 1.0);
    h.events.process_events_at(&mut h.pool, NOW + 1.0);
    assert_eq!(h.pool.queued_len(), 1, "held until the interval passes");

    h.events.set_stopping(true);
    h.events.process_events_at(&mut h.pool, NOW + 2.0);
    assert_eq!(h.pool.queued_len(), 2, "stopping flushes held mail");
    Ok(())
}

#[test]
fn remote_job_logs_are_retrieved_after_failure() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&["hpc1"]));
    let mut itask = TaskProxy::new(
        "test-flow",
        "1",
        "a",
        TaskConfigBuilder::new("false").platform("hpc").build(),
        hpc_platform(),
    );

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("failed", 1), NOW);

    let key = h
        .events
        .timers()
        .keys()
        .find(|k| k.handler == HANDLER_JOB_LOGS_RETRIEVE)
        .cloned()
        .ok_or("no job log retrieval timer")?;
    assert_eq!(key.event, "failed");

    h.events.process_events_at(&mut h.pool, NOW);
    assert_eq!(h.pool.queued_len(), 1);
    assert!(h.events.timers().get(&key).is_some_and(|t| t.is_waiting()));
    Ok(())
}

#[test]
fn local_jobs_need_no_log_retrieval() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&["hpc1"]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("false").build());

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("failed", 1), NOW);

    assert!(h.events.timers().is_empty());
    Ok(())
}

#[test]
fn execution_time_limit_shapes_polling() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let mut h = harness(tmp.path(), EventsConfig::default(), StaticHosts::new(&[]));
    let cfg = TaskConfigBuilder::new("sleep 30")
        .execution_time_limit(60.0)
        .build();
    let mut itask = task_proxy("1", "a", cfg);

    start(&mut h, &mut itask, NOW);

    let timer = itask.poll_timer.as_ref().ok_or("no poll timer")?;
    assert_eq!(timer.delays(), &[120.0, 120.0, 420.0]);
    assert_eq!(*timer.ctx(), (1, TaskStatus::Running));
    assert_eq!(itask.timeout, None);
    assert_eq!(TaskEventsManager::check_poll_time(&mut itask, NOW + 10.0), Some(false));
    assert_eq!(TaskEventsManager::check_poll_time(&mut itask, NOW + 121.0), Some(true));
    Ok(())
}

#[test]
fn execution_timeout_fires_once() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let events = EventsConfig {
        execution_timeout: Some(30.0),
        ..EventsConfig::default()
    };
    let mut h = harness(tmp.path(), events, StaticHosts::new(&[]));
    let mut itask = task_proxy("1", "a", TaskConfigBuilder::new("sleep 60").build());

    start(&mut h, &mut itask, NOW);
    assert_eq!(itask.timeout, Some(NOW + 30.0));

    assert!(!h.events.check_job_time(&mut itask, NOW + 10.0));
    assert!(h.events.check_job_time(&mut itask, NOW + 31.0));
    assert!(h.recorder.events().contains(&(
        "execution timeout".to_string(),
        "execution timeout after PT30S".to_string()
    )));
    assert_eq!(itask.timeout, None);
    assert!(!h.events.check_job_time(&mut itask, NOW + 40.0));
    Ok(())
}

#[test]
fn task_events_override_workflow_defaults() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let workflow_events = EventsConfig {
        mail_events: Some(vec!["failed".to_string()]),
        ..EventsConfig::default()
    };
    let mut h = harness(tmp.path(), workflow_events, StaticHosts::new(&[]));
    let quiet = TaskConfig {
        events: EventsConfig {
            mail_events: Some(Vec::new()),
            ..EventsConfig::default()
        },
        ..TaskConfigBuilder::new("false").build()
    };
    let mut itask = task_proxy("1", "a", quiet);

    start(&mut h, &mut itask, NOW);
    h.events.process_message_at(&mut itask, &received("failed", 1), NOW);

    assert!(h.events.timers().is_empty());
    Ok(())
}
