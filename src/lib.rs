// src/lib.rs

pub mod cli;
pub mod collab;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod job_runner;
pub mod logging;
pub mod platform;
pub mod shell;
pub mod subproc;
pub mod task;
pub mod template;
pub mod timer;
pub mod wallclock;
pub mod xtrigger;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::collab::{Collaborators, WorkflowContext};
use crate::config::loader::{load_and_validate, resolve_run_dir};
use crate::config::model::ConfigFile;
use crate::engine::{RunSummary, Runtime, RuntimeEvent, RuntimeOptions, SchedulerCore};

/// High-level entry point used by `main.rs`.
///
/// `validate` loads and prints the config. `run` wires config, scheduler
/// core, runtime and Ctrl-C handling together and drives the workflow to
/// completion.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args.config_path().clone();
    let cfg = load_and_validate(&config_path)?;

    match args.command {
        Command::Validate(_) => {
            print_summary(&cfg);
            Ok(())
        }
        Command::Run(_) => run_workflow(cfg, &config_path).await,
    }
}

async fn run_workflow(cfg: ConfigFile, config_path: &Path) -> Result<()> {
    let run_dir = resolve_run_dir(&cfg, config_path);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    let run_dir = run_dir.canonicalize()?;
    info!(run_dir = %run_dir.display(), "workflow run directory");

    let mut workflow = WorkflowContext::new(&cfg.workflow.name, run_dir);
    workflow.meta = cfg.workflow.meta.clone();

    let core = SchedulerCore::new(&cfg, workflow, Collaborators::default())?;

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    // First Ctrl-C stops submitting, second kills everything.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            for event in [RuntimeEvent::StopRequested, RuntimeEvent::ShutdownRequested] {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    eprintln!("failed to listen for Ctrl+C: {e}");
                    return;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
    }

    let options = RuntimeOptions {
        main_loop_interval: cfg.scheduler.main_loop_interval,
    };
    let summary = Runtime::new(core, rt_rx, options).run().await?;
    drop(rt_tx);

    match summary {
        RunSummary::Completed => {
            info!("workflow complete");
            Ok(())
        }
        RunSummary::Stopped => {
            info!("workflow stopped");
            Ok(())
        }
        RunSummary::Stalled => bail!("workflow stalled"),
    }
}

/// Print the validated workflow: tasks, points, dependencies, triggers.
fn print_summary(cfg: &ConfigFile) {
    println!("cyclexec validate: {}", cfg.workflow.name);
    println!(
        "  scheduler.process_pool_size = {}",
        cfg.scheduler.process_pool_size
    );
    println!(
        "  scheduler.process_pool_timeout = {}",
        wallclock::interval_as_str(cfg.scheduler.process_pool_timeout)
    );
    println!();

    println!("platforms ({}):", cfg.platforms.len());
    for (name, platform) in cfg.platforms.iter() {
        println!("  - {name}: hosts {:?}, runner {}", platform.hosts, platform.job_runner);
    }
    println!();

    println!("tasks ({}):", cfg.tasks.len());
    for (name, task) in cfg.tasks.iter() {
        println!("  - {name}");
        println!("      points: {:?}", task.effective_points());
        println!("      platform: {}", task.effective_platform());
        if !task.after.is_empty() {
            println!("      after: {:?}", task.after);
        }
        if !task.xtriggers.is_empty() {
            println!("      xtriggers: {:?}", task.xtriggers);
        }
        if !task.execution_retry_delays.is_empty() {
            println!(
                "      execution retry delays: {}",
                crate::events::polling::group_delays(&task.execution_retry_delays)
            );
        }
    }

    debug!("validate complete (no execution)");
}
