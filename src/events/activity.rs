// src/events/activity.rs

//! Append command outcomes to `<job log dir>/<point>/<name>/<NN>/job-activity.log`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::subproc::CommandContext;

pub fn job_dir(job_log_dir: &Path, point: &str, name: &str, submit_num: u32) -> PathBuf {
    job_log_dir
        .join(point)
        .join(name)
        .join(format!("{submit_num:02}"))
}

/// Best effort: failures are logged, never returned.
pub fn log_task_job_activity(
    ctx: &CommandContext,
    job_log_dir: &Path,
    point: &str,
    name: &str,
    submit_num: u32,
) {
    let dir = job_dir(job_log_dir, point, name, submit_num);
    let path = dir.join("job-activity.log");
    let write = || -> std::io::Result<()> {
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "[{}] {}", ctx.timestamp, ctx.cmd_key)?;
        writeln!(file, "{ctx}")?;
        Ok(())
    };
    if let Err(err) = write() {
        warn!(path = %path.display(), error = %err, "could not write job activity log");
    }
}
