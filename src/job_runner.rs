// src/job_runner.rs

//! Job runner handlers and the job script they submit.
//!
//! Only the `background` runner is built in: the job script runs as a
//! direct child of the pool, so the pool completion is the job's exit.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::shell;
use crate::subproc::CommandLine;

/// Marker line the job script prints before running the task script.
pub const JOB_PID_MARKER: &str = "CYCLEXEC_JOB_PID=";

/// What a handler needs to know to write directives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobConf {
    pub task_id: String,
    pub job_file_path: String,
    pub execution_time_limit: Option<f64>,
    pub directives: BTreeMap<String, String>,
}

pub trait JobRunnerHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Header lines placed at the top of the job script.
    fn format_directives(&self, _conf: &JobConf) -> Vec<String> {
        Vec::new()
    }

    fn submit_command(&self, job_file: &Path) -> CommandLine;

    fn poll_command(&self, job_ids: &[String]) -> CommandLine;

    fn kill_command(&self, job_id: &str) -> CommandLine;

    /// Pattern with an `id` group matching the job id in submit output.
    fn job_id_regex(&self) -> &Regex;

    fn job_id_from_submit_output(&self, out: &str) -> Option<String> {
        out.lines().find_map(|line| {
            self.job_id_regex()
                .captures(line)
                .and_then(|c| c.name("id"))
                .map(|m| m.as_str().to_string())
        })
    }

    /// Signal the runner sends a job before vacating it, if it does.
    fn vacation_signal(&self, _conf: &JobConf) -> Option<String> {
        None
    }

    /// Hook to clean up submit output before the job id is parsed.
    fn filter_submit_output(&self, out: &str, err: &str) -> (String, String) {
        (out.to_string(), err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundRunner;

impl BackgroundRunner {
    pub const NAME: &'static str = "background";
}

fn background_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"^{JOB_PID_MARKER}(?P<id>\d+)\s*$"))
            .expect("built-in job id regex is valid")
    })
}

impl JobRunnerHandler for BackgroundRunner {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn submit_command(&self, job_file: &Path) -> CommandLine {
        CommandLine::argv(["/bin/bash".to_string(), job_file.display().to_string()])
    }

    fn poll_command(&self, job_ids: &[String]) -> CommandLine {
        let mut cmd = vec!["ps".to_string(), "-o".to_string(), "pid=".to_string()];
        for id in job_ids {
            cmd.push("-p".to_string());
            cmd.push(id.clone());
        }
        CommandLine::Argv(cmd)
    }

    fn kill_command(&self, job_id: &str) -> CommandLine {
        CommandLine::argv(["kill", "-9", job_id])
    }

    fn job_id_regex(&self) -> &Regex {
        background_id_regex()
    }
}

/// Look up a runner by its platform `job_runner` name.
pub fn get_runner(name: &str) -> Option<Arc<dyn JobRunnerHandler>> {
    match name {
        BackgroundRunner::NAME => Some(Arc::new(BackgroundRunner)),
        _ => None,
    }
}

/// Everything written into one job script.
#[derive(Debug, Clone, Default)]
pub struct JobScript {
    pub conf: JobConf,
    pub workflow: String,
    pub submit_num: u32,
    pub try_num: usize,
    pub run_dir: String,
    pub job_log_dir: String,
    pub env: BTreeMap<String, String>,
    pub script: String,
}

impl JobScript {
    /// Render the script text.
    ///
    /// stdout/stderr of the task script go to `job.out`/`job.err` in the job
    /// log directory; the runner only sees the pid marker.
    pub fn render(&self, runner: &dyn JobRunnerHandler) -> String {
        let mut out = String::from("#!/bin/bash\n");
        for line in runner.format_directives(&self.conf) {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!("echo \"{JOB_PID_MARKER}$$\"\n"));
        let job_dir = shell::quote(&self.job_log_dir);
        out.push_str(&format!("exec >{job_dir}/job.out 2>{job_dir}/job.err\n"));

        let mut env = BTreeMap::new();
        env.insert("CYCLEXEC_WORKFLOW_NAME", self.workflow.clone());
        env.insert("CYCLEXEC_TASK_ID", self.conf.task_id.clone());
        env.insert("CYCLEXEC_TASK_SUBMIT_NUMBER", self.submit_num.to_string());
        env.insert("CYCLEXEC_TASK_TRY_NUMBER", self.try_num.to_string());
        env.insert("CYCLEXEC_WORKFLOW_RUN_DIR", self.run_dir.clone());
        for (key, value) in &env {
            out.push_str(&format!("export {key}={}\n", shell::quote(value)));
        }
        for (key, value) in &self.env {
            out.push_str(&format!("export {key}={}\n", shell::quote(value)));
        }
        out.push_str(&format!("cd {}\n", shell::quote(&self.run_dir)));
        out.push_str(&self.script);
        if !self.script.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    /// Write the script to `path`, creating parent directories.
    pub fn write(&self, runner: &dyn JobRunnerHandler, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render(runner))
    }
}
