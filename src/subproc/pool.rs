// src/subproc/pool.rs

//! Bounded, non-blocking subprocess pool.
//!
//! The pool is driven from the scheduling loop: [`SubProcPool::advance`]
//! never waits on a child. Each call
//! - reaps finished commands and fires their callbacks,
//! - kills (by process group) commands past their deadline,
//! - drains a little of every running command's stdout/stderr,
//! - then launches queued commands while fewer than `size` are running.
//!
//! Every enqueued command gets exactly one completion: normal, killed on
//! timeout, failed to launch, or short-circuited because the workflow is
//! stopping.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::platform::{BadHosts, HostResolver};
use crate::shell;
use crate::subproc::context::{
    CommandContext, CommandLine, JOBS_SUBMIT, RET_CODE_WORKFLOW_STOPPING, StdinSource,
};
use crate::subproc::process_tree;
use crate::wallclock;

/// Completion callback.
pub type Callback = Box<dyn FnOnce(&CommandContext) + Send>;

/// Unreachable-host callback; returns `true` if it handled the completion.
pub type AltCallback = Box<dyn FnOnce(&CommandContext) -> bool + Send>;

/// Called with the child's pid once the command is running.
pub type LaunchCallback = Box<dyn FnOnce(u32) + Send>;

const READ_CHUNK: usize = 65_536;
const MAX_READS_PER_TICK: usize = 4;

/// What to do when an enqueued command completes.
#[derive(Default)]
pub struct Callbacks {
    on_done: Option<Callback>,
    on_unreachable: Option<AltCallback>,
    on_launch: Option<LaunchCallback>,
    bad_hosts: Option<BadHosts>,
}

impl Callbacks {
    pub fn new(on_done: impl FnOnce(&CommandContext) + Send + 'static) -> Self {
        Self {
            on_done: Some(Box::new(on_done)),
            ..Self::default()
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn on_unreachable(
        mut self,
        alt: impl FnOnce(&CommandContext) -> bool + Send + 'static,
    ) -> Self {
        self.on_unreachable = Some(Box::new(alt));
        self
    }

    pub fn on_launch(mut self, on_launch: impl FnOnce(u32) + Send + 'static) -> Self {
        self.on_launch = Some(Box::new(on_launch));
        self
    }

    /// Hosts found unreachable by this command are added to `bad_hosts`.
    pub fn bad_hosts(mut self, bad_hosts: BadHosts) -> Self {
        self.bad_hosts = Some(bad_hosts);
        self
    }
}

/// Cross-thread handle for flagging the pool as stopping.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<Mutex<bool>>);

impl StopHandle {
    pub fn set(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn is_set(&self) -> bool {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RunningProc {
    ctx: CommandContext,
    callbacks: Callbacks,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolOptions {
    pub size: usize,
    /// Seconds a command may run before its process group is killed.
    pub timeout: f64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 4,
            timeout: 600.0,
        }
    }
}

pub struct SubProcPool {
    options: PoolOptions,
    queue: VecDeque<(CommandContext, Callbacks)>,
    running: Vec<RunningProc>,
    closed: bool,
    stopping: StopHandle,
    hosts: Arc<dyn HostResolver>,
}

impl std::fmt::Debug for SubProcPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubProcPool")
            .field("options", &self.options)
            .field("queued", &self.queue.len())
            .field("running", &self.running.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SubProcPool {
    pub fn new(options: PoolOptions, hosts: Arc<dyn HostResolver>) -> Self {
        Self {
            options: PoolOptions {
                size: options.size.max(1),
                timeout: options.timeout,
            },
            queue: VecDeque::new(),
            running: Vec::new(),
            closed: false,
            stopping: StopHandle::default(),
            hosts,
        }
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stopping.clone()
    }

    /// Queue a command. Refused commands complete immediately with the
    /// workflow-stopping failure; nothing is ever returned to the caller.
    pub fn enqueue(&mut self, mut ctx: CommandContext, callbacks: Callbacks) {
        if self.closed || (self.is_stopping() && ctx.cmd_key == JOBS_SUBMIT) {
            ctx.set_stopping_failure();
            self.run_command_exit(ctx, callbacks);
            return;
        }
        debug!(cmd_key = %ctx.cmd_key, queued = self.queue.len() + 1, "command queued");
        self.queue.push_back((ctx, callbacks));
    }

    pub fn advance(&mut self) {
        self.advance_at(wallclock::now());
    }

    /// One scheduling tick with an explicit clock.
    pub fn advance_at(&mut self, now: f64) {
        let mut still_running = Vec::with_capacity(self.running.len());
        for mut proc in std::mem::take(&mut self.running) {
            match proc.child.try_wait() {
                Ok(Some(status)) => {
                    drain_all(&mut proc);
                    proc.ctx.ret_code = Some(exit_code(status));
                    self.finish(proc);
                }
                Ok(None) if proc.ctx.deadline.is_some_and(|d| now >= d) => {
                    warn!(
                        cmd_key = %proc.ctx.cmd_key,
                        pid = proc.child.id(),
                        "command timed out; killing process group"
                    );
                    if !process_tree::terminate_process_tree(proc.child.id()) {
                        let _ = proc.child.kill();
                    }
                    let status = proc.child.wait();
                    drain_all(&mut proc);
                    proc.ctx.err.push_str(&format!(
                        "\nkilled on timeout ({})",
                        wallclock::interval_as_str(self.options.timeout)
                    ));
                    proc.ctx.ret_code = Some(status.map(exit_code).unwrap_or(-9));
                    self.finish(proc);
                }
                Ok(None) => {
                    drain_some(&mut proc);
                    still_running.push(proc);
                }
                Err(err) => {
                    warn!(cmd_key = %proc.ctx.cmd_key, error = %err, "failed to poll command");
                    proc.ctx.err.push_str(&err.to_string());
                    proc.ctx.ret_code = Some(1);
                    self.finish(proc);
                }
            }
        }
        self.running = still_running;

        while self.running.len() < self.options.size {
            let Some((mut ctx, callbacks)) = self.queue.pop_front() else {
                break;
            };
            if self.is_stopping() && ctx.cmd_key == JOBS_SUBMIT {
                ctx.set_stopping_failure();
                self.run_command_exit(ctx, callbacks);
                continue;
            }
            self.launch(ctx, callbacks, now);
        }
    }

    /// Run a command to completion on the calling thread, bypassing the
    /// queue and size limit, then fire its callbacks.
    pub fn run_blocking(&self, ctx: CommandContext, callbacks: Callbacks) -> CommandContext {
        let ctx = run_to_completion(ctx);
        let out = ctx.clone();
        self.run_command_exit(ctx, callbacks);
        out
    }

    /// Refuse all further commands.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn set_stopping(&self) {
        self.stopping.set();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_set()
    }

    pub fn is_not_done(&self) -> bool {
        !self.queue.is_empty() || !self.running.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn running_cmd_keys(&self) -> Vec<&str> {
        self.running.iter().map(|p| p.ctx.cmd_key.as_str()).collect()
    }

    /// Close, fail everything queued, kill everything running.
    pub fn drain_and_terminate(&mut self) {
        self.close();
        while let Some((mut ctx, callbacks)) = self.queue.pop_front() {
            ctx.set_stopping_failure();
            self.run_command_exit(ctx, callbacks);
        }
        for mut proc in std::mem::take(&mut self.running) {
            info!(cmd_key = %proc.ctx.cmd_key, pid = proc.child.id(), "terminating command");
            if !process_tree::terminate_process_tree(proc.child.id()) {
                let _ = proc.child.kill();
            }
            let status = proc.child.wait();
            drain_all(&mut proc);
            proc.ctx.ret_code = Some(status.map(exit_code).unwrap_or(-9));
            self.finish(proc);
        }
    }

    /// Exit 255 from `ssh` means the connection failed.
    pub fn ssh_255_fail(ctx: &CommandContext) -> bool {
        ctx.program() == Some("ssh") && ctx.ret_code == Some(255)
    }

    /// Exit 255 from rsync, or an rsync failure towards a remote host that a
    /// plain `ssh <host> true` probe confirms as unreachable.
    pub fn rsync_255_fail(&self, ctx: &CommandContext) -> bool {
        let Some(remote) = &ctx.remote else {
            return false;
        };
        let rsync_words = shell::split(&remote.rsync_command);
        let Some(rsync_prog) = rsync_words.first() else {
            return false;
        };
        if ctx.program() != Some(rsync_prog.as_str()) {
            return false;
        }
        match ctx.ret_code {
            Some(255) => true,
            Some(0) | None => false,
            Some(_) if self.hosts.is_remote_host(&ctx.host) => {
                let mut probe = shell::split(&remote.ssh_command);
                if probe.is_empty() {
                    return false;
                }
                probe.push(ctx.host.clone());
                probe.push("true".to_string());
                let probe_ctx = run_to_completion(CommandContext::new(
                    "ssh-probe",
                    CommandLine::Argv(probe),
                ));
                debug!(host = %ctx.host, ret_code = ?probe_ctx.ret_code, "ssh probe finished");
                probe_ctx.ret_code == Some(255)
            }
            Some(_) => false,
        }
    }

    fn launch(&mut self, mut ctx: CommandContext, mut callbacks: Callbacks, now: f64) {
        ctx.update_timestamp();
        match spawn(&ctx) {
            Ok(mut child) => {
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                for err in [
                    stdout.as_ref().map(process_tree::set_nonblocking),
                    stderr.as_ref().map(process_tree::set_nonblocking),
                ]
                .into_iter()
                .flatten()
                .filter_map(|r| r.err())
                {
                    warn!(cmd_key = %ctx.cmd_key, error = %err, "could not make pipe non-blocking");
                }
                ctx.pid = Some(child.id());
                ctx.deadline = Some(now + self.options.timeout);
                debug!(cmd_key = %ctx.cmd_key, pid = child.id(), cmd = %ctx.cmd, "command launched");
                if let Some(on_launch) = callbacks.on_launch.take() {
                    on_launch(child.id());
                }
                self.running.push(RunningProc {
                    ctx,
                    callbacks,
                    child,
                    stdout,
                    stderr,
                });
            }
            Err(err) => {
                warn!(cmd_key = %ctx.cmd_key, error = %err, "command failed to launch");
                ctx.err.push_str(&err.to_string());
                ctx.ret_code = Some(1);
                self.run_command_exit(ctx, callbacks);
            }
        }
    }

    fn finish(&self, proc: RunningProc) {
        let RunningProc { ctx, callbacks, .. } = proc;
        self.run_command_exit(ctx, callbacks);
    }

    fn run_command_exit(&self, mut ctx: CommandContext, callbacks: Callbacks) {
        ctx.update_timestamp();
        let Callbacks {
            on_done,
            on_unreachable,
            bad_hosts,
            ..
        } = callbacks;

        if ctx.succeeded() {
            debug!(cmd_key = %ctx.cmd_key, "command succeeded");
        } else {
            debug!(cmd_key = %ctx.cmd_key, ret_code = ?ctx.ret_code, "command failed\n{ctx}");
        }

        let sentinel = ctx.ret_code == Some(RET_CODE_WORKFLOW_STOPPING);
        if !sentinel && (Self::ssh_255_fail(&ctx) || self.rsync_255_fail(&ctx)) {
            warn!(host = %ctx.host, cmd_key = %ctx.cmd_key, "host unreachable (exit 255)");
            if let Some(bad_hosts) = &bad_hosts {
                bad_hosts.add(&ctx.host);
            }
            if let Some(alt) = on_unreachable {
                if alt(&ctx) {
                    return;
                }
            }
        }
        if let Some(cb) = on_done {
            cb(&ctx);
        }
    }
}

impl Drop for SubProcPool {
    fn drop(&mut self) {
        for proc in &mut self.running {
            process_tree::terminate_process_tree(proc.child.id());
            let _ = proc.child.wait();
        }
    }
}

fn spawn(ctx: &CommandContext) -> io::Result<Child> {
    let mut command = match &ctx.cmd {
        CommandLine::Argv(words) => {
            let (program, args) = words.split_first().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "empty command")
            })?;
            let mut c = Command::new(program);
            c.args(args);
            c
        }
        CommandLine::Shell(s) => {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(s);
            c
        }
    };
    command
        .envs(&ctx.env)
        .stdin(stdin_for(&ctx.stdin)?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    process_tree::prepare_process_group(&mut command);
    command.spawn()
}

/// Text and multi-file stdin is spooled through an anonymous temp file so
/// the child never blocks on a pipe the pool is not writing to.
fn stdin_for(source: &StdinSource) -> io::Result<Stdio> {
    match source {
        StdinSource::Null => Ok(Stdio::null()),
        StdinSource::Files(files) if files.len() == 1 => Ok(Stdio::from(File::open(&files[0])?)),
        StdinSource::Files(files) => {
            let mut spool = tempfile::tempfile()?;
            for path in files {
                io::copy(&mut File::open(path)?, &mut spool)?;
            }
            spool.seek(SeekFrom::Start(0))?;
            Ok(Stdio::from(spool))
        }
        StdinSource::Text(text) => {
            let mut spool = tempfile::tempfile()?;
            spool.write_all(text.as_bytes())?;
            spool.seek(SeekFrom::Start(0))?;
            Ok(Stdio::from(spool))
        }
    }
}

fn run_to_completion(mut ctx: CommandContext) -> CommandContext {
    let output = spawn(&ctx).and_then(|child| {
        ctx.pid = Some(child.id());
        child.wait_with_output()
    });
    match output {
        Ok(output) => {
            ctx.out.push_str(&String::from_utf8_lossy(&output.stdout));
            ctx.err.push_str(&String::from_utf8_lossy(&output.stderr));
            ctx.ret_code = Some(exit_code(output.status));
        }
        Err(err) => {
            ctx.err.push_str(&err.to_string());
            ctx.ret_code = Some(1);
        }
    }
    ctx
}

/// Signal deaths are reported as negative signal numbers.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}

/// Read what is available right now, bounded per tick.
fn read_available<R: Read>(reader: &mut R, sink: &mut String, max_reads: usize) -> bool {
    let mut buf = vec![0u8; READ_CHUNK];
    for _ in 0..max_reads {
        match reader.read(&mut buf) {
            Ok(0) => return false,
            Ok(n) => sink.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
    true
}

fn drain_some(proc: &mut RunningProc) {
    if let Some(out) = proc.stdout.as_mut() {
        if !read_available(out, &mut proc.ctx.out, MAX_READS_PER_TICK) {
            proc.stdout = None;
        }
    }
    if let Some(err) = proc.stderr.as_mut() {
        if !read_available(err, &mut proc.ctx.err, MAX_READS_PER_TICK) {
            proc.stderr = None;
        }
    }
}

/// After exit: take whatever the pipes still hold without waiting on
/// descendants that may keep them open.
fn drain_all(proc: &mut RunningProc) {
    if let Some(mut out) = proc.stdout.take() {
        read_available(&mut out, &mut proc.ctx.out, usize::MAX);
    }
    if let Some(mut err) = proc.stderr.take() {
        read_available(&mut err, &mut proc.ctx.err, usize::MAX);
    }
}
