// src/subproc/context.rs

//! The unit of work handed to the subprocess pool.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::shell;
use crate::wallclock;

/// Command key whose members are short-circuited once the workflow stops.
pub const JOBS_SUBMIT: &str = "jobs-submit";
pub const JOBS_POLL: &str = "jobs-poll";
pub const XTRIGGER_FUNC: &str = "xtrigger-func";

/// Exit code given to commands the pool refuses to run.
pub const RET_CODE_WORKFLOW_STOPPING: i32 = 999;
pub const WORKFLOW_STOPPING_MSG: &str = "workflow stopping, command not run";

/// How a command is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Argument vector, executed directly.
    Argv(Vec<String>),
    /// A string passed to `/bin/sh -c`.
    Shell(String),
}

impl CommandLine {
    pub fn argv<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Argv(words.into_iter().map(Into::into).collect())
    }

    pub fn shell(cmd: impl Into<String>) -> Self {
        CommandLine::Shell(cmd.into())
    }

    /// First word of the command (the program), if any.
    pub fn program(&self) -> Option<&str> {
        match self {
            CommandLine::Argv(words) => words.first().map(String::as_str),
            CommandLine::Shell(s) => s.split_whitespace().next(),
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, CommandLine::Shell(_))
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Argv(words) => {
                let quoted: Vec<String> = words.iter().map(|w| shell::quote(w)).collect();
                write!(f, "{}", quoted.join(" "))
            }
            CommandLine::Shell(s) => write!(f, "{s}"),
        }
    }
}

/// What to feed the command on stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdinSource {
    #[default]
    Null,
    Text(String),
    Files(Vec<PathBuf>),
}

/// Remote tool settings of the platform a command targets, used to classify
/// exit status 255 as "host unreachable".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTools {
    pub ssh_command: String,
    pub rsync_command: String,
}

/// One external command: what to run, where, and what came back.
///
/// `out` and `err` only ever grow. `ret_code` is `None` until the command
/// has been finalised by the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandContext {
    pub cmd_key: String,
    pub cmd: CommandLine,
    pub host: String,
    pub out: String,
    pub err: String,
    pub ret_code: Option<i32>,
    pub timestamp: String,
    /// Absolute kill time, set when the pool launches the command.
    pub deadline: Option<f64>,
    /// Process id once launched.
    pub pid: Option<u32>,
    pub env: BTreeMap<String, String>,
    pub stdin: StdinSource,
    pub remote: Option<RemoteTools>,
}

impl CommandContext {
    pub fn new(cmd_key: impl Into<String>, cmd: CommandLine) -> Self {
        Self {
            cmd_key: cmd_key.into(),
            cmd,
            host: "localhost".to_string(),
            out: String::new(),
            err: String::new(),
            ret_code: None,
            timestamp: wallclock::current_time_string(),
            deadline: None,
            pid: None,
            env: BTreeMap::new(),
            stdin: StdinSource::Null,
            remote: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_remote(mut self, remote: RemoteTools) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.cmd.program()
    }

    pub fn succeeded(&self) -> bool {
        self.ret_code == Some(0)
    }

    /// Mark as not run because the workflow is stopping.
    pub(crate) fn set_stopping_failure(&mut self) {
        self.err = WORKFLOW_STOPPING_MSG.to_string();
        self.ret_code = Some(RET_CODE_WORKFLOW_STOPPING);
        self.update_timestamp();
    }

    pub(crate) fn update_timestamp(&mut self) {
        self.timestamp = wallclock::current_time_string();
    }

    fn cmd_for_log(&self) -> String {
        let mut mesg = String::new();
        if let StdinSource::Files(files) = &self.stdin {
            mesg.push_str("cat");
            for f in files {
                mesg.push(' ');
                mesg.push_str(&shell::quote(&f.to_string_lossy()));
            }
            mesg.push_str(" | ");
        }
        mesg.push_str(&self.cmd.to_string());
        if let StdinSource::Text(text) = &self.stdin {
            mesg.push_str(" <<<");
            mesg.push_str(&shell::quote(text));
        }
        mesg
    }
}

/// `[cmd_key attr] value` lines, one block per non-empty attribute.
impl fmt::Display for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = [
            ("cmd", self.cmd_for_log()),
            (
                "ret_code",
                self.ret_code.map(|c| c.to_string()).unwrap_or_default(),
            ),
            ("out", self.out.trim().to_string()),
            ("err", self.err.trim().to_string()),
        ];
        let mut blocks = Vec::new();
        for (attr, mesg) in attrs {
            if mesg.trim().is_empty() {
                continue;
            }
            if mesg.lines().count() > 1 {
                blocks.push(format!("[{} {}]\n{}", self.cmd_key, attr, mesg));
            } else {
                blocks.push(format!("[{} {}] {}", self.cmd_key, attr, mesg));
            }
        }
        write!(f, "{}", blocks.join("\n"))
    }
}
