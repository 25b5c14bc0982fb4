// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `cyclexec`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cyclexec",
    version,
    about = "Run a workflow of cycling tasks with retries, event handlers and external triggers.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CYCLEXEC_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the workflow until every task has finished.
    Run(ConfigArgs),
    /// Load and validate the config, print the task summary, run nothing.
    Validate(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Path to the workflow config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "flow.toml")]
    pub config: PathBuf,
}

impl CliArgs {
    pub fn config_path(&self) -> &PathBuf {
        match &self.command {
            Command::Run(a) | Command::Validate(a) => &a.config,
        }
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_global_log_level() {
        let args = CliArgs::try_parse_from(["cyclexec", "run", "--config", "x.toml", "--log-level", "debug"])
            .unwrap();
        assert!(matches!(args.command, Command::Run(_)));
        assert_eq!(args.config_path(), &PathBuf::from("x.toml"));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }

    #[test]
    fn validate_defaults_config_path() {
        let args = CliArgs::try_parse_from(["cyclexec", "validate"]).unwrap();
        assert_eq!(args.config_path(), &PathBuf::from("flow.toml"));
    }
}
