//! # keel-cli
//!
//! Command-line interface for keel stacks.
//!
//! ## Commands
//!
//! - `keel plan` - Show the dependency graph and what an apply would change
//! - `keel apply` - Materialize a manifest
//! - `keel destroy` - Tear down everything recorded in the state file
//!
//! ## Configuration
//!
//! The CLI uses environment variables or command-line flags for settings:
//!
//! - `KEEL_STATE` - State file (default: `.keel/state.json`)
//! - `KEEL_LOG_FORMAT` - `pretty`, `compact` or `json`
//! - `KEEL_MAX_CONCURRENCY`, `KEEL_RETRY_*`, `KEEL_GATE_*` - engine settings
//!
//! ## Exit codes
//!
//! `0` on success, `1` when any node failed, `2` when an apply stopped on a
//! confirmation gate that is still awaiting external action.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod workspace;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use keel_core::observability::LogFormat;

/// Keel CLI - declarative resource orchestration.
#[derive(Debug, Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// State file holding applied records and simulated resources.
    #[arg(long, env = "KEEL_STATE", default_value = ".keel/state.json")]
    pub state: PathBuf,

    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Log format.
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            state_path: self.state.clone(),
            format: self.format.clone(),
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the dependency graph and planned changes.
    Plan(commands::plan::PlanArgs),
    /// Apply a manifest.
    Apply(commands::apply::ApplyArgs),
    /// Destroy every recorded resource.
    Destroy(commands::destroy::DestroyArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// Log format flag.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum LogFormatArg {
    /// Multi-line human readable logs.
    Pretty,
    /// Single-line logs.
    #[default]
    Compact,
    /// JSON logs.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Compact => Self::Compact,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// State file path.
    pub state_path: PathBuf,
    /// Output format.
    pub format: OutputFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config_from_flags() {
        let cli = Cli::parse_from([
            "keel",
            "--state",
            "/tmp/keel.json",
            "--format",
            "json",
            "apply",
            "-f",
            "stack.json",
        ]);

        let config = cli.config();
        assert_eq!(config.state_path, PathBuf::from("/tmp/keel.json"));
        assert!(matches!(config.format, OutputFormat::Json));
        assert!(matches!(cli.command, Commands::Apply(_)));
    }

    #[test]
    fn test_log_format_maps_to_core() {
        assert_eq!(LogFormat::from(LogFormatArg::Json), LogFormat::Json);
        assert_eq!(LogFormat::from(LogFormatArg::Compact), LogFormat::Compact);
    }
}
