// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `benchfleet`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "benchfleet",
    version,
    about = "Schedule benchmark experiments across a fleet of hosts.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Benchfleet.toml` in the current working directory.
    #[arg(long, global = true, value_name = "PATH", default_value = "Benchfleet.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BENCHFLEET_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the scheduler until every experiment is finished or failed.
    Run(RunArgs),
    /// Print a per-artifact summary of a scheduler state snapshot.
    Summary(SummaryArgs),
    /// Clear result files of failed experiments so they are scheduled again.
    ResetFailed(ResetArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Perform a single scheduling iteration and exit.
    #[arg(long)]
    pub once: bool,

    /// Parse + validate, scan experiments, print the plan, but don't
    /// contact any host.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct SummaryArgs {
    /// Snapshot to read. Defaults to `[scheduler].state_file`.
    #[arg(long, value_name = "PATH")]
    pub state_file: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ResetArgs {
    /// Only consider experiment directories whose name matches this glob.
    #[arg(long, value_name = "GLOB")]
    pub filter: Option<String>,

    /// Actually delete files (default is to only list them).
    #[arg(long)]
    pub apply: bool,
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
