// src/logging.rs

//! Structured logging via `tracing` + `tracing-subscriber`.
//!
//! The filter comes from, in order: the `--log-level` flag, the
//! `BENCHFLEET_LOG` environment variable (full `EnvFilter` directives such as
//! `benchfleet::remote=debug,info`), then `info`.
//!
//! Everything goes to stderr; stdout carries `summary` and `--dry-run`
//! output only.

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "BENCHFLEET_LOG";

/// Install the global subscriber. Call once, before the scheduler starts.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = build_filter(cli_level, env.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {e}"))
}

fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::new(directive(level)));
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(spec) => EnvFilter::try_new(spec).with_context(|| format!("invalid {LOG_ENV} '{spec}'")),
        None => Ok(EnvFilter::new("info")),
    }
}

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
