// src/types.rs

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Canonical experiment identifier (the experiment directory name).
pub type ExperimentId = String;

/// Status of an experiment, always inferred from its directory contents.
///
/// - `Todo`: no result marker and no running lock.
/// - `Running`: a lock names a host and the process is alive, unverifiable,
///   or inside its grace period.
/// - `Failed`: result marker with a non-success code (including the stale
///   sentinel written after the grace period).
/// - `Finished`: result marker with the success code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpStatus {
    Todo,
    Running,
    Failed,
    Finished,
}

impl ExpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExpStatus::Failed | ExpStatus::Finished)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExpStatus::Todo => "todo",
            ExpStatus::Running => "running",
            ExpStatus::Failed => "failed",
            ExpStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for ExpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer of a remote liveness query.
///
/// `Unknown` covers every transport or command failure. Callers must treat
/// it like `Alive` so that an experiment is never dispatched twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Unknown,
}

/// CPU units and memory (MB) either required by an experiment or budgeted
/// on a host.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub mem_mb: f64,
}

impl Resources {
    pub const ZERO: Resources = Resources { cpu: 0.0, mem_mb: 0.0 };

    pub fn new(cpu: f64, mem_mb: f64) -> Self {
        Self { cpu, mem_mb }
    }

    /// Whether `self + extra` stays within `budget` on both axes.
    pub fn fits_with(self, extra: Resources, budget: Resources) -> bool {
        self.cpu + extra.cpu <= budget.cpu && self.mem_mb + extra.mem_mb <= budget.mem_mb
    }

    pub fn add(self, other: Resources) -> Resources {
        Resources::new(self.cpu + other.cpu, self.mem_mb + other.mem_mb)
    }

    /// Subtract, clamping each axis at zero.
    pub fn saturating_sub(self, other: Resources) -> Resources {
        Resources::new(
            (self.cpu - other.cpu).max(0.0),
            (self.mem_mb - other.mem_mb).max(0.0),
        )
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cpu / {} MB", self.cpu, self.mem_mb)
    }
}

/// Parse a human duration such as `"300s"`, `"1500ms"`, `"5m"` or `"6h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

/// `serde` adapter for duration strings in the config file.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Format a duration as `H:MM:SS` for logs and snapshots.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_units() {
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn fit_check_is_inclusive() {
        let budget = Resources::new(4.0, 8192.0);
        let used = Resources::new(2.0, 4096.0);
        assert!(used.fits_with(Resources::new(2.0, 4096.0), budget));
        assert!(!used.fits_with(Resources::new(2.5, 1.0), budget));
    }

    #[test]
    fn elapsed_format() {
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "1:02:05");
        assert_eq!(format_elapsed(Duration::from_secs(59)), "0:00:59");
    }
}
