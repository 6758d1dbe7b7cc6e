// src/ops.rs

//! Operator subcommands that work on disk state without running the loop:
//! the snapshot summary and the failed-experiment reset.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use tracing::{info, warn};

use crate::config::LayoutSection;
use crate::engine::{SnapshotEntry, StatusCounts};
use crate::errors::{FleetError, Result};
use crate::fs::FileSystem;
use crate::store::Experiment;
use crate::types::ExpStatus;

/// Snapshot aggregated for display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    /// Keyed by artifact file name.
    pub per_artifact: BTreeMap<String, StatusCounts>,
    pub overall: StatusCounts,
    /// Host -> (experiment id, elapsed).
    pub running_by_host: BTreeMap<String, Vec<(String, String)>>,
}

pub fn summarize(entries: &[SnapshotEntry]) -> Summary {
    let mut summary = Summary::default();

    for entry in entries {
        let name = entry
            .artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.artifact.to_string_lossy().into_owned());
        let counts = summary.per_artifact.entry(name).or_default();
        for c in [&mut *counts, &mut summary.overall] {
            match entry.status {
                ExpStatus::Todo => c.todo += 1,
                ExpStatus::Running => c.running += 1,
                ExpStatus::Finished => c.finished += 1,
                ExpStatus::Failed => c.failed += 1,
            }
        }

        if entry.status == ExpStatus::Running {
            let host = entry.host.clone().unwrap_or_else(|| "?".to_string());
            let elapsed = entry.elapsed.clone().unwrap_or_else(|| "-".to_string());
            summary
                .running_by_host
                .entry(host)
                .or_default()
                .push((entry.id.clone(), elapsed));
        }
    }

    summary
}

pub fn render_summary(summary: &Summary) -> String {
    let width = summary
        .per_artifact
        .keys()
        .map(|k| k.len())
        .max()
        .unwrap_or(0)
        .max("artifact".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$}  {:>6}  {:>7}  {:>8}  {:>6}",
        "artifact", "todo", "running", "finished", "failed"
    );
    for (name, c) in &summary.per_artifact {
        let _ = writeln!(
            out,
            "{:<width$}  {:>6}  {:>7}  {:>8}  {:>6}",
            name, c.todo, c.running, c.finished, c.failed
        );
    }
    let c = summary.overall;
    let _ = writeln!(
        out,
        "{:<width$}  {:>6}  {:>7}  {:>8}  {:>6}",
        "TOTAL", c.todo, c.running, c.finished, c.failed
    );

    if !summary.running_by_host.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "running jobs by host:");
        for (host, jobs) in &summary.running_by_host {
            let _ = writeln!(out, "  {host} ({})", jobs.len());
            for (id, elapsed) in jobs {
                let _ = writeln!(out, "    {id}  {elapsed}");
            }
        }
    }

    out
}

/// Files that would be removed to make a failed experiment `todo` again.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetPlan {
    pub id: String,
    pub dir: PathBuf,
    /// Raw content of the result marker.
    pub code: String,
    pub files: Vec<PathBuf>,
}

pub fn compile_filter(pattern: Option<&str>) -> Result<Option<GlobMatcher>> {
    pattern
        .map(|p| {
            Glob::new(p)
                .map(|g| g.compile_matcher())
                .map_err(|e| FleetError::ConfigError(format!("invalid --filter glob '{p}': {e}")))
        })
        .transpose()
}

/// Collect every failed experiment (result marker present, code other than
/// the success code) matching `filter`, with the files to delete. The config
/// and metadata files are always kept.
pub fn plan_reset(
    fs: &dyn FileSystem,
    experiments: &[Experiment],
    layout: &LayoutSection,
    filter: Option<&GlobMatcher>,
) -> Result<Vec<ResetPlan>> {
    let mut plans = Vec::new();

    for exp in experiments {
        if filter.is_some_and(|m| !m.is_match(&exp.id)) {
            continue;
        }
        let rc = exp.marker(&layout.result_file);
        if !fs.is_file(&rc) {
            continue;
        }
        let code = fs.read_to_string(&rc)?.trim().to_string();
        if code.parse::<i32>().ok() == Some(layout.success_code) {
            continue;
        }

        let mut files: Vec<PathBuf> = fs
            .read_dir(&exp.dir)?
            .into_iter()
            .filter(|p| fs.is_file(p))
            .filter(|p| !is_kept(p, layout))
            .collect();
        files.sort();

        plans.push(ResetPlan {
            id: exp.id.clone(),
            dir: exp.dir.clone(),
            code,
            files,
        });
    }

    Ok(plans)
}

fn is_kept(path: &Path, layout: &LayoutSection) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == layout.config_file || n == layout.meta_file)
}

/// Delete the planned files. Returns the number removed; individual
/// failures are logged and skipped.
pub fn apply_reset(fs: &dyn FileSystem, plans: &[ResetPlan]) -> usize {
    let mut removed = 0;
    for plan in plans {
        for file in &plan.files {
            match fs.remove_file(file) {
                Ok(()) => removed += 1,
                Err(err) => warn!(experiment = %plan.id, file = ?file, error = %err, "could not remove"),
            }
        }
        info!(experiment = %plan.id, code = %plan.code, "reset to todo");
    }
    removed
}

pub fn render_reset(plans: &[ResetPlan], applied: bool) -> String {
    let mut out = String::new();
    for plan in plans {
        let _ = writeln!(out, "{} (rc={})", plan.id, plan.code);
        for file in &plan.files {
            let _ = writeln!(out, "  {}", file.display());
        }
    }
    let verb = if applied { "reset" } else { "would reset" };
    let _ = writeln!(out, "{verb} {} failed experiment(s)", plans.len());
    out
}
