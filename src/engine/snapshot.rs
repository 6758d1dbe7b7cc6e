// src/engine/snapshot.rs

//! Observability snapshot: a JSON array with one object per experiment.
//!
//! Written periodically and at shutdown for operators and external tools.
//! The scheduler never reads it back; only the `summary` subcommand does.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::status::clock::epoch_secs;
use crate::store::Experiment;
use crate::types::{ExpStatus, ExperimentId, format_elapsed};

use super::ledger::{Admission, RunningJob};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: ExperimentId,
    pub status: ExpStatus,
    pub host: Option<String>,
    pub artifact: PathBuf,
    /// ISO-8601, local time.
    pub start_time: Option<String>,
    pub start_time_unix: Option<f64>,
    /// `H:MM:SS`.
    pub elapsed: Option<String>,
    pub admission: Option<Admission>,
}

impl SnapshotEntry {
    pub fn new(
        exp: &Experiment,
        status: ExpStatus,
        job: Option<&RunningJob>,
        now: SystemTime,
    ) -> Self {
        let start = job.map(|j| j.started_at);
        Self {
            id: exp.id.clone(),
            status,
            host: job.map(|j| j.host.clone()),
            artifact: exp.artifact.local_path.clone(),
            start_time: start.map(iso8601),
            start_time_unix: start.map(epoch_secs),
            elapsed: start.map(|s| format_elapsed(now.duration_since(s).unwrap_or(Duration::ZERO))),
            admission: job.map(|j| j.admission),
        }
    }
}

pub fn iso8601(t: SystemTime) -> String {
    DateTime::<Local>::from(t).to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot file. Readers never see a half-written file.
    pub fn write(&self, entries: &[SnapshotEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = crate::artifact::partial_path(&self.path);
        self.fs.write(&tmp, &json)?;
        self.fs.rename(&tmp, &self.path)?;
        Ok(())
    }
}

pub fn read_snapshot(fs: &dyn FileSystem, path: &Path) -> Result<Vec<SnapshotEntry>> {
    let raw = fs.read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
