// src/store.rs

//! Experiment store: discovers experiments on disk.
//!
//! Each subdirectory of a work directory is one experiment, provided it holds
//! a metadata file. Entries without metadata, or with metadata that does not
//! parse, are skipped with a log line and never reach the scheduler.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::errors::{FleetError, Result};
use crate::fs::FileSystem;
use crate::types::{ExperimentId, Resources};

/// Metadata descriptor written next to each experiment's config by the
/// external config generator.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentMeta {
    pub cpu_requirement: f64,
    /// Megabytes.
    pub memory_requirement: f64,
    /// Local path of the input artifact (trace).
    pub trace_file: PathBuf,
    /// Remote location of the artifact, absolute URL or relative to
    /// `[artifacts].base_url`.
    #[serde(default)]
    pub download_path: Option<String>,
    #[serde(default, alias = "numOps", alias = "tot_req")]
    pub total_ops: Option<u64>,
    #[serde(default)]
    pub uuid: Option<String>,
}

/// A shared input file referenced by one or more experiments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub local_path: PathBuf,
    pub source: Option<String>,
}

/// One schedulable unit of benchmark work.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub id: ExperimentId,
    pub dir: PathBuf,
    pub requirement: Resources,
    pub artifact: ArtifactRef,
    pub total_ops: Option<u64>,
}

impl Experiment {
    /// Path of a marker file inside the experiment directory.
    pub fn marker(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Read-only view over one or more work directories.
#[derive(Debug, Clone)]
pub struct ExperimentStore {
    fs: Arc<dyn FileSystem>,
    meta_file: String,
}

impl ExperimentStore {
    pub fn new(fs: Arc<dyn FileSystem>, meta_file: impl Into<String>) -> Self {
        Self {
            fs,
            meta_file: meta_file.into(),
        }
    }

    /// Scan one work directory. A missing work directory is an error; a
    /// broken experiment inside it is not.
    pub fn scan(&self, work_dir: &Path) -> Result<Vec<Experiment>> {
        if !self.fs.is_dir(work_dir) {
            return Err(FleetError::WorkDirMissing(work_dir.to_path_buf()));
        }

        let mut experiments = Vec::new();
        for entry in self.fs.read_dir(work_dir)? {
            if !self.fs.is_dir(&entry) {
                continue;
            }
            if let Some(exp) = self.load_experiment(&entry) {
                experiments.push(exp);
            }
        }

        experiments.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(experiments)
    }

    /// Scan every work directory and flatten the result. Experiment ids must
    /// be unique across directories because liveness checks look processes
    /// up by id; later duplicates are dropped.
    pub fn scan_all(&self, work_dirs: &[PathBuf]) -> Result<Vec<Experiment>> {
        let mut seen: HashSet<ExperimentId> = HashSet::new();
        let mut all = Vec::new();

        for work_dir in work_dirs {
            let found = self.scan(work_dir)?;
            info!(work_dir = ?work_dir, count = found.len(), "scanned work directory");

            for exp in found {
                if seen.insert(exp.id.clone()) {
                    all.push(exp);
                } else {
                    warn!(
                        experiment = %exp.id,
                        dir = ?exp.dir,
                        "duplicate experiment id in another work directory; skipping"
                    );
                }
            }
        }

        Ok(all)
    }

    fn load_experiment(&self, dir: &Path) -> Option<Experiment> {
        let id = dir.file_name()?.to_str()?.to_string();
        let meta_path = dir.join(&self.meta_file);

        if !self.fs.is_file(&meta_path) {
            debug!(experiment = %id, "no metadata file; skipping");
            return None;
        }

        let meta: ExperimentMeta = match self
            .fs
            .read_to_string(&meta_path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
        {
            Ok(meta) => meta,
            Err(err) => {
                warn!(experiment = %id, error = %err, "malformed metadata; skipping");
                return None;
            }
        };

        let requirement = Resources::new(meta.cpu_requirement, meta.memory_requirement);
        if !valid_requirement(requirement) {
            warn!(
                experiment = %id,
                requirement = %requirement,
                "resource requirement must be finite and non-negative; skipping"
            );
            return None;
        }

        if let Some(uuid) = meta.uuid.as_deref() {
            if uuid != id {
                debug!(experiment = %id, meta_uuid = %uuid, "metadata uuid differs from directory name");
            }
        }

        Some(Experiment {
            id,
            dir: dir.to_path_buf(),
            requirement,
            artifact: ArtifactRef {
                local_path: meta.trace_file,
                source: meta.download_path,
            },
            total_ops: meta.total_ops,
        })
    }
}

fn valid_requirement(r: Resources) -> bool {
    r.cpu.is_finite() && r.mem_mb.is_finite() && r.cpu >= 0.0 && r.mem_mb >= 0.0
}

/// Group experiments by the local path of their artifact.
///
/// Values are indices into `experiments`, in input order.
pub fn group_by_artifact(experiments: &[Experiment]) -> BTreeMap<PathBuf, Vec<usize>> {
    let mut groups: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
    for (idx, exp) in experiments.iter().enumerate() {
        groups
            .entry(exp.artifact.local_path.clone())
            .or_default()
            .push(idx);
    }
    groups
}
