// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{Resources, deserialize_duration};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [scheduler]
/// work_dirs = ["/mnt/exp/work_dir_a", "/mnt/exp/work_dir_b"]
/// hosts_file = "hosts.txt"
/// grace_period = "300s"
///
/// [worker]
/// command = "python3 -c 'from util import run_cachebench; run_cachebench(\"{dir}\")'"
/// cwd = "/opt/bench/exp"
///
/// [artifacts]
/// base_url = "https://traces.example.org"
/// ```
///
/// Every section is optional at the TOML level; required values are
/// enforced by validation (`ConfigFile::try_from`).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub admission: AdmissionSection,

    #[serde(default)]
    pub probe: ProbeSection,

    #[serde(default)]
    pub worker: WorkerSection,

    #[serde(default)]
    pub artifacts: ArtifactSection,

    #[serde(default)]
    pub layout: LayoutSection,
}

/// Validated, immutable configuration handed to the scheduler.
///
/// Only constructed through `TryFrom<RawConfigFile>`; `hosts` is the final
/// ordered host list (inline `hosts` followed by `hosts_file` entries). The
/// first host is the primary (control) host.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub admission: AdmissionSection,
    pub probe: ProbeSection,
    pub worker: WorkerSection,
    pub artifacts: ArtifactSection,
    pub layout: LayoutSection,
    pub hosts: Vec<String>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        let hosts = raw.scheduler.hosts.clone();
        Self {
            scheduler: raw.scheduler,
            admission: raw.admission,
            probe: raw.probe,
            worker: raw.worker,
            artifacts: raw.artifacts,
            layout: raw.layout,
            hosts,
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// Directories whose subdirectories are experiments. All of them are
    /// scanned and flattened into one experiment set.
    #[serde(default)]
    pub work_dirs: Vec<PathBuf>,

    /// Inline host list. Merged with `hosts_file` by the loader.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Plain-text host list, one per line; `#` comments allowed.
    /// Relative paths are resolved against the config file's directory.
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,

    /// Where the observability snapshot is written.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Download missing artifacts and delete them once no longer needed.
    /// When false, every artifact is assumed present and never touched.
    #[serde(default = "default_true")]
    pub manage_artifacts: bool,

    #[serde(default = "default_grace_period", deserialize_with = "deserialize_duration")]
    pub grace_period: Duration,

    /// Sleep after an iteration that made progress.
    #[serde(default = "default_fast_interval", deserialize_with = "deserialize_duration")]
    pub fast_interval: Duration,

    /// Sleep after an idle iteration.
    #[serde(default = "default_slow_interval", deserialize_with = "deserialize_duration")]
    pub slow_interval: Duration,

    #[serde(
        default = "default_reconcile_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub reconcile_interval: Duration,

    /// Pause between two dispatches in the same iteration.
    #[serde(default = "default_dispatch_delay", deserialize_with = "deserialize_duration")]
    pub dispatch_delay: Duration,

    /// Local shell command run once after every experiment is terminal.
    #[serde(default)]
    pub on_complete: Option<String>,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("scheduler_state.json")
}

fn default_true() -> bool {
    true
}

fn default_grace_period() -> Duration {
    Duration::from_secs(300)
}

fn default_fast_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_slow_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_dispatch_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            work_dirs: Vec::new(),
            hosts: Vec::new(),
            hosts_file: None,
            state_file: default_state_file(),
            manage_artifacts: true,
            grace_period: default_grace_period(),
            fast_interval: default_fast_interval(),
            slow_interval: default_slow_interval(),
            reconcile_interval: default_reconcile_interval(),
            dispatch_delay: default_dispatch_delay(),
            on_complete: None,
        }
    }
}

/// `[admission]` section: free-memory thresholds used at dispatch time.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    /// A budget-fitting host must report strictly more free memory than this.
    #[serde(default = "default_min_free_mem_percent")]
    pub min_free_mem_percent: f64,

    /// When no host fits the static budget, a non-primary host reporting at
    /// least this much free memory may take the job anyway.
    #[serde(default = "default_overflow_free_mem_percent")]
    pub overflow_free_mem_percent: f64,
}

fn default_min_free_mem_percent() -> f64 {
    15.0
}

fn default_overflow_free_mem_percent() -> f64 {
    90.0
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            min_free_mem_percent: default_min_free_mem_percent(),
            overflow_free_mem_percent: default_overflow_free_mem_percent(),
        }
    }
}

/// `[probe]` section: how host capacity is turned into a budget.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSection {
    #[serde(default = "default_probe_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    #[serde(
        default = "default_free_mem_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub free_mem_timeout: Duration,

    #[serde(default = "default_primary_cpu_fraction")]
    pub primary_cpu_fraction: f64,

    #[serde(default = "default_primary_mem_fraction")]
    pub primary_mem_fraction: f64,

    #[serde(default = "default_one")]
    pub worker_cpu_fraction: f64,

    #[serde(default = "default_worker_mem_fraction")]
    pub worker_mem_fraction: f64,

    /// Budget used for the primary host when probing fails.
    #[serde(default = "default_primary_fallback")]
    pub primary_fallback: Resources,

    /// Budget used for any other host when probing fails.
    #[serde(default = "default_worker_fallback")]
    pub worker_fallback: Resources,
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_free_mem_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_primary_cpu_fraction() -> f64 {
    0.5
}

fn default_primary_mem_fraction() -> f64 {
    0.4
}

fn default_one() -> f64 {
    1.0
}

fn default_worker_mem_fraction() -> f64 {
    0.9
}

fn default_primary_fallback() -> Resources {
    Resources::new(4.0, 8192.0)
}

fn default_worker_fallback() -> Resources {
    Resources::new(8.0, 16384.0)
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            free_mem_timeout: default_free_mem_timeout(),
            primary_cpu_fraction: default_primary_cpu_fraction(),
            primary_mem_fraction: default_primary_mem_fraction(),
            worker_cpu_fraction: default_one(),
            worker_mem_fraction: default_worker_mem_fraction(),
            primary_fallback: default_primary_fallback(),
            worker_fallback: default_worker_fallback(),
        }
    }
}

/// `[worker]` section: how an experiment is started on a remote host.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Command template. `{dir}` expands to the experiment directory and
    /// `{id}` to the experiment id.
    #[serde(default)]
    pub command: String,

    /// Directory to `cd` into on the remote host before launching.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment variable that carries the experiment id into the worker
    /// process; liveness checks look for it.
    #[serde(default = "default_tag_var")]
    pub tag_var: String,

    /// Worker stdout/stderr, relative to the experiment directory.
    #[serde(default = "default_worker_log")]
    pub log_file: String,

    #[serde(
        default = "default_liveness_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub liveness_timeout: Duration,
}

fn default_tag_var() -> String {
    "BENCHFLEET_ID".to_string()
}

fn default_worker_log() -> String {
    "worker.log".to_string()
}

fn default_liveness_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: String::new(),
            cwd: None,
            tag_var: default_tag_var(),
            log_file: default_worker_log(),
            liveness_timeout: default_liveness_timeout(),
        }
    }
}

/// `[artifacts]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactSection {
    /// Prefix for relative `download_path` values in experiment metadata.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Fraction of the reported free space considered usable.
    #[serde(default = "default_space_margin")]
    pub space_margin: f64,

    #[serde(default = "default_size_timeout", deserialize_with = "deserialize_duration")]
    pub size_timeout: Duration,

    #[serde(
        default = "default_transfer_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub transfer_timeout: Duration,
}

fn default_space_margin() -> f64 {
    0.9
}

fn default_size_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_transfer_timeout() -> Duration {
    Duration::from_secs(6 * 3600)
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            base_url: None,
            space_margin: default_space_margin(),
            size_timeout: default_size_timeout(),
            transfer_timeout: default_transfer_timeout(),
        }
    }
}

/// `[layout]` section: marker file names inside each experiment directory.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutSection {
    #[serde(default = "default_meta_file")]
    pub meta_file: String,

    #[serde(default = "default_config_file")]
    pub config_file: String,

    /// Integer exit code written by the worker on completion.
    #[serde(default = "default_result_file")]
    pub result_file: String,

    /// Host name written by the scheduler on dispatch.
    #[serde(default = "default_lock_file")]
    pub lock_file: String,

    /// Appended to `lock_file` to name the grace marker.
    #[serde(default = "default_grace_suffix")]
    pub grace_suffix: String,

    #[serde(default)]
    pub success_code: i32,

    /// Exit code recorded when a process vanished without a result.
    #[serde(default = "default_stale_code")]
    pub stale_code: i32,
}

impl LayoutSection {
    pub fn grace_file(&self) -> String {
        format!("{}{}", self.lock_file, self.grace_suffix)
    }
}

fn default_meta_file() -> String {
    "meta.json".to_string()
}

fn default_config_file() -> String {
    "config.json".to_string()
}

fn default_result_file() -> String {
    "rc.txt".to_string()
}

fn default_lock_file() -> String {
    "running.lock".to_string()
}

fn default_grace_suffix() -> String {
    ".grace".to_string()
}

fn default_stale_code() -> i32 {
    -99
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            meta_file: default_meta_file(),
            config_file: default_config_file(),
            result_file: default_result_file(),
            lock_file: default_lock_file(),
            grace_suffix: default_grace_suffix(),
            success_code: 0,
            stale_code: default_stale_code(),
        }
    }
}
