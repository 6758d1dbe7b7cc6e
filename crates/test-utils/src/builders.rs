#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use benchfleet::config::{ConfigFile, RawConfigFile};
use benchfleet::fs::mock::MockFileSystem;
use benchfleet::types::Resources;

/// Builder for `ConfigFile` with test-friendly defaults: one work dir at
/// `/work`, no pause between dispatches, artifact management on.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.scheduler.work_dirs = vec![PathBuf::from("/work")];
        config.scheduler.state_file = PathBuf::from("/state/scheduler_state.json");
        config.scheduler.dispatch_delay = Duration::ZERO;
        config.scheduler.fast_interval = Duration::from_millis(1);
        config.scheduler.slow_interval = Duration::from_millis(1);
        config.worker.command = "run-bench {dir}".to_string();
        Self { config }
    }

    pub fn with_hosts(mut self, hosts: &[&str]) -> Self {
        self.config.scheduler.hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: &str) -> Self {
        self.config.scheduler.work_dirs.push(PathBuf::from(dir));
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.config.scheduler.grace_period = grace;
        self
    }

    pub fn with_manage_artifacts(mut self, manage: bool) -> Self {
        self.config.scheduler.manage_artifacts = manage;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler.reconcile_interval = interval;
        self
    }

    pub fn with_fallback_budgets(mut self, primary: Resources, worker: Resources) -> Self {
        self.config.probe.primary_fallback = primary;
        self.config.probe.worker_fallback = worker;
        self
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.config.artifacts.base_url = Some(url.to_string());
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lays out experiment directories on a `MockFileSystem`.
#[derive(Debug, Clone)]
pub struct ExperimentFixture {
    pub fs: MockFileSystem,
    pub work_dir: PathBuf,
}

impl ExperimentFixture {
    pub fn new(work_dir: &str) -> Self {
        let fs = MockFileSystem::new();
        fs.add_dir(work_dir);
        Self {
            fs,
            work_dir: PathBuf::from(work_dir),
        }
    }

    /// Share the filesystem of another fixture (second work dir).
    pub fn sharing(other: &ExperimentFixture, work_dir: &str) -> Self {
        other.fs.add_dir(work_dir);
        Self {
            fs: other.fs.clone(),
            work_dir: PathBuf::from(work_dir),
        }
    }

    pub fn dir(&self, id: &str) -> PathBuf {
        self.work_dir.join(id)
    }

    pub fn path(&self, id: &str, file: &str) -> PathBuf {
        self.dir(id).join(file)
    }

    /// Experiment `id` needing `cpu` / `mem_mb`, reading `trace`.
    pub fn experiment(&self, id: &str, cpu: f64, mem_mb: f64, trace: &str) -> &Self {
        let meta = format!(
            r#"{{"cpu_requirement": {cpu}, "memory_requirement": {mem_mb}, "trace_file": "{trace}", "download_path": "{trace}", "uuid": "{id}"}}"#
        );
        self.fs.add_file(self.path(id, "meta.json"), meta);
        self.fs.add_file(self.path(id, "config.json"), "{}");
        self
    }

    pub fn result(&self, id: &str, code: &str) -> &Self {
        self.fs.add_file(self.path(id, "rc.txt"), code);
        self
    }

    pub fn lock(&self, id: &str, host: &str) -> &Self {
        self.fs.add_file(self.path(id, "running.lock"), host);
        self
    }

    pub fn grace(&self, id: &str, epoch_secs: f64) -> &Self {
        self.fs
            .add_file(self.path(id, "running.lock.grace"), epoch_secs.to_string());
        self
    }

    /// Make an artifact present.
    pub fn artifact(&self, path: &str) -> &Self {
        self.fs.add_file(path, "trace bytes");
        self
    }

    pub fn exists(&self, id: &str, file: &str) -> bool {
        self.fs.contents(self.path(id, file)).is_some()
    }

    pub fn read(&self, id: &str, file: &str) -> Option<String> {
        self.fs.contents(self.path(id, file))
    }
}
