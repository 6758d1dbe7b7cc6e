// src/engine/scheduler.rs

//! The scheduler control loop.
//!
//! One instance owns all mutable scheduling state (the [`ResourceLedger`])
//! and advances it one [`tick`](Scheduler::tick) at a time. Everything that
//! survives a restart lives in marker files; the ledger is rebuilt from
//! them in [`Scheduler::start`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactManager, ArtifactSource, HttpArtifactSource};
use crate::config::ConfigFile;
use crate::errors::{FleetError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::remote::{Dispatcher, HostProbe, LivenessVerifier, RemoteShell, SshShell};
use crate::status::{Clock, StatusResolver, SystemClock};
use crate::store::{Experiment, ExperimentStore, group_by_artifact};
use crate::types::{ExpStatus, ExperimentId, Resources, format_elapsed};

use super::ledger::{Admission, ResourceLedger, RunningJob};
use super::policy::{AdmissionPolicy, ArtifactAffinity, ArtifactStats, Candidate, Prioritizer};
use super::snapshot::{SnapshotEntry, SnapshotWriter};

/// Collaborators the scheduler talks to. Production wiring comes from
/// [`SchedulerDeps::production`]; tests swap in fakes.
#[derive(Debug)]
pub struct SchedulerDeps {
    pub fs: Arc<dyn FileSystem>,
    pub shell: Arc<dyn RemoteShell>,
    pub artifacts: Arc<dyn ArtifactSource>,
    pub clock: Arc<dyn Clock>,
    pub prioritizer: Box<dyn Prioritizer>,
}

impl SchedulerDeps {
    pub fn production(cfg: &ConfigFile) -> Result<Self> {
        Ok(Self {
            fs: Arc::new(RealFileSystem),
            shell: Arc::new(SshShell::new()),
            artifacts: Arc::new(HttpArtifactSource::new(&cfg.artifacts)?),
            clock: Arc::new(SystemClock),
            prioritizer: Box::new(ArtifactAffinity::from_entropy()),
        })
    }
}

/// Count of experiments per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub todo: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a ExpStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                ExpStatus::Todo => counts.todo += 1,
                ExpStatus::Running => counts.running += 1,
                ExpStatus::Finished => counts.finished += 1,
                ExpStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.todo + self.running + self.finished + self.failed
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "todo={} running={} finished={} failed={}",
            self.todo, self.running, self.finished, self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub id: ExperimentId,
    pub host: String,
    pub admission: Admission,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadAttempt {
    pub artifact: PathBuf,
    pub ok: bool,
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Jobs that left the running table, with the status they left in.
    pub reaped: Vec<(ExperimentId, ExpStatus)>,
    /// Running experiments found without a table entry and taken over.
    pub adopted: Vec<ExperimentId>,
    pub reclaimed: Vec<PathBuf>,
    pub dispatched: Vec<DispatchRecord>,
    pub download: Option<DownloadAttempt>,
    pub counts: StatusCounts,
    /// A dispatch or download attempt happened; the next sleep is short.
    pub progress: bool,
    /// Nothing running and every experiment terminal.
    pub done: bool,
}

/// Why [`Scheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    SingleIteration,
    Interrupted,
}

pub struct Scheduler {
    cfg: ConfigFile,
    experiments: Vec<Experiment>,
    by_id: HashMap<ExperimentId, usize>,
    groups: BTreeMap<PathBuf, Vec<usize>>,
    resolver: StatusResolver,
    probe: HostProbe,
    dispatcher: Dispatcher,
    artifacts: ArtifactManager,
    prioritizer: Box<dyn Prioritizer>,
    admission: AdmissionPolicy,
    ledger: ResourceLedger,
    snapshot: SnapshotWriter,
    clock: Arc<dyn Clock>,
    statuses: Vec<ExpStatus>,
    last_reconcile: Option<SystemTime>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("experiments", &self.experiments.len())
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Scan the work directories, probe every host and rebuild the running
    /// table from lock markers.
    ///
    /// A missing work directory is fatal. Every running job found here gets
    /// the current time as its start time.
    pub async fn start(cfg: ConfigFile, deps: SchedulerDeps) -> Result<Self> {
        let SchedulerDeps {
            fs,
            shell,
            artifacts,
            clock,
            prioritizer,
        } = deps;

        let store = ExperimentStore::new(fs.clone(), cfg.layout.meta_file.clone());
        let experiments = store.scan_all(&cfg.scheduler.work_dirs)?;
        if experiments.is_empty() {
            warn!("no experiments found in any work directory");
        }

        let probe = HostProbe::new(shell.clone(), cfg.probe.clone());
        let hosts = probe.discover(&cfg.hosts).await;
        if hosts.is_empty() {
            return Err(FleetError::NoHosts("host list is empty".to_string()));
        }

        let liveness = Arc::new(LivenessVerifier::new(
            shell.clone(),
            cfg.worker.tag_var.clone(),
            cfg.worker.liveness_timeout,
        ));
        let resolver = StatusResolver::new(
            fs.clone(),
            liveness,
            clock.clone(),
            cfg.layout.clone(),
            cfg.scheduler.grace_period,
        );
        let dispatcher = Dispatcher::new(
            shell,
            fs.clone(),
            cfg.worker.clone(),
            cfg.layout.lock_file.clone(),
        );
        let artifact_mgr = ArtifactManager::new(artifacts, fs.clone(), &cfg.artifacts);
        let snapshot = SnapshotWriter::new(fs, cfg.scheduler.state_file.clone());

        let by_id = experiments
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        let groups = group_by_artifact(&experiments);

        let mut scheduler = Self {
            admission: AdmissionPolicy::from(&cfg.admission),
            statuses: vec![ExpStatus::Todo; experiments.len()],
            cfg,
            experiments,
            by_id,
            groups,
            resolver,
            probe,
            dispatcher,
            artifacts: artifact_mgr,
            prioritizer,
            ledger: ResourceLedger::new(hosts),
            snapshot,
            clock,
            last_reconcile: None,
        };

        scheduler.warn_oversized();
        scheduler.reconstruct().await;
        Ok(scheduler)
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Status of every experiment as of the last tick (or startup).
    pub fn statuses(&self) -> &[ExpStatus] {
        &self.statuses
    }

    pub fn status_of(&self, id: &str) -> Option<ExpStatus> {
        self.by_id.get(id).map(|&i| self.statuses[i])
    }

    fn warn_oversized(&self) {
        for exp in &self.experiments {
            let fits_anywhere = self
                .ledger
                .slots()
                .iter()
                .any(|s| Resources::ZERO.fits_with(exp.requirement, s.host.budget));
            if !fits_anywhere {
                warn!(
                    experiment = %exp.id,
                    requirement = %exp.requirement,
                    "requirement exceeds every host budget; only overflow admission can place it"
                );
            }
        }
    }

    async fn reconstruct(&mut self) {
        let now = self.clock.now();
        for idx in 0..self.experiments.len() {
            let status = self.resolver.status(&self.experiments[idx]).await;
            self.statuses[idx] = status;
            if status == ExpStatus::Running {
                self.track_recovered(idx, now);
            }
        }

        let counts = StatusCounts::tally(&self.statuses);
        info!(
            experiments = counts.total(),
            running = self.ledger.len(),
            %counts,
            "scheduler state reconstructed"
        );
    }

    /// Put a running experiment found on disk into the table under the
    /// host its lock names.
    fn track_recovered(&mut self, idx: usize, now: SystemTime) -> bool {
        let exp = &self.experiments[idx];
        let Some(host) = self.resolver.lock_host(exp) else {
            warn!(experiment = %exp.id, "running without a readable lock host; not tracked");
            return false;
        };
        info!(experiment = %exp.id, host = %host, "tracking running experiment");
        self.ledger.reserve(RunningJob {
            id: exp.id.clone(),
            host,
            started_at: now,
            demand: exp.requirement,
            admission: Admission::Recovered,
        });
        true
    }

    /// One scheduling iteration. Never fails: every remote or filesystem
    /// problem inside is logged and retried on a later tick.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        let now = self.clock.now();

        self.reap(&mut report).await;
        self.refresh_statuses(now, &mut report).await;

        if self.cfg.scheduler.manage_artifacts {
            self.reclaim(&mut report);
        }

        let ordered = self.ranked_todo();
        self.admit(&ordered, now, &mut report).await;

        if report.dispatched.is_empty() && self.cfg.scheduler.manage_artifacts {
            self.fallback_download(&ordered, &mut report).await;
        }

        report.counts = StatusCounts::tally(&self.statuses);
        report.progress = !report.dispatched.is_empty() || report.download.is_some();
        report.done = self.ledger.is_empty() && self.statuses.iter().all(|s| s.is_terminal());
        info!(counts = %report.counts, running_jobs = self.ledger.len(), "status summary");

        let reconcile_due = self.last_reconcile.is_none_or(|last| {
            now.duration_since(last).unwrap_or(Duration::ZERO)
                >= self.cfg.scheduler.reconcile_interval
        });
        if reconcile_due {
            self.reconcile(now).await;
            self.last_reconcile = Some(now);
        }

        report
    }

    async fn reap(&mut self, report: &mut TickReport) {
        for id in self.ledger.running_ids() {
            let Some(&idx) = self.by_id.get(&id) else {
                self.ledger.release(&id);
                continue;
            };
            let status = self.resolver.status(&self.experiments[idx]).await;
            self.statuses[idx] = status;
            if status == ExpStatus::Running {
                continue;
            }
            if let Some(job) = self.ledger.release(&id) {
                let elapsed = self
                    .clock
                    .now()
                    .duration_since(job.started_at)
                    .unwrap_or(Duration::ZERO);
                info!(
                    experiment = %id,
                    host = %job.host,
                    status = %status,
                    elapsed = %format_elapsed(elapsed),
                    "job left running state; resources released"
                );
            }
            report.reaped.push((id, status));
        }
    }

    /// Recompute every status not already settled by reaping, and adopt
    /// running experiments missing from the table.
    async fn refresh_statuses(&mut self, now: SystemTime, report: &mut TickReport) {
        for idx in 0..self.experiments.len() {
            let id = &self.experiments[idx].id;
            if self.ledger.is_running(id) || report.reaped.iter().any(|(r, _)| r == id) {
                continue;
            }
            let status = self.resolver.status(&self.experiments[idx]).await;
            self.statuses[idx] = status;
            if status == ExpStatus::Running && self.track_recovered(idx, now) {
                report.adopted.push(self.experiments[idx].id.clone());
            }
        }
    }

    fn reclaim(&mut self, report: &mut TickReport) {
        for (path, members) in &self.groups {
            let all_terminal = members.iter().all(|&i| self.statuses[i].is_terminal());
            let none_running = members
                .iter()
                .all(|&i| !self.ledger.is_running(&self.experiments[i].id));
            if !(all_terminal && none_running) {
                continue;
            }
            let Some(&first) = members.first() else {
                continue;
            };
            if self.artifacts.reclaim(&self.experiments[first].artifact) {
                report.reclaimed.push(path.clone());
            }
        }
    }

    /// Pending experiments in dispatch order.
    fn ranked_todo(&mut self) -> Vec<Candidate> {
        let mut stats: HashMap<&PathBuf, ArtifactStats> = HashMap::new();
        for (path, members) in &self.groups {
            let entry = stats.entry(path).or_default();
            for &i in members {
                match self.statuses[i] {
                    ExpStatus::Finished => entry.finished += 1,
                    ExpStatus::Todo => entry.pending += 1,
                    _ => {}
                }
            }
        }

        let mut candidates: Vec<Candidate> = self
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == ExpStatus::Todo)
            .map(|(index, _)| Candidate {
                index,
                stats: stats
                    .get(&self.experiments[index].artifact.local_path)
                    .copied()
                    .unwrap_or_default(),
            })
            .collect();

        self.prioritizer.order(&mut candidates);
        candidates
    }

    async fn admit(&mut self, ordered: &[Candidate], now: SystemTime, report: &mut TickReport) {
        let mut free_mem: HashMap<String, Option<f64>> = HashMap::new();

        for cand in ordered {
            let idx = cand.index;
            let exp = &self.experiments[idx];

            if self.cfg.scheduler.manage_artifacts && !self.artifacts.is_present(&exp.artifact) {
                debug!(experiment = %exp.id, artifact = ?exp.artifact.local_path, "artifact not present; skipping");
                continue;
            }

            let Some((host, admission)) = self.choose_host(exp.requirement, &mut free_mem).await
            else {
                debug!(experiment = %exp.id, requirement = %exp.requirement, "no host available");
                continue;
            };

            if !report.dispatched.is_empty() {
                tokio::time::sleep(self.cfg.scheduler.dispatch_delay).await;
            }

            if let Err(err) = self.dispatcher.dispatch(exp, &host).await {
                warn!(experiment = %exp.id, host = %host, error = %err, "dispatch failed; will retry");
                continue;
            }

            if admission == Admission::Overflow {
                warn!(
                    experiment = %exp.id,
                    host = %host,
                    used = %self.ledger.used_on(&host),
                    requirement = %exp.requirement,
                    "overflow admission: host is idle but past its static budget"
                );
            }

            self.ledger.reserve(RunningJob {
                id: exp.id.clone(),
                host: host.clone(),
                started_at: now,
                demand: exp.requirement,
                admission,
            });
            free_mem.remove(&host);
            self.statuses[idx] = ExpStatus::Running;
            report.dispatched.push(DispatchRecord {
                id: exp.id.clone(),
                host,
                admission,
            });
        }
    }

    /// Budget-fitting hosts first; only when none fits at all, the idle
    /// non-primary hosts.
    async fn choose_host(
        &self,
        demand: Resources,
        free_mem: &mut HashMap<String, Option<f64>>,
    ) -> Option<(String, Admission)> {
        let fitting: Vec<String> = self
            .ledger
            .fitting_hosts(demand)
            .into_iter()
            .map(str::to_string)
            .collect();

        let (pool, admission) = if fitting.is_empty() {
            let overflow: Vec<String> = self
                .ledger
                .overflow_hosts()
                .into_iter()
                .map(str::to_string)
                .collect();
            (overflow, Admission::Overflow)
        } else {
            (fitting, Admission::Budgeted)
        };

        let mut readings = Vec::with_capacity(pool.len());
        for host in &pool {
            let reading = match free_mem.get(host) {
                Some(cached) => *cached,
                None => {
                    let fresh = self.probe.free_mem_percent(host).await;
                    free_mem.insert(host.clone(), fresh);
                    fresh
                }
            };
            readings.push((host.as_str(), reading));
        }

        let picked = match admission {
            Admission::Overflow => self.admission.pick_overflow(&readings),
            _ => self.admission.pick_budgeted(&readings),
        }?;
        Some((picked.0.to_string(), admission))
    }

    /// Nothing could be dispatched: fetch one missing artifact so the next
    /// tick has something to work with.
    async fn fallback_download(&mut self, ordered: &[Candidate], report: &mut TickReport) {
        let missing = ordered
            .iter()
            .map(|c| &self.experiments[c.index])
            .find(|e| !self.artifacts.is_present(&e.artifact));
        let Some(exp) = missing else {
            return;
        };

        info!(experiment = %exp.id, artifact = ?exp.artifact.local_path, "idle tick; fetching an artifact");
        let ok = self.artifacts.ensure_present(&exp.artifact).await;
        report.download = Some(DownloadAttempt {
            artifact: exp.artifact.local_path.clone(),
            ok,
        });
    }

    /// Log host utilisation and job runtimes, then persist the snapshot.
    async fn reconcile(&self, now: SystemTime) {
        for slot in self.ledger.slots() {
            let name = &slot.host.name;
            let cpu = self.probe.cpu_util_percent(name).await;
            let mem = self.probe.free_mem_percent(name).await;
            info!(
                host = %name,
                cpu_util = %fmt_percent(cpu),
                free_mem = %fmt_percent(mem),
                reserved = %slot.used,
                budget = %slot.host.budget,
                "host utilisation"
            );
        }
        info!(
            reserved = %self.ledger.total_used(),
            budget = %self.ledger.total_budget(),
            jobs = self.ledger.len(),
            "fleet reservation"
        );

        for job in self.ledger.jobs() {
            let elapsed = now.duration_since(job.started_at).unwrap_or(Duration::ZERO);
            info!(
                experiment = %job.id,
                host = %job.host,
                admission = ?job.admission,
                elapsed = %format_elapsed(elapsed),
                "running job"
            );
        }

        self.write_snapshot(now);
    }

    pub fn snapshot_entries(&self, now: SystemTime) -> Vec<SnapshotEntry> {
        self.experiments
            .iter()
            .zip(&self.statuses)
            .map(|(exp, &status)| SnapshotEntry::new(exp, status, self.ledger.job(&exp.id), now))
            .collect()
    }

    fn write_snapshot(&self, now: SystemTime) {
        let entries = self.snapshot_entries(now);
        match self.snapshot.write(&entries) {
            Ok(()) => debug!(path = ?self.snapshot.path(), entries = entries.len(), "snapshot written"),
            Err(err) => warn!(path = ?self.snapshot.path(), error = %err, "could not write snapshot"),
        }
    }

    /// Tick until every experiment is terminal (or once, with `once`),
    /// sleeping briefly after productive ticks and longer after idle ones.
    /// Ctrl-C stops the loop between ticks.
    pub async fn run(&mut self, once: bool) -> Result<RunOutcome> {
        info!(
            experiments = self.experiments.len(),
            hosts = self.ledger.slots().len(),
            "scheduler loop started"
        );

        let outcome = loop {
            let report = self.tick().await;
            if report.done {
                info!(counts = %report.counts, "all experiments terminal");
                break RunOutcome::Completed;
            }
            if once {
                break RunOutcome::SingleIteration;
            }

            let pause = if report.progress {
                self.cfg.scheduler.fast_interval
            } else {
                self.cfg.scheduler.slow_interval
            };
            debug!(?pause, progress = report.progress, "sleeping until next tick");

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(error = %e, "failed to listen for Ctrl+C");
                    }
                    info!("interrupted; stopping after current tick");
                    break RunOutcome::Interrupted;
                }
            }
        };

        self.write_snapshot(self.clock.now());

        if outcome == RunOutcome::Completed {
            if let Some(cmd) = self.cfg.scheduler.on_complete.clone() {
                run_completion_hook(&cmd).await;
            }
        }

        info!(?outcome, "scheduler loop finished");
        Ok(outcome)
    }
}

fn fmt_percent(value: Option<f64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| format!("{v:.1}%"))
}

async fn run_completion_hook(cmd: &str) {
    info!(cmd = %cmd, "running completion hook");
    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => info!("completion hook finished"),
        Ok(s) => warn!(code = ?s.code(), "completion hook exited with failure"),
        Err(err) => warn!(error = %err, "could not start completion hook"),
    }
}
