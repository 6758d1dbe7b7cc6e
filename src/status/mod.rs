// src/status/mod.rs

//! Experiment status resolution.
//!
//! Status is never stored: it is recomputed from the marker files in an
//! experiment directory on every call.
//!
//! 1. A result marker wins. Its code maps to `finished` or `failed`, and any
//!    leftover lock or grace marker is removed.
//! 2. Otherwise a lock naming a host means the worker was dispatched. The
//!    host is asked whether the worker is alive:
//!    - alive or unanswerable: `running`;
//!    - confirmed gone: a grace marker records when that was first seen and
//!      the experiment stays `running` until the grace period runs out, at
//!      which point the stale code is written as the result and the
//!      experiment becomes `failed`.
//! 3. Otherwise `todo`.

pub mod clock;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::LayoutSection;
use crate::fs::FileSystem;
use crate::remote::LivenessCheck;
use crate::store::Experiment;
use crate::types::{ExpStatus, Liveness};

pub use clock::{Clock, ManualClock, SystemClock};

#[derive(Debug, Clone)]
pub struct StatusResolver {
    fs: Arc<dyn FileSystem>,
    liveness: Arc<dyn LivenessCheck>,
    clock: Arc<dyn Clock>,
    layout: LayoutSection,
    grace_period: Duration,
}

impl StatusResolver {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        liveness: Arc<dyn LivenessCheck>,
        clock: Arc<dyn Clock>,
        layout: LayoutSection,
        grace_period: Duration,
    ) -> Self {
        Self {
            fs,
            liveness,
            clock,
            layout,
            grace_period,
        }
    }

    /// Resolve the current status of `exp`, applying marker cleanup and
    /// grace-period transitions as side effects.
    pub async fn status(&self, exp: &Experiment) -> ExpStatus {
        if let Some(status) = self.terminal_status(exp) {
            return status;
        }

        let Some(host) = self.lock_host(exp) else {
            return ExpStatus::Todo;
        };

        match self.liveness.check(&host, &exp.id).await {
            Liveness::Alive => {
                self.clear_grace(exp);
                ExpStatus::Running
            }
            Liveness::Unknown => ExpStatus::Running,
            Liveness::Dead => self.on_confirmed_dead(exp, &host),
        }
    }

    /// See [`marker_status`].
    pub fn marker_status(&self, exp: &Experiment) -> ExpStatus {
        marker_status(self.fs.as_ref(), &self.layout, exp)
    }

    /// Host recorded in the lock marker, if any.
    pub fn lock_host(&self, exp: &Experiment) -> Option<String> {
        lock_host(self.fs.as_ref(), &self.layout, exp)
    }

    fn terminal_status(&self, exp: &Experiment) -> Option<ExpStatus> {
        let rc = exp.marker(&self.layout.result_file);
        if !self.fs.is_file(&rc) {
            return None;
        }
        let status = code_status(self.fs.as_ref(), &self.layout, exp, &rc);
        self.remove_marker(exp, &self.layout.lock_file);
        self.remove_marker(exp, &self.layout.grace_file());
        Some(status)
    }

    fn on_confirmed_dead(&self, exp: &Experiment, host: &str) -> ExpStatus {
        let now = self.clock.now();
        let grace = exp.marker(&self.layout.grace_file());

        let first_seen = self
            .fs
            .read_to_string(&grace)
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .and_then(clock::from_epoch_secs);

        let Some(first_seen) = first_seen else {
            let stamp = format!("{}", clock::epoch_secs(now));
            match self.fs.write(&grace, stamp.as_bytes()) {
                Ok(()) => warn!(
                    experiment = %exp.id,
                    host = %host,
                    grace_secs = self.grace_period.as_secs(),
                    "worker not found; grace period started"
                ),
                Err(err) => error!(experiment = %exp.id, error = %err, "could not write grace marker"),
            }
            return ExpStatus::Running;
        };

        let waited = now.duration_since(first_seen).unwrap_or(Duration::ZERO);
        if waited < self.grace_period {
            debug!(
                experiment = %exp.id,
                host = %host,
                waited_secs = waited.as_secs(),
                "inside grace period"
            );
            return ExpStatus::Running;
        }

        // The worker may have written its result while we were asking.
        if let Some(status) = self.terminal_status(exp) {
            return status;
        }

        let rc = exp.marker(&self.layout.result_file);
        let code = self.layout.stale_code.to_string();
        if let Err(err) = self.fs.write(&rc, code.as_bytes()) {
            error!(experiment = %exp.id, error = %err, "could not record stale result; will retry");
            return ExpStatus::Running;
        }
        self.remove_marker(exp, &self.layout.lock_file);
        self.remove_marker(exp, &self.layout.grace_file());

        warn!(
            experiment = %exp.id,
            host = %host,
            code = self.layout.stale_code,
            waited_secs = waited.as_secs(),
            "grace period expired without a result; marked failed"
        );
        ExpStatus::Failed
    }

    fn clear_grace(&self, exp: &Experiment) {
        let grace = exp.marker(&self.layout.grace_file());
        if self.fs.is_file(&grace) {
            debug!(experiment = %exp.id, "worker visible again; clearing grace marker");
            self.remove_marker(exp, &self.layout.grace_file());
        }
    }

    fn remove_marker(&self, exp: &Experiment, name: &str) {
        let path = exp.marker(name);
        if !self.fs.is_file(&path) {
            return;
        }
        if let Err(err) = self.fs.remove_file(&path) {
            warn!(experiment = %exp.id, marker = %name, error = %err, "could not remove marker");
        }
    }
}

/// Status from marker files alone: no remote queries, no side effects.
/// A lock counts as `running` whether or not the worker still exists.
pub fn marker_status(fs: &dyn FileSystem, layout: &LayoutSection, exp: &Experiment) -> ExpStatus {
    let rc = exp.marker(&layout.result_file);
    if fs.is_file(&rc) {
        return code_status(fs, layout, exp, &rc);
    }
    if lock_host(fs, layout, exp).is_some() {
        ExpStatus::Running
    } else {
        ExpStatus::Todo
    }
}

/// Host recorded in the lock marker of `exp`, if any.
pub fn lock_host(fs: &dyn FileSystem, layout: &LayoutSection, exp: &Experiment) -> Option<String> {
    let lock = exp.marker(&layout.lock_file);
    if !fs.is_file(&lock) {
        return None;
    }
    match fs.read_to_string(&lock) {
        Ok(raw) => {
            let host = raw.trim();
            (!host.is_empty()).then(|| host.to_string())
        }
        Err(err) => {
            warn!(experiment = %exp.id, error = %err, "unreadable lock marker");
            None
        }
    }
}

fn code_status(fs: &dyn FileSystem, layout: &LayoutSection, exp: &Experiment, rc: &Path) -> ExpStatus {
    let raw = match fs.read_to_string(rc) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(experiment = %exp.id, error = %err, "unreadable result marker; counting as failed");
            return ExpStatus::Failed;
        }
    };
    match raw.trim().parse::<i32>() {
        Ok(code) if code == layout.success_code => ExpStatus::Finished,
        Ok(_) => ExpStatus::Failed,
        Err(_) => {
            warn!(experiment = %exp.id, content = %raw.trim(), "unparseable result marker; counting as failed");
            ExpStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::remote::BoxFuture;
    use crate::store::ArtifactRef;
    use crate::types::Resources;

    #[derive(Debug)]
    struct FixedLiveness(Mutex<Liveness>);

    impl LivenessCheck for FixedLiveness {
        fn check<'a>(&'a self, _host: &'a str, _id: &'a str) -> BoxFuture<'a, Liveness> {
            let answer = *self.0.lock().unwrap();
            Box::pin(async move { answer })
        }
    }

    fn exp() -> Experiment {
        Experiment {
            id: "e1".to_string(),
            dir: PathBuf::from("/w/e1"),
            requirement: Resources::new(1.0, 1.0),
            artifact: ArtifactRef {
                local_path: PathBuf::from("/t"),
                source: None,
            },
            total_ops: None,
        }
    }

    fn resolver(fs: &MockFileSystem, answer: Liveness, clock: Arc<ManualClock>) -> StatusResolver {
        StatusResolver::new(
            Arc::new(fs.clone()),
            Arc::new(FixedLiveness(Mutex::new(answer))),
            clock,
            LayoutSection::default(),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn result_marker_wins_and_cleans_up() {
        let fs = MockFileSystem::new();
        fs.add_file("/w/e1/rc.txt", "0\n");
        fs.add_file("/w/e1/running.lock", "node1");
        fs.add_file("/w/e1/running.lock.grace", "12.0");
        let r = resolver(&fs, Liveness::Alive, Arc::new(ManualClock::at_epoch_secs(0)));

        assert_eq!(r.status(&exp()).await, ExpStatus::Finished);
        assert!(!fs.exists(Path::new("/w/e1/running.lock")));
        assert!(!fs.exists(Path::new("/w/e1/running.lock.grace")));
        assert_eq!(r.status(&exp()).await, ExpStatus::Finished);
    }

    #[tokio::test]
    async fn non_success_and_garbage_codes_fail() {
        let fs = MockFileSystem::new();
        fs.add_file("/w/e1/rc.txt", "137");
        let r = resolver(&fs, Liveness::Dead, Arc::new(ManualClock::at_epoch_secs(0)));
        assert_eq!(r.status(&exp()).await, ExpStatus::Failed);

        fs.add_file("/w/e1/rc.txt", "oops");
        assert_eq!(r.status(&exp()).await, ExpStatus::Failed);
    }

    #[tokio::test]
    async fn empty_lock_is_todo() {
        let fs = MockFileSystem::new();
        fs.add_file("/w/e1/running.lock", "  \n");
        let r = resolver(&fs, Liveness::Alive, Arc::new(ManualClock::at_epoch_secs(0)));
        assert_eq!(r.status(&exp()).await, ExpStatus::Todo);
        assert_eq!(r.lock_host(&exp()), None);
    }

    #[tokio::test]
    async fn alive_clears_grace_marker() {
        let fs = MockFileSystem::new();
        fs.add_file("/w/e1/running.lock", "node1");
        fs.add_file("/w/e1/running.lock.grace", "5.0");
        let r = resolver(&fs, Liveness::Alive, Arc::new(ManualClock::at_epoch_secs(100)));

        assert_eq!(r.status(&exp()).await, ExpStatus::Running);
        assert!(!fs.exists(Path::new("/w/e1/running.lock.grace")));
    }

    #[tokio::test]
    async fn unparseable_grace_marker_restarts_the_window() {
        let fs = MockFileSystem::new();
        fs.add_file("/w/e1/running.lock", "node1");
        fs.add_file("/w/e1/running.lock.grace", "yesterday");
        let r = resolver(&fs, Liveness::Dead, Arc::new(ManualClock::at_epoch_secs(1_000)));

        assert_eq!(r.status(&exp()).await, ExpStatus::Running);
        assert_eq!(fs.contents("/w/e1/running.lock.grace").as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn out_of_range_grace_marker_restarts_the_window() {
        let fs = MockFileSystem::new();
        fs.add_file("/w/e1/running.lock", "node1");
        fs.add_file("/w/e1/running.lock.grace", "1e19");
        let r = resolver(&fs, Liveness::Dead, Arc::new(ManualClock::at_epoch_secs(2_000)));

        assert_eq!(r.status(&exp()).await, ExpStatus::Running);
        assert_eq!(fs.contents("/w/e1/running.lock.grace").as_deref(), Some("2000"));
        assert!(fs.exists(Path::new("/w/e1/running.lock")));
    }

    #[test]
    fn marker_status_has_no_side_effects() {
        let fs = MockFileSystem::new();
        fs.add_file("/w/e1/rc.txt", "0");
        fs.add_file("/w/e1/running.lock", "node1");
        let r = resolver(&fs, Liveness::Dead, Arc::new(ManualClock::at_epoch_secs(0)));

        assert_eq!(r.marker_status(&exp()), ExpStatus::Finished);
        assert!(fs.exists(Path::new("/w/e1/running.lock")));
    }

    #[test]
    fn marker_status_needs_only_the_filesystem() {
        let fs = MockFileSystem::new();
        let layout = LayoutSection::default();
        assert_eq!(marker_status(&fs, &layout, &exp()), ExpStatus::Todo);

        fs.add_file("/w/e1/running.lock", "node1\n");
        assert_eq!(marker_status(&fs, &layout, &exp()), ExpStatus::Running);
        assert_eq!(lock_host(&fs, &layout, &exp()).as_deref(), Some("node1"));

        fs.add_file("/w/e1/rc.txt", "137");
        assert_eq!(marker_status(&fs, &layout, &exp()), ExpStatus::Failed);
    }
}
