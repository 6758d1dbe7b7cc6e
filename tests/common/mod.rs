#![allow(dead_code)]

use std::sync::Arc;

use benchfleet::config::ConfigFile;
use benchfleet::engine::{ArtifactAffinity, Scheduler, SchedulerDeps};
use benchfleet::status::ManualClock;

pub use benchfleet_test_utils::{
    ConfigFileBuilder, ExperimentFixture, FakeArtifactSource, FakeShell, init_tracing,
    with_timeout,
};

pub const T0: u64 = 1_700_000_000;

/// Fakes wired around one shared mock filesystem.
pub struct Harness {
    pub fixture: ExperimentFixture,
    pub shell: FakeShell,
    pub source: FakeArtifactSource,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(shell: FakeShell) -> Self {
        init_tracing();
        let fixture = ExperimentFixture::new("/work");
        let source = FakeArtifactSource::new(fixture.fs.clone());
        Self {
            fixture,
            shell,
            source,
            clock: Arc::new(ManualClock::at_epoch_secs(T0)),
        }
    }

    pub fn deps(&self) -> SchedulerDeps {
        SchedulerDeps {
            fs: Arc::new(self.fixture.fs.clone()),
            shell: Arc::new(self.shell.clone()),
            artifacts: Arc::new(self.source.clone()),
            clock: self.clock.clone(),
            prioritizer: Box::new(ArtifactAffinity::seeded(7)),
        }
    }

    pub async fn start(&self, cfg: ConfigFile) -> Scheduler {
        Scheduler::start(cfg, self.deps())
            .await
            .expect("scheduler should start")
    }
}

/// Single primary host: 8 CPUs / 20480 MB raw, i.e. a 4 CPU / 8192 MB budget.
pub fn small_primary() -> FakeShell {
    FakeShell::new().host("node0", 8, 20480, 50.0)
}
