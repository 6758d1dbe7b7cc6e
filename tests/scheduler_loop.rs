mod common;

use std::path::Path;
use std::time::Duration;

use benchfleet::engine::{Admission, RunOutcome, read_snapshot};
use benchfleet::status::Clock;
use benchfleet::types::{ExpStatus, Resources};

use common::{ConfigFileBuilder, FakeShell, Harness, small_primary, with_timeout};

#[tokio::test]
async fn budget_admits_two_jobs_and_holds_the_third() {
    let h = Harness::new(small_primary().alive_on_launch(true));
    h.fixture.artifact("/traces/t1");
    for id in ["a", "b", "c"] {
        h.fixture.experiment(id, 2.0, 4096.0, "/traces/t1");
    }
    let cfg = ConfigFileBuilder::new().with_hosts(&["node0"]).build();
    let mut sched = h.start(cfg).await;

    assert_eq!(
        sched.ledger().slot("node0").unwrap().host.budget,
        Resources::new(4.0, 8192.0)
    );

    let report = sched.tick().await;
    assert_eq!(report.dispatched.len(), 2);
    assert!(report.dispatched.iter().all(|d| d.admission == Admission::Budgeted));
    assert_eq!(sched.ledger().used_on("node0"), Resources::new(4.0, 8192.0));
    assert_eq!(report.counts.todo, 1);
    assert!(report.progress);

    let report = sched.tick().await;
    assert!(report.dispatched.is_empty());
    assert_eq!(h.shell.launched().len(), 2);

    let first = h.shell.launched()[0].1.clone();
    h.fixture.result(&first, "0");
    h.shell.set_alive(&first, false);

    let report = sched.tick().await;
    assert_eq!(report.reaped, vec![(first.clone(), ExpStatus::Finished)]);
    assert_eq!(report.dispatched.len(), 1);
    assert_ne!(report.dispatched[0].id, first);
    assert_eq!(sched.ledger().len(), 2);
    assert_eq!(sched.ledger().used_on("node0"), Resources::new(4.0, 8192.0));
}

#[tokio::test]
async fn restart_rebuilds_running_table_from_markers() {
    let shell = FakeShell::new()
        .host("node0", 8, 20480, 50.0)
        .host("node1", 16, 65536, 50.0)
        .host("node2", 16, 65536, 50.0);
    let h = Harness::new(shell);
    let f = &h.fixture;
    for id in ["alive", "unknown", "done", "todo", "vanished"] {
        f.experiment(id, 1.0, 1024.0, "/traces/t1");
    }
    f.lock("alive", "node1");
    h.shell.set_alive("alive", true);
    f.lock("unknown", "node2");
    h.shell.set_liveness_error("unknown", true);
    f.result("done", "0").lock("done", "node1");
    f.lock("vanished", "node1");

    let cfg = ConfigFileBuilder::new()
        .with_hosts(&["node0", "node1", "node2"])
        .build();
    let sched = h.start(cfg).await;

    let ledger = sched.ledger();
    let mut tracked: Vec<_> = ledger
        .jobs()
        .map(|j| (j.id.as_str(), j.host.as_str(), j.admission))
        .collect();
    tracked.sort_by_key(|(id, _, _)| *id);
    assert_eq!(
        tracked,
        vec![
            ("alive", "node1", Admission::Recovered),
            ("unknown", "node2", Admission::Recovered),
            ("vanished", "node1", Admission::Recovered),
        ]
    );
    assert_eq!(ledger.used_on("node1"), Resources::new(2.0, 2048.0));
    assert!(ledger.jobs().all(|j| j.started_at == h.clock.now()));

    assert_eq!(sched.status_of("done"), Some(ExpStatus::Finished));
    assert_eq!(sched.status_of("todo"), Some(ExpStatus::Todo));
    assert!(!h.fixture.exists("done", "running.lock"));
    assert!(h.fixture.exists("vanished", "running.lock.grace"));
}

#[tokio::test]
async fn no_dispatch_while_shared_artifact_cannot_be_fetched() {
    let h = Harness::new(small_primary().alive_on_launch(true));
    for id in ["a", "b", "c"] {
        h.fixture.experiment(id, 1.0, 1024.0, "/traces/big");
    }
    h.source.set_size(Some(10_000));
    h.source.set_free_space(Some(1_000));
    let cfg = ConfigFileBuilder::new()
        .with_hosts(&["node0"])
        .with_base_url("https://traces.example.org")
        .build();
    let mut sched = h.start(cfg).await;

    for _ in 0..3 {
        let report = sched.tick().await;
        assert!(report.dispatched.is_empty());
        assert_eq!(report.download.as_ref().map(|d| d.ok), Some(false));
        assert_eq!(report.counts.todo, 3);
    }
    assert!(h.shell.launches().is_empty());
    assert!(h.source.fetches().is_empty());
    assert!(h.fixture.fs.contents("/traces/big").is_none());

    h.source.set_free_space(Some(1 << 30));
    let report = sched.tick().await;
    assert!(report.dispatched.is_empty());
    assert_eq!(report.download.as_ref().map(|d| d.ok), Some(true));
    assert_eq!(h.source.fetches(), vec!["https://traces.example.org/traces/big"]);

    let report = sched.tick().await;
    assert_eq!(report.dispatched.len(), 3);
}

#[tokio::test]
async fn overflow_admission_uses_idle_non_primary_host() {
    let shell = FakeShell::new()
        .host("node0", 8, 20480, 99.0)
        .host("node1", 4, 8192, 80.0)
        .alive_on_launch(true);
    let h = Harness::new(shell);
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("wide", 6.0, 1000.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new()
        .with_hosts(&["node0", "node1"])
        .build();
    let mut sched = h.start(cfg).await;

    // No host fits 6 CPUs; node1 is not idle enough, node0 is never used.
    let report = sched.tick().await;
    assert!(report.dispatched.is_empty());

    h.shell.set_free_mem("node1", 90.0);
    let report = sched.tick().await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].host, "node1");
    assert_eq!(report.dispatched[0].admission, Admission::Overflow);

    let job = sched.ledger().job("wide").unwrap();
    assert_eq!(job.admission, Admission::Overflow);
    let slot = sched.ledger().slot("node1").unwrap();
    assert!(slot.used.cpu > slot.host.budget.cpu);
}

#[tokio::test]
async fn budgeted_hosts_below_free_memory_floor_are_skipped() {
    let shell = FakeShell::new()
        .host("node0", 8, 20480, 15.0)
        .host("node1", 16, 65536, 99.0)
        .alive_on_launch(true);
    let h = Harness::new(shell);
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("e", 1.0, 1024.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new().with_hosts(&["node0", "node1"]).build();
    let mut sched = h.start(cfg).await;

    let report = sched.tick().await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].host, "node1");
    assert_eq!(report.dispatched[0].admission, Admission::Budgeted);
}

#[tokio::test]
async fn fitting_hosts_that_are_all_busy_do_not_fall_back_to_overflow() {
    let shell = FakeShell::new()
        .host("node0", 8, 20480, 10.0)
        .host("node1", 16, 65536, 12.0)
        .alive_on_launch(true);
    let h = Harness::new(shell);
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("e", 1.0, 1024.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new().with_hosts(&["node0", "node1"]).build();
    let mut sched = h.start(cfg).await;

    let report = sched.tick().await;
    assert!(report.dispatched.is_empty());
    assert_eq!(sched.status_of("e"), Some(ExpStatus::Todo));
}

#[tokio::test]
async fn unknown_free_memory_blocks_scheduling() {
    let h = Harness::new(small_primary().alive_on_launch(true));
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("e", 1.0, 1024.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new().with_hosts(&["node0"]).build();
    let mut sched = h.start(cfg).await;

    h.shell.set_unreachable("node0", true);
    let report = sched.tick().await;
    assert!(report.dispatched.is_empty());
    assert_eq!(report.counts.todo, 1);

    h.shell.set_unreachable("node0", false);
    let report = sched.tick().await;
    assert_eq!(report.dispatched.len(), 1);
}

#[tokio::test]
async fn vanished_worker_fails_after_grace_and_frees_resources() {
    let h = Harness::new(small_primary());
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("e", 4.0, 8192.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new()
        .with_hosts(&["node0"])
        .with_grace_period(Duration::from_secs(300))
        .build();
    let mut sched = h.start(cfg).await;

    // Launch "succeeds" but the worker never shows up.
    let report = sched.tick().await;
    assert_eq!(report.dispatched.len(), 1);

    let report = sched.tick().await;
    assert!(report.reaped.is_empty());
    assert!(h.fixture.exists("e", "running.lock.grace"));

    h.clock.advance(Duration::from_secs(301));
    let report = sched.tick().await;
    assert_eq!(report.reaped, vec![("e".to_string(), ExpStatus::Failed)]);
    assert_eq!(h.fixture.read("e", "rc.txt").as_deref(), Some("-99"));
    assert_eq!(sched.ledger().used_on("node0"), Resources::ZERO);
    assert!(report.dispatched.is_empty(), "failed experiments are not retried");
    assert!(report.done);
}

#[tokio::test]
async fn launch_failure_leaves_experiment_todo() {
    let h = Harness::new(small_primary());
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("e", 1.0, 1024.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new().with_hosts(&["node0"]).build();
    let mut sched = h.start(cfg).await;

    h.shell.fail_launches(true);
    let report = sched.tick().await;
    assert!(report.dispatched.is_empty());
    assert!(!h.fixture.exists("e", "running.lock"));
    assert!(sched.ledger().is_empty());

    h.shell.fail_launches(false);
    let report = sched.tick().await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(h.fixture.read("e", "running.lock").as_deref(), Some("node0"));
}

#[tokio::test]
async fn untracked_running_experiment_is_adopted() {
    let shell = FakeShell::new()
        .host("node0", 8, 20480, 50.0)
        .host("node1", 16, 65536, 50.0);
    let h = Harness::new(shell);
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("e", 1.0, 1024.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new()
        .with_hosts(&["node0", "node1"])
        .build();
    let mut sched = h.start(cfg).await;
    assert!(sched.ledger().is_empty());

    h.fixture.lock("e", "node1");
    h.shell.set_alive("e", true);
    let report = sched.tick().await;

    assert_eq!(report.adopted, vec!["e".to_string()]);
    assert!(report.dispatched.is_empty());
    let job = sched.ledger().job("e").unwrap();
    assert_eq!(job.host, "node1");
    assert_eq!(job.admission, Admission::Recovered);
    assert!(h.shell.launches().is_empty());
}

#[tokio::test]
async fn artifacts_are_reclaimed_once_every_user_is_terminal() {
    let h = Harness::new(small_primary());
    h.fixture.artifact("/traces/shared");
    h.fixture.artifact("/traces/busy");
    h.fixture.experiment("a", 1.0, 1.0, "/traces/shared").result("a", "0");
    h.fixture.experiment("b", 1.0, 1.0, "/traces/shared").result("b", "3");
    h.fixture
        .experiment("c", 1.0, 1.0, "/traces/busy")
        .lock("c", "node0");
    h.shell.set_alive("c", true);
    h.fixture.experiment("d", 1.0, 1.0, "/traces/busy").result("d", "0");
    let cfg = ConfigFileBuilder::new().with_hosts(&["node0"]).build();
    let mut sched = h.start(cfg).await;

    let report = sched.tick().await;
    assert_eq!(report.reclaimed, vec![Path::new("/traces/shared").to_path_buf()]);
    assert!(h.fixture.fs.contents("/traces/shared").is_none());
    assert!(h.fixture.fs.contents("/traces/busy").is_some());

    h.fixture.result("c", "0");
    let report = sched.tick().await;
    assert_eq!(report.reclaimed, vec![Path::new("/traces/busy").to_path_buf()]);
    assert!(report.done);
}

#[tokio::test]
async fn unmanaged_artifacts_are_never_touched() {
    let h = Harness::new(small_primary().alive_on_launch(true));
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("a", 1.0, 1.0, "/traces/t1").result("a", "0");
    h.fixture.experiment("b", 1.0, 1.0, "/traces/absent");
    let cfg = ConfigFileBuilder::new()
        .with_hosts(&["node0"])
        .with_manage_artifacts(false)
        .build();
    let mut sched = h.start(cfg).await;

    let report = sched.tick().await;
    assert!(report.reclaimed.is_empty());
    assert!(report.download.is_none());
    assert_eq!(report.dispatched.len(), 1, "artifact presence is not checked");
    assert!(h.fixture.fs.contents("/traces/t1").is_some());
}

#[tokio::test]
async fn snapshot_is_written_on_reconcile() {
    let h = Harness::new(small_primary().alive_on_launch(true));
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("a", 1.0, 1.0, "/traces/t1");
    h.fixture.experiment("b", 1.0, 1.0, "/traces/t1").result("b", "0");
    let cfg = ConfigFileBuilder::new()
        .with_hosts(&["node0"])
        .with_reconcile_interval(Duration::from_secs(60))
        .build();
    let mut sched = h.start(cfg).await;

    sched.tick().await;
    let path = Path::new("/state/scheduler_state.json");
    let entries = read_snapshot(&h.fixture.fs, path).unwrap();
    assert_eq!(entries.len(), 2);
    let a = entries.iter().find(|e| e.id == "a").unwrap();
    assert_eq!(a.status, ExpStatus::Running);
    assert_eq!(a.host.as_deref(), Some("node0"));
    assert_eq!(a.start_time_unix, Some(common::T0 as f64));
    let b = entries.iter().find(|e| e.id == "b").unwrap();
    assert_eq!(b.status, ExpStatus::Finished);
    assert!(b.host.is_none());

    // Not due yet: the file is left alone.
    h.fixture.fs.add_file(path, "[]");
    h.clock.advance(Duration::from_secs(30));
    sched.tick().await;
    assert_eq!(h.fixture.fs.contents(path).as_deref(), Some("[]"));

    h.clock.advance(Duration::from_secs(30));
    sched.tick().await;
    assert_eq!(read_snapshot(&h.fixture.fs, path).unwrap().len(), 2);
}

#[tokio::test]
async fn run_returns_once_everything_is_terminal() {
    let h = Harness::new(small_primary());
    h.fixture.artifact("/traces/t1");
    h.fixture.experiment("a", 1.0, 1.0, "/traces/t1");
    let cfg = ConfigFileBuilder::new().with_hosts(&["node0"]).build();
    let mut sched = h.start(cfg).await;

    assert_eq!(sched.run(true).await.unwrap(), RunOutcome::SingleIteration);
    assert_eq!(h.shell.launched().len(), 1);

    h.fixture.result("a", "0");
    let outcome = with_timeout(sched.run(false)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let entries = read_snapshot(&h.fixture.fs, Path::new("/state/scheduler_state.json")).unwrap();
    assert_eq!(entries[0].status, ExpStatus::Finished);
}
