// src/lib.rs

pub mod artifact;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod logging;
pub mod ops;
pub mod remote;
pub mod status;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command, ResetArgs, RunArgs, SummaryArgs};
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{Scheduler, SchedulerDeps, StatusCounts, read_snapshot};
use crate::fs::{FileSystem, RealFileSystem};
use crate::status::marker_status;
use crate::store::{ExperimentStore, group_by_artifact};

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);

    match args.command {
        Command::Run(run_args) => {
            let cfg = load_and_validate(&config_path)?;
            run_scheduler(cfg, run_args).await
        }
        Command::Summary(summary_args) => print_summary(&config_path, summary_args),
        Command::ResetFailed(reset_args) => {
            let cfg = load_and_validate(&config_path)?;
            reset_failed(&cfg, reset_args)
        }
    }
}

async fn run_scheduler(cfg: ConfigFile, args: RunArgs) -> Result<()> {
    if args.dry_run {
        return print_dry_run(&cfg);
    }

    let deps = SchedulerDeps::production(&cfg)?;
    let mut scheduler = Scheduler::start(cfg, deps).await?;
    let outcome = scheduler.run(args.once).await?;
    info!(?outcome, "benchfleet exiting");
    Ok(())
}

/// Config, hosts, artifact groups and marker-only status counts. No host
/// is contacted and nothing is written.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let store = ExperimentStore::new(fs.clone(), cfg.layout.meta_file.clone());
    let experiments = store.scan_all(&cfg.scheduler.work_dirs)?;

    let statuses: Vec<_> = experiments
        .iter()
        .map(|e| marker_status(fs.as_ref(), &cfg.layout, e))
        .collect();

    println!("benchfleet dry-run");
    println!("  work_dirs: {:?}", cfg.scheduler.work_dirs);
    println!("  manage_artifacts: {}", cfg.scheduler.manage_artifacts);
    println!("  grace_period: {:?}", cfg.scheduler.grace_period);
    println!("  worker.command: {}", cfg.worker.command);
    println!();

    println!("hosts ({}):", cfg.hosts.len());
    for (idx, host) in cfg.hosts.iter().enumerate() {
        let role = if idx == 0 { "primary" } else { "worker" };
        println!("  - {host} ({role})");
    }
    println!();

    let groups = group_by_artifact(&experiments);
    println!("artifacts ({}):", groups.len());
    for (path, members) in &groups {
        let counts = StatusCounts::tally(members.iter().map(|&i| &statuses[i]));
        let present = if fs.is_file(path) { "present" } else { "missing" };
        println!("  - {} [{present}] {counts}", path.display());
    }
    println!();

    println!(
        "experiments ({}): {}",
        experiments.len(),
        StatusCounts::tally(&statuses)
    );

    debug!("dry-run complete (no hosts contacted)");
    Ok(())
}

fn print_summary(config_path: &Path, args: SummaryArgs) -> Result<()> {
    let state_file = match args.state_file {
        Some(path) => PathBuf::from(path),
        None => load_and_validate(config_path)?.scheduler.state_file,
    };

    let entries = read_snapshot(&RealFileSystem, &state_file)?;
    let summary = ops::summarize(&entries);
    print!("{}", ops::render_summary(&summary));
    Ok(())
}

fn reset_failed(cfg: &ConfigFile, args: ResetArgs) -> Result<()> {
    let fs = RealFileSystem;
    let store = ExperimentStore::new(Arc::new(RealFileSystem), cfg.layout.meta_file.clone());
    let experiments = store.scan_all(&cfg.scheduler.work_dirs)?;

    let filter = ops::compile_filter(args.filter.as_deref())?;
    let plans = ops::plan_reset(&fs, &experiments, &cfg.layout, filter.as_ref())?;

    if args.apply {
        let removed = ops::apply_reset(&fs, &plans);
        info!(experiments = plans.len(), files = removed, "reset applied");
    }
    print!("{}", ops::render_reset(&plans, args.apply));
    Ok(())
}
