// src/engine/mod.rs

//! Scheduling engine.
//!
//! - [`ledger`]: per-host usage counters and the running-job table.
//! - [`policy`]: ranking of pending experiments and free-memory admission.
//! - [`snapshot`]: the JSON state file written for operators.
//! - [`scheduler`]: the control loop tying store, status, remote and
//!   artifact layers together.

pub mod ledger;
pub mod policy;
pub mod scheduler;
pub mod snapshot;

pub use ledger::{Admission, HostSlot, ResourceLedger, RunningJob};
pub use policy::{
    AdmissionPolicy, ArtifactAffinity, ArtifactStats, Candidate, Prioritizer, rank_key,
};
pub use scheduler::{
    DispatchRecord, DownloadAttempt, RunOutcome, Scheduler, SchedulerDeps, StatusCounts,
    TickReport,
};
pub use snapshot::{SnapshotEntry, SnapshotWriter, read_snapshot};
