// src/engine/ledger.rs

//! Per-host resource accounting and the running-job table.
//!
//! The ledger is owned by the scheduler loop and mutated nowhere else.
//! Usage on a host is always the sum of the demands of the jobs recorded on
//! it; releasing clamps at zero so float drift can never go negative.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::remote::Host;
use crate::types::{ExperimentId, Resources};

/// How a job got its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    /// Fit inside the host's static budget.
    Budgeted,
    /// Placed past the static budget because the host looked idle.
    Overflow,
    /// Found running at startup or after another instance dispatched it.
    Recovered,
}

/// Running-job record. Lives only in memory; rebuilt from lock markers.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningJob {
    pub id: ExperimentId,
    pub host: String,
    pub started_at: SystemTime,
    pub demand: Resources,
    pub admission: Admission,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostSlot {
    pub host: Host,
    pub used: Resources,
}

impl HostSlot {
    pub fn fits(&self, demand: Resources) -> bool {
        self.used.fits_with(demand, self.host.budget)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    slots: Vec<HostSlot>,
    jobs: BTreeMap<ExperimentId, RunningJob>,
}

impl ResourceLedger {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self {
            slots: hosts
                .into_iter()
                .map(|host| HostSlot {
                    host,
                    used: Resources::ZERO,
                })
                .collect(),
            jobs: BTreeMap::new(),
        }
    }

    /// Hosts in configured order; index 0 is the primary.
    pub fn slots(&self) -> &[HostSlot] {
        &self.slots
    }

    pub fn slot(&self, host: &str) -> Option<&HostSlot> {
        self.slots.iter().find(|s| s.host.name == host)
    }

    /// Hosts whose current usage plus `demand` stays within budget.
    pub fn fitting_hosts(&self, demand: Resources) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.fits(demand))
            .map(|s| s.host.name.as_str())
            .collect()
    }

    /// Hosts eligible for overflow admission: every host but the primary.
    pub fn overflow_hosts(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| !s.host.primary)
            .map(|s| s.host.name.as_str())
            .collect()
    }

    /// Record `job` and charge its demand to its host.
    ///
    /// A job on a host that is not configured (a lock left by an earlier
    /// run with a different host list) is tracked but charged nowhere.
    pub fn reserve(&mut self, job: RunningJob) {
        if self.jobs.contains_key(&job.id) {
            self.release(&job.id);
        }
        match self.slots.iter_mut().find(|s| s.host.name == job.host) {
            Some(slot) => slot.used = slot.used.add(job.demand),
            None => warn!(
                experiment = %job.id,
                host = %job.host,
                "job runs on a host outside the configured list; not charged"
            ),
        }
        self.jobs.insert(job.id.clone(), job);
    }

    /// Forget a job and give its demand back to its host.
    pub fn release(&mut self, id: &str) -> Option<RunningJob> {
        let job = self.jobs.remove(id)?;
        if let Some(slot) = self.slots.iter_mut().find(|s| s.host.name == job.host) {
            slot.used = slot.used.saturating_sub(job.demand);
        }
        Some(job)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn job(&self, id: &str) -> Option<&RunningJob> {
        self.jobs.get(id)
    }

    /// Jobs ordered by experiment id.
    pub fn jobs(&self) -> impl Iterator<Item = &RunningJob> {
        self.jobs.values()
    }

    pub fn running_ids(&self) -> Vec<ExperimentId> {
        self.jobs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn used_on(&self, host: &str) -> Resources {
        self.slot(host).map(|s| s.used).unwrap_or(Resources::ZERO)
    }

    pub fn total_budget(&self) -> Resources {
        self.slots
            .iter()
            .fold(Resources::ZERO, |acc, s| acc.add(s.host.budget))
    }

    pub fn total_used(&self) -> Resources {
        self.slots
            .iter()
            .fold(Resources::ZERO, |acc, s| acc.add(s.used))
    }
}
