// src/engine/policy.rs

//! Scheduling policy: which pending experiment goes first, and which host
//! takes it.

use std::cmp::Reverse;
use std::fmt::Debug;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::AdmissionSection;

/// Per-artifact progress used for ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    pub finished: usize,
    pub pending: usize,
}

/// A pending experiment waiting for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Index into the scheduler's experiment list.
    pub index: usize,
    pub stats: ArtifactStats,
}

/// Sort key, smallest first: artifacts with the most finished experiments
/// lead (their file is resident and hot), then artifacts with the fewest
/// pending experiments (small batches drain and free their file sooner).
pub fn rank_key(stats: ArtifactStats) -> (Reverse<usize>, usize) {
    (Reverse(stats.finished), stats.pending)
}

/// Orders pending experiments, highest priority first.
pub trait Prioritizer: Send + Debug {
    fn order(&mut self, candidates: &mut [Candidate]);
}

/// Shuffle, then stable-sort by [`rank_key`]. Equally ranked experiments end
/// up in random order so none is starved by a fixed tie-break.
#[derive(Debug, Clone)]
pub struct ArtifactAffinity {
    rng: StdRng,
}

impl ArtifactAffinity {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible ordering.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Prioritizer for ArtifactAffinity {
    fn order(&mut self, candidates: &mut [Candidate]) {
        candidates.shuffle(&mut self.rng);
        candidates.sort_by_key(|c| rank_key(c.stats));
    }
}

/// Free-memory admission rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionPolicy {
    pub min_free_mem_percent: f64,
    pub overflow_free_mem_percent: f64,
}

impl From<&AdmissionSection> for AdmissionPolicy {
    fn from(cfg: &AdmissionSection) -> Self {
        Self {
            min_free_mem_percent: cfg.min_free_mem_percent,
            overflow_free_mem_percent: cfg.overflow_free_mem_percent,
        }
    }
}

impl AdmissionPolicy {
    /// Among hosts that fit the static budget, the one with the most free
    /// memory strictly above the minimum. Unknown readings never qualify.
    pub fn pick_budgeted<'a>(&self, readings: &[(&'a str, Option<f64>)]) -> Option<(&'a str, f64)> {
        pick_max(readings, |free| free > self.min_free_mem_percent)
    }

    /// Among overflow hosts, the one with the most free memory at or above
    /// the overflow threshold.
    pub fn pick_overflow<'a>(&self, readings: &[(&'a str, Option<f64>)]) -> Option<(&'a str, f64)> {
        pick_max(readings, |free| free >= self.overflow_free_mem_percent)
    }
}

/// First host with the highest qualifying reading.
fn pick_max<'a>(
    readings: &[(&'a str, Option<f64>)],
    qualifies: impl Fn(f64) -> bool,
) -> Option<(&'a str, f64)> {
    let mut best: Option<(&'a str, f64)> = None;
    for &(host, reading) in readings {
        let Some(free) = reading else { continue };
        if !qualifies(free) {
            continue;
        }
        if best.is_none_or(|(_, b)| free > b) {
            best = Some((host, free));
        }
    }
    best
}
