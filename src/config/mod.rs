// src/config/mod.rs

//! Configuration loading and validation for benchfleet.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file and its hosts file from disk (`loader.rs`).
//! - Validate basic invariants like non-empty host lists (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_hosts};
pub use model::{
    AdmissionSection, ArtifactSection, ConfigFile, LayoutSection, ProbeSection, RawConfigFile,
    SchedulerSection, WorkerSection,
};
pub use validate::validate_config;
