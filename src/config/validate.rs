// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{FleetError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::FleetError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

/// Run every semantic check on a raw config (hosts file already resolved).
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_work_dirs(cfg)?;
    validate_hosts(cfg)?;
    validate_admission(cfg)?;
    validate_probe(cfg)?;
    validate_worker(cfg)?;
    validate_artifacts(cfg)?;
    Ok(())
}

fn ensure_has_work_dirs(cfg: &RawConfigFile) -> Result<()> {
    if cfg.scheduler.work_dirs.is_empty() {
        return Err(FleetError::ConfigError(
            "[scheduler].work_dirs must list at least one directory".to_string(),
        ));
    }
    Ok(())
}

fn validate_hosts(cfg: &RawConfigFile) -> Result<()> {
    if cfg.scheduler.hosts.is_empty() {
        return Err(FleetError::NoHosts(
            "set [scheduler].hosts or [scheduler].hosts_file".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for host in &cfg.scheduler.hosts {
        if !seen.insert(host.as_str()) {
            return Err(FleetError::ConfigError(format!(
                "host '{}' is listed more than once",
                host
            )));
        }
    }
    Ok(())
}

fn validate_admission(cfg: &RawConfigFile) -> Result<()> {
    let a = &cfg.admission;
    for (name, value) in [
        ("min_free_mem_percent", a.min_free_mem_percent),
        ("overflow_free_mem_percent", a.overflow_free_mem_percent),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(FleetError::ConfigError(format!(
                "[admission].{} must be within 0..=100 (got {})",
                name, value
            )));
        }
    }
    Ok(())
}

fn validate_probe(cfg: &RawConfigFile) -> Result<()> {
    let p = &cfg.probe;
    for (name, value) in [
        ("primary_cpu_fraction", p.primary_cpu_fraction),
        ("primary_mem_fraction", p.primary_mem_fraction),
        ("worker_cpu_fraction", p.worker_cpu_fraction),
        ("worker_mem_fraction", p.worker_mem_fraction),
    ] {
        ensure_fraction("probe", name, value)?;
    }
    Ok(())
}

fn validate_worker(cfg: &RawConfigFile) -> Result<()> {
    let w = &cfg.worker;
    if !w.command.contains("{dir}") {
        return Err(FleetError::ConfigError(
            "[worker].command must contain the {dir} placeholder".to_string(),
        ));
    }

    let valid_ident = w
        .tag_var
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && w.tag_var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_ident {
        return Err(FleetError::ConfigError(format!(
            "[worker].tag_var '{}' is not a valid environment variable name",
            w.tag_var
        )));
    }
    Ok(())
}

fn validate_artifacts(cfg: &RawConfigFile) -> Result<()> {
    ensure_fraction("artifacts", "space_margin", cfg.artifacts.space_margin)
}

fn ensure_fraction(section: &str, name: &str, value: f64) -> Result<()> {
    if value <= 0.0 || value > 1.0 {
        return Err(FleetError::ConfigError(format!(
            "[{}].{} must be within (0, 1] (got {})",
            section, name, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn minimal() -> RawConfigFile {
        let mut raw = RawConfigFile::default();
        raw.scheduler.work_dirs = vec![PathBuf::from("/work")];
        raw.scheduler.hosts = vec!["node0".to_string()];
        raw.worker.command = "run {dir}".to_string();
        raw
    }

    #[test]
    fn minimal_config_is_valid() {
        let cfg = ConfigFile::try_from(minimal()).unwrap();
        assert_eq!(cfg.hosts, vec!["node0"]);
    }

    #[test]
    fn rejects_missing_hosts() {
        let mut raw = minimal();
        raw.scheduler.hosts.clear();
        assert!(matches!(
            ConfigFile::try_from(raw),
            Err(FleetError::NoHosts(_))
        ));
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let mut raw = minimal();
        raw.scheduler.hosts.push("node0".to_string());
        assert!(matches!(
            ConfigFile::try_from(raw),
            Err(FleetError::ConfigError(msg)) if msg.contains("more than once")
        ));
    }

    #[test]
    fn rejects_command_without_dir_placeholder() {
        let mut raw = minimal();
        raw.worker.command = "run".to_string();
        assert!(ConfigFile::try_from(raw).is_err());
    }

    #[test]
    fn rejects_bad_tag_var() {
        let mut raw = minimal();
        raw.worker.tag_var = "1-bad".to_string();
        assert!(ConfigFile::try_from(raw).is_err());
    }

    #[test]
    fn rejects_out_of_range_fractions() {
        let mut raw = minimal();
        raw.probe.primary_mem_fraction = 1.5;
        assert!(ConfigFile::try_from(raw).is_err());

        let mut raw = minimal();
        raw.artifacts.space_margin = 0.0;
        assert!(ConfigFile::try_from(raw).is_err());
    }
}
