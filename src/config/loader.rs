// src/config/loader.rs

use std::fs;
use std::path::Path;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{FleetError, Result};

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** resolve the
/// hosts file or validate anything. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path, resolve `hosts_file` and validate.
///
/// This is the recommended entry point for the rest of the application.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let mut raw_config = load_from_path(path)?;
    resolve_hosts_file(&mut raw_config, config_dir(path))?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Append the entries of `[scheduler].hosts_file` to the inline host list.
pub fn resolve_hosts_file(raw: &mut RawConfigFile, base_dir: &Path) -> Result<()> {
    let Some(hosts_file) = raw.scheduler.hosts_file.clone() else {
        return Ok(());
    };

    let hosts_path = if hosts_file.is_absolute() {
        hosts_file
    } else {
        base_dir.join(hosts_file)
    };

    let contents = fs::read_to_string(&hosts_path).map_err(|e| {
        FleetError::NoHosts(format!("cannot read hosts file {:?}: {}", hosts_path, e))
    })?;

    raw.scheduler.hosts.extend(parse_hosts(&contents));
    Ok(())
}

/// Parse a hosts file: one host per line, blank lines and `#` comments skipped.
pub fn parse_hosts(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Directory the config file lives in, falling back to the current directory
/// for bare filenames like `Benchfleet.toml`.
pub fn config_dir(config_path: &Path) -> &Path {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
