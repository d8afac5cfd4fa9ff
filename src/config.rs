use anyhow::{Context, Result};
use rtu_monitor_lib::tokio_common::MonitorConfig;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "rtumon.yml";

/// Loads the monitor timing from `path`, or from [`DEFAULT_CONFIG_FILE`] in
/// the working directory if it exists. Falls back to the built-in defaults.
pub(crate) fn get_config(path: Option<&Path>) -> Result<MonitorConfig> {
    let Some(path) = get_config_file_path(path) else {
        log::debug!("No config file found, using defaults");
        return Ok(MonitorConfig::default());
    };
    log::debug!("Loading config file from {:?}", &path);
    let config_file = File::open(&path)
        .with_context(|| format!("Cannot open config file {}", path.display()))?;
    let config: MonitorConfig = serde_yaml::from_reader(&config_file)
        .with_context(|| format!("Invalid config file {}", path.display()))?;

    Ok(config)
}

fn get_config_file_path(path: Option<&Path>) -> Option<PathBuf> {
    let default_file = Path::new(DEFAULT_CONFIG_FILE);
    match (path, default_file) {
        (Some(config), _) => Some(config.to_path_buf()),
        (None, config) if config.exists() => Some(config.to_path_buf()),
        _ => None,
    }
}
