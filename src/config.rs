use crate::cli::Cli;
use crate::engine::{DEFAULT_CONCURRENCY, EngineConfig};
use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Settings read from the optional `--config` YAML file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub concurrency: Option<usize>,
    pub progress_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Combine file settings with command line flags; flags win.
pub fn resolve(cli: &Cli, file: &FileConfig) -> anyhow::Result<EngineConfig> {
    let defaults = EngineConfig::default();
    let concurrency = cli
        .concurrency
        .or(file.concurrency)
        .unwrap_or(DEFAULT_CONCURRENCY);
    if concurrency == 0 {
        bail!("Concurrency must be at least 1");
    }
    let progress_interval = cli
        .progress_interval_ms
        .or(file.progress_interval_ms)
        .map(Duration::from_millis)
        .unwrap_or(defaults.progress_interval);
    if progress_interval.is_zero() {
        bail!("Progress interval must be greater than zero");
    }
    Ok(EngineConfig {
        concurrency,
        progress_interval,
    })
}
