use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,

    pub pool: Option<PoolFileConfig>,
    pub batch: Option<BatchFileConfig>,
    pub singleton: Option<SingletonFileConfig>,
    pub lock: Option<LockFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PoolFileConfig {
    pub name: Option<String>,
    pub max_workers: Option<usize>,
    pub queue_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BatchFileConfig {
    pub name: Option<String>,
    pub batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SingletonFileConfig {
    pub name: Option<String>,
    pub interval_secs: Option<u64>,
    pub initial_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct LockFileConfig {
    /// Lock backend: "sqlite", "memory", "postgres"
    pub backend: Option<String>,
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub lease_secs: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
