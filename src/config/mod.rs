mod file_config;

pub use file_config::{
    BatchFileConfig, FileConfig, LockFileConfig, PoolFileConfig, SingletonFileConfig,
};

use crate::background::SingletonConfig;
use crate::lock::{LockStore, DEFAULT_BUSY_TIMEOUT, DEFAULT_LEASE};
use crate::worker::{
    BatchConfig, PoolConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_WORKERS,
    DEFAULT_POOL_NAME, DEFAULT_PROCESSOR_NAME, DEFAULT_QUEUE_SIZE,
};
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LockBackend {
    /// Advisory locks emulated on a SQLite file in the db directory.
    #[default]
    Sqlite,
    /// Process-local locks, no coordination across instances.
    Memory,
    /// PostgreSQL session advisory locks.
    Postgres,
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub lock_backend: LockBackend,
    pub database_url: Option<String>,
    pub max_workers: usize,
    pub queue_size: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pool: PoolSettings,
    pub batch: BatchSettings,
    pub singleton: SingletonSettings,
    pub lock: LockSettings,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub name: String,
    pub max_workers: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SingletonSettings {
    pub name: String,
    pub interval: Duration,
    pub initial_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub backend: LockBackend,
    /// Only set for the sqlite backend.
    pub db_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub lease: Duration,
    pub busy_timeout: Duration,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let pool_file = file.pool.unwrap_or_default();
        let pool = PoolSettings {
            name: pool_file
                .name
                .unwrap_or_else(|| DEFAULT_POOL_NAME.to_string()),
            max_workers: non_zero_or(
                pool_file.max_workers.unwrap_or(cli.max_workers),
                DEFAULT_MAX_WORKERS,
            ),
            queue_size: non_zero_or(
                pool_file.queue_size.unwrap_or(cli.queue_size),
                DEFAULT_QUEUE_SIZE,
            ),
        };

        let batch_file = file.batch.unwrap_or_default();
        let flush_interval_ms = batch_file
            .flush_interval_ms
            .unwrap_or(cli.flush_interval_ms);
        let batch = BatchSettings {
            name: batch_file
                .name
                .unwrap_or_else(|| DEFAULT_PROCESSOR_NAME.to_string()),
            batch_size: non_zero_or(
                batch_file.batch_size.unwrap_or(cli.batch_size),
                DEFAULT_BATCH_SIZE,
            ),
            flush_interval: if flush_interval_ms == 0 {
                DEFAULT_FLUSH_INTERVAL
            } else {
                Duration::from_millis(flush_interval_ms)
            },
        };

        let singleton_file = file.singleton.unwrap_or_default();
        let interval_secs = singleton_file
            .interval_secs
            .unwrap_or(cli.heartbeat_interval_secs);
        if interval_secs == 0 {
            bail!("Singleton interval must be greater than zero");
        }
        let singleton = SingletonSettings {
            name: singleton_file
                .name
                .unwrap_or_else(|| "heartbeat".to_string()),
            interval: Duration::from_secs(interval_secs),
            initial_delay: Duration::from_secs(singleton_file.initial_delay_secs.unwrap_or(0)),
        };

        let lock_file = file.lock.unwrap_or_default();
        let backend = match lock_file.backend {
            Some(s) => match parse_lock_backend(&s) {
                Some(backend) => backend,
                None => bail!("Unknown lock backend in config file: {}", s),
            },
            None => cli.lock_backend,
        };

        // TOML overrides CLI for each field
        let db_dir = file.db_dir.map(PathBuf::from).or_else(|| cli.db_dir.clone());
        let db_dir = match backend {
            LockBackend::Sqlite => {
                let db_dir = db_dir.ok_or_else(|| {
                    anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
                })?;
                if !db_dir.exists() {
                    bail!("Database directory does not exist: {:?}", db_dir);
                }
                if !db_dir.is_dir() {
                    bail!("db_dir is not a directory: {:?}", db_dir);
                }
                Some(db_dir)
            }
            _ => db_dir,
        };

        let database_url = lock_file
            .database_url
            .or_else(|| cli.database_url.clone());
        if backend == LockBackend::Postgres && database_url.is_none() {
            bail!("database_url must be specified for the postgres lock backend");
        }

        let lock = LockSettings {
            backend,
            db_dir,
            database_url,
            max_connections: lock_file.max_connections.unwrap_or(5),
            lease: lock_file
                .lease_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LEASE),
            busy_timeout: lock_file
                .busy_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BUSY_TIMEOUT),
        };

        Ok(Self {
            pool,
            batch,
            singleton,
            lock,
        })
    }
}

impl LockSettings {
    pub fn lock_db_path(&self) -> Option<PathBuf> {
        self.db_dir.as_ref().map(|dir| dir.join("locks.db"))
    }
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.name.clone(), self.max_workers, self.queue_size)
    }
}

impl BatchSettings {
    pub fn batch_config<T, F, Fut>(&self, process_fn: F) -> BatchConfig<T>
    where
        T: Send + 'static,
        F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        BatchConfig::new(self.name.clone(), process_fn)
            .batch_size(self.batch_size)
            .flush_interval(self.flush_interval)
    }
}

impl SingletonSettings {
    pub fn singleton_config<F, Fut>(&self, lock_store: Arc<dyn LockStore>, task_fn: F) -> SingletonConfig
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        SingletonConfig::new(self.name.clone(), lock_store, self.interval, task_fn)
            .initial_delay(self.initial_delay)
    }
}

fn non_zero_or(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

/// Parses a lock backend name, case insensitive.
/// Uses clap's ValueEnum trait for parsing.
fn parse_lock_backend(s: &str) -> Option<LockBackend> {
    LockBackend::from_str(s, true).ok()
}
