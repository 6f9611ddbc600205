use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use background_core::config::{AppConfig, CliConfig, FileConfig, LockBackend, LockSettings};
use background_core::{
    metrics, BatchProcessor, InMemoryLockStore, Job, LockStore, SingletonTask, SqliteLockStore,
    WorkerPool,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the SQLite lock database (sqlite lock backend).
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Where singleton tasks take their advisory locks.
    #[clap(long, value_enum, default_value = "sqlite")]
    pub lock_backend: LockBackend,

    /// PostgreSQL connection string (postgres lock backend).
    #[clap(long)]
    pub database_url: Option<String>,

    /// Maximum number of jobs executing concurrently.
    #[clap(long, default_value_t = 10)]
    pub max_workers: usize,

    /// Capacity of the job queue.
    #[clap(long, default_value_t = 100)]
    pub queue_size: usize,

    /// Number of heartbeats delivered per batch.
    #[clap(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Maximum time a heartbeat waits in the batch buffer, in milliseconds.
    #[clap(long, default_value_t = 1000)]
    pub flush_interval_ms: u64,

    /// Interval between heartbeats, in seconds.
    #[clap(long, default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Print the collected metrics on shutdown.
    #[clap(long)]
    pub dump_metrics: bool,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            lock_backend: self.lock_backend,
            database_url: self.database_url.clone(),
            max_workers: self.max_workers,
            queue_size: self.queue_size,
            batch_size: self.batch_size,
            flush_interval_ms: self.flush_interval_ms,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
        }
    }
}

#[derive(Debug, Clone)]
struct Heartbeat {
    instance: String,
    sequence: u64,
    emitted_at: DateTime<Utc>,
}

/// Delivers one flushed batch of heartbeats.
struct HeartbeatDelivery {
    batch_id: u64,
    heartbeats: Vec<Heartbeat>,
}

#[async_trait]
impl Job for HeartbeatDelivery {
    fn id(&self) -> String {
        format!("heartbeat-delivery-{}", self.batch_id)
    }

    async fn execute(&self, ctx: CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            bail!("shutting down before delivery");
        }
        let (Some(first), Some(last)) = (self.heartbeats.first(), self.heartbeats.last()) else {
            return Ok(());
        };
        info!(
            batch_id = self.batch_id,
            count = self.heartbeats.len(),
            instance = %first.instance,
            first_sequence = first.sequence,
            last_sequence = last.sequence,
            first_emitted_at = %first.emitted_at.to_rfc3339(),
            "Delivered heartbeat batch"
        );
        Ok(())
    }
}

async fn open_lock_store(settings: &LockSettings) -> Result<Arc<dyn LockStore>> {
    match settings.backend {
        LockBackend::Sqlite => {
            let path = settings
                .lock_db_path()
                .context("db_dir is required for the sqlite lock backend")?;
            info!("Opening SQLite lock database at {:?}...", path);
            let store = SqliteLockStore::new(&path)?
                .with_lease(settings.lease)
                .with_busy_timeout(settings.busy_timeout);
            Ok(Arc::new(store))
        }
        LockBackend::Memory => {
            warn!("Using in-memory locks, singleton tasks are not coordinated across instances");
            Ok(Arc::new(InMemoryLockStore::new()))
        }
        LockBackend::Postgres => open_postgres_lock_store(settings).await,
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres_lock_store(settings: &LockSettings) -> Result<Arc<dyn LockStore>> {
    let url = settings
        .database_url
        .as_deref()
        .context("database_url is required for the postgres lock backend")?;
    info!("Connecting to PostgreSQL lock backend...");
    let store =
        background_core::PgLockStore::connect(url, settings.max_connections).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres_lock_store(_settings: &LockSettings) -> Result<Arc<dyn LockStore>> {
    bail!("The postgres lock backend requires building with the `postgres` feature")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;
    debug!("Resolved configuration: {:?}", app_config);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let lock_store = open_lock_store(&app_config.lock).await?;
    let root = CancellationToken::new();

    let pool_config = app_config
        .pool
        .pool_config()
        .on_job_complete(|job, err, duration| {
            if err.is_none() {
                debug!(job_id = %job.id(), duration_ms = duration.as_millis() as u64, "Delivery finished");
            }
        })
        .on_job_panic(|job, message| {
            warn!(job_id = %job.id(), "Delivery panicked: {}", message);
        });
    let pool = Arc::new(WorkerPool::new(pool_config));
    pool.start(&root);

    let batch_ids = Arc::new(AtomicU64::new(0));
    let delivery_pool = Arc::clone(&pool);
    let batcher = Arc::new(BatchProcessor::new(app_config.batch.batch_config(
        move |_ctx, heartbeats: Vec<Heartbeat>| {
            let pool = Arc::clone(&delivery_pool);
            let batch_id = batch_ids.fetch_add(1, Ordering::Relaxed);
            async move {
                let count = heartbeats.len();
                if !pool.submit(Box::new(HeartbeatDelivery {
                    batch_id,
                    heartbeats,
                })) {
                    bail!("delivery queue rejected batch {} ({} heartbeats)", batch_id, count);
                }
                Ok(())
            }
        },
    )));
    batcher.start(&root);

    let instance = format!("{}-{}", hostname(), std::process::id());
    let sequence = Arc::new(AtomicU64::new(0));
    let heartbeat_sink = Arc::clone(&batcher);
    let singleton = SingletonTask::new(app_config.singleton.singleton_config(
        Arc::clone(&lock_store),
        move |_ctx| {
            heartbeat_sink.add(Heartbeat {
                instance: instance.clone(),
                sequence: sequence.fetch_add(1, Ordering::Relaxed),
                emitted_at: Utc::now(),
            });
            async { Ok(()) }
        },
    ));
    singleton.start(&root);

    info!("Background runner ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping components...");

    // Producers first, so the final batch still reaches a running pool.
    singleton.stop().await;
    batcher.stop().await;
    drain_pool(&pool, DRAIN_TIMEOUT).await;
    pool.stop().await;
    root.cancel();

    if cli_args.dump_metrics {
        println!("{}", metrics::gather_text()?);
    }
    info!("Background runner stopped");
    Ok(())
}

/// Wait for queued deliveries to be picked up, `stop` discards whatever is left.
async fn drain_pool(pool: &WorkerPool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while pool.queue_length() > 0 || pool.active_workers() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                queued = pool.queue_length(),
                active = pool.active_workers(),
                "Timed out draining worker pool"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
