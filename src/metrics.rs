use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all background metrics
const PREFIX: &str = "background";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Worker Pool Metrics
    pub static ref POOL_JOBS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_pool_jobs_total"), "Total number of executed jobs"),
        &["pool", "status"]
    ).expect("Failed to create pool_jobs_total metric");

    pub static ref POOL_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_pool_job_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["pool"]
    ).expect("Failed to create pool_job_duration_seconds metric");

    pub static ref POOL_JOBS_DROPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_pool_jobs_dropped_total"), "Jobs rejected because the queue was full or the pool stopped"),
        &["pool"]
    ).expect("Failed to create pool_jobs_dropped_total metric");

    pub static ref POOL_ACTIVE_WORKERS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_pool_active_workers"), "Jobs currently executing"),
        &["pool"]
    ).expect("Failed to create pool_active_workers metric");

    // Batch Processor Metrics
    pub static ref BATCH_FLUSHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_batch_flushes_total"), "Total number of batch flushes"),
        &["processor", "status"]
    ).expect("Failed to create batch_flushes_total metric");

    pub static ref BATCH_FLUSH_ITEMS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_batch_flush_items"),
            "Number of items handed to the processing function per flush"
        )
        .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]),
        &["processor"]
    ).expect("Failed to create batch_flush_items metric");

    // Singleton Task Metrics
    pub static ref SINGLETON_TICKS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_singleton_ticks_total"), "Singleton task ticks by outcome"),
        &["task", "outcome"]
    ).expect("Failed to create singleton_ticks_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(POOL_JOBS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(POOL_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(POOL_JOBS_DROPPED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(POOL_ACTIVE_WORKERS.clone()));
    let _ = REGISTRY.register(Box::new(BATCH_FLUSHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BATCH_FLUSH_ITEMS.clone()));
    let _ = REGISTRY.register(Box::new(SINGLETON_TICKS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished job execution. `status` is one of success, failed, panic.
pub fn record_job_execution(pool: &str, status: &str, duration: Duration) {
    POOL_JOBS_TOTAL.with_label_values(&[pool, status]).inc();
    POOL_JOB_DURATION_SECONDS
        .with_label_values(&[pool])
        .observe(duration.as_secs_f64());
}

pub fn record_job_dropped(pool: &str) {
    POOL_JOBS_DROPPED_TOTAL.with_label_values(&[pool]).inc();
}

pub fn set_active_workers(pool: &str, count: usize) {
    POOL_ACTIVE_WORKERS
        .with_label_values(&[pool])
        .set(count as f64);
}

/// Record a batch flush. `status` is either success or failed.
pub fn record_batch_flush(processor: &str, status: &str, items: usize) {
    BATCH_FLUSHES_TOTAL
        .with_label_values(&[processor, status])
        .inc();
    BATCH_FLUSH_ITEMS
        .with_label_values(&[processor])
        .observe(items as f64);
}

/// Record the outcome of a singleton tick: executed, failed, skipped or error.
pub fn record_singleton_tick(task: &str, outcome: &str) {
    SINGLETON_TICKS_TOTAL
        .with_label_values(&[task, outcome])
        .inc();
}

/// Render every registered metric in the Prometheus text exposition format.
pub fn gather_text() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
