use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A unit of work executed by a [`WorkerPool`](super::WorkerPool).
///
/// The pool takes ownership of a job on submission and drops it once the
/// execution (and its callbacks) finished.
#[async_trait]
pub trait Job: Send + Sync {
    /// Identifier used in logs and callbacks. Does not need to be unique.
    fn id(&self) -> String;

    /// Perform the work.
    ///
    /// `ctx` is the pool's token: it is cancelled when the pool is stopped, long
    /// running jobs should watch it and bail out early.
    async fn execute(&self, ctx: CancellationToken) -> anyhow::Result<()>;
}

/// Errors returned by the blocking submission path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("submission cancelled by caller")]
    Cancelled,

    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("worker pool is stopped")]
    Stopped,
}

pub type OnJobStart = Arc<dyn Fn(&dyn Job) + Send + Sync>;
pub type OnJobComplete = Arc<dyn Fn(&dyn Job, Option<&anyhow::Error>, Duration) + Send + Sync>;
pub type OnJobPanic = Arc<dyn Fn(&dyn Job, &str) + Send + Sync>;

pub const DEFAULT_POOL_NAME: &str = "worker-pool";
pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Configuration of a [`WorkerPool`](super::WorkerPool).
///
/// Zero sizes and an empty name fall back to the defaults.
#[derive(Clone, Default)]
pub struct PoolConfig {
    pub name: String,
    pub max_workers: usize,
    pub queue_size: usize,
    pub on_job_start: Option<OnJobStart>,
    pub on_job_complete: Option<OnJobComplete>,
    pub on_job_panic: Option<OnJobPanic>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, max_workers: usize, queue_size: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
            queue_size,
            ..Default::default()
        }
    }

    pub fn on_job_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Job) + Send + Sync + 'static,
    {
        self.on_job_start = Some(Arc::new(f));
        self
    }

    pub fn on_job_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Job, Option<&anyhow::Error>, Duration) + Send + Sync + 'static,
    {
        self.on_job_complete = Some(Arc::new(f));
        self
    }

    pub fn on_job_panic<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Job, &str) + Send + Sync + 'static,
    {
        self.on_job_panic = Some(Arc::new(f));
        self
    }

    pub(crate) fn with_defaults(mut self) -> Self {
        if self.max_workers == 0 {
            self.max_workers = DEFAULT_MAX_WORKERS;
        }
        if self.queue_size == 0 {
            self.queue_size = DEFAULT_QUEUE_SIZE;
        }
        if self.name.is_empty() {
            self.name = DEFAULT_POOL_NAME.to_string();
        }
        self
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("name", &self.name)
            .field("max_workers", &self.max_workers)
            .field("queue_size", &self.queue_size)
            .field("on_job_start", &self.on_job_start.is_some())
            .field("on_job_complete", &self.on_job_complete.is_some())
            .field("on_job_panic", &self.on_job_panic.is_some())
            .finish()
    }
}

/// Render a panic payload caught at the job boundary.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_applied() {
        let config = PoolConfig::default().with_defaults();
        assert_eq!(config.name, "worker-pool");
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.queue_size, 100);
    }

    #[test]
    fn test_config_explicit_values_kept() {
        let config = PoolConfig::new("webhooks", 5, 50).with_defaults();
        assert_eq!(config.name, "webhooks");
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.queue_size, 50);
    }

    #[test]
    fn test_panic_message_variants() {
        let static_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(static_payload.as_ref()), "boom");

        let owned_payload: Box<dyn std::any::Any + Send> = Box::new(format!("job {}", 7));
        assert_eq!(panic_message(owned_payload.as_ref()), "job 7");

        let other_payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(
            panic_message(other_payload.as_ref()),
            "non-string panic payload"
        );
    }
}
