//! Size- and time-triggered batching.
//!
//! Items accumulate in a mutex-guarded buffer. The buffer is flushed when it
//! reaches `batch_size` items or when `flush_interval` elapsed since the first
//! item arrived, whichever comes first. A flush swaps the buffer out under the
//! lock and runs the processing function on its own task, so producers never
//! wait for processing.
//!
//! Flushes are not serialized: a size-triggered and a timer-triggered flush can
//! run at the same time, and there is no ordering between the item slices of
//! separate flushes. Callers needing strict cross-batch ordering must serialize
//! inside their processing function.

use super::job::panic_message;
use crate::metrics;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

pub const DEFAULT_PROCESSOR_NAME: &str = "batch-processor";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub type ProcessFn<T> =
    Arc<dyn Fn(CancellationToken, Vec<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Configuration of a [`BatchProcessor`].
pub struct BatchConfig<T> {
    pub name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub process_fn: ProcessFn<T>,
}

impl<T: Send + 'static> BatchConfig<T> {
    /// Config with default size and interval, see [`batch_size`](Self::batch_size)
    /// and [`flush_interval`](Self::flush_interval) to override them.
    pub fn new<F, Fut>(name: impl Into<String>, process_fn: F) -> Self
    where
        F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            process_fn: Arc::new(move |ctx: CancellationToken, items: Vec<T>| {
                process_fn(ctx, items).boxed()
            }),
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }
}

struct FlushTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct BatchState<T> {
    buffer: Vec<T>,
    /// The single pending flush timer of the current buffer, if armed.
    timer: Option<FlushTimer>,
    timer_generation: u64,
    token: CancellationToken,
}

struct BatchInner<T> {
    name: String,
    batch_size: usize,
    flush_interval: Duration,
    process_fn: ProcessFn<T>,
    state: Mutex<BatchState<T>>,
    flushes: TaskTracker,
}

/// Collects items of type `T` and hands them to a processing function in batches.
///
/// Must be used from within a Tokio runtime: flush timers and flushes are
/// spawned as tasks.
pub struct BatchProcessor<T: Send + 'static> {
    inner: Arc<BatchInner<T>>,
}

impl<T: Send + 'static> BatchProcessor<T> {
    pub fn new(config: BatchConfig<T>) -> Self {
        let batch_size = if config.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            config.batch_size
        };
        let flush_interval = if config.flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            config.flush_interval
        };
        let name = if config.name.is_empty() {
            DEFAULT_PROCESSOR_NAME.to_string()
        } else {
            config.name
        };

        Self {
            inner: Arc::new(BatchInner {
                name,
                batch_size,
                flush_interval,
                process_fn: config.process_fn,
                state: Mutex::new(BatchState {
                    buffer: Vec::with_capacity(batch_size),
                    timer: None,
                    timer_generation: 0,
                    token: CancellationToken::new(),
                }),
                flushes: TaskTracker::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Flushes run with a child token of `ctx` from now on.
    pub fn start(&self, ctx: &CancellationToken) {
        self.inner.state().token = ctx.child_token();

        info!(
            processor = %self.inner.name,
            batch_size = self.inner.batch_size,
            flush_interval_ms = self.inner.flush_interval.as_millis() as u64,
            "Batch processor started"
        );
    }

    /// Flush whatever is buffered and wait for every flush to finish.
    ///
    /// The final flush runs inline with a fresh token, since the processor's own
    /// token is already cancelled at that point.
    pub async fn stop(&self) {
        info!(processor = %self.inner.name, "Stopping batch processor...");

        let remaining = {
            let mut state = self.inner.state();
            state.token.cancel();
            if let Some(timer) = state.timer.take() {
                timer.handle.abort();
            }
            std::mem::replace(&mut state.buffer, Vec::with_capacity(self.inner.batch_size))
        };

        if !remaining.is_empty() {
            debug!(processor = %self.inner.name, count = remaining.len(), "Flushing remaining items on shutdown");
            self.inner.process(CancellationToken::new(), remaining).await;
        }

        self.inner.flushes.close();
        self.inner.flushes.wait().await;
        info!(processor = %self.inner.name, "Batch processor stopped");
    }

    /// Append one item. Never waits for processing.
    pub fn add(&self, item: T) {
        let mut state = self.inner.state();
        self.inner.push_locked(&mut state, item);
    }

    /// Append several items, flushing every time the buffer fills up.
    pub fn add_batch(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.inner.state();
        for item in items {
            self.inner.push_locked(&mut state, item);
        }
    }

    /// Flush the current buffer now, regardless of size and timer.
    pub fn flush(&self) {
        let mut state = self.inner.state();
        self.inner.flush_locked(&mut state);
    }

    pub fn buffer_length(&self) -> usize {
        self.inner.state().buffer.len()
    }
}

impl<T: Send + 'static> BatchInner<T> {
    fn state(&self) -> MutexGuard<'_, BatchState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_locked(self: &Arc<Self>, state: &mut BatchState<T>, item: T) {
        state.buffer.push(item);

        if state.buffer.len() == 1 {
            self.arm_timer_locked(state);
        }
        if state.buffer.len() >= self.batch_size {
            self.flush_locked(state);
        }
    }

    fn arm_timer_locked(self: &Arc<Self>, state: &mut BatchState<T>) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }

        state.timer_generation += 1;
        let generation = state.timer_generation;
        let inner = Arc::clone(self);
        let interval = self.flush_interval;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let mut state = inner.state();
            // A flush or re-arm that won the race for the lock replaced this timer.
            if state.timer.as_ref().map(|t| t.generation) != Some(generation) {
                return;
            }
            state.timer = None;
            inner.flush_locked(&mut state);
        });

        state.timer = Some(FlushTimer { generation, handle });
    }

    fn flush_locked(self: &Arc<Self>, state: &mut BatchState<T>) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        if state.buffer.is_empty() {
            return;
        }

        let items = std::mem::replace(&mut state.buffer, Vec::with_capacity(self.batch_size));
        let ctx = state.token.clone();
        let inner = Arc::clone(self);
        self.flushes.spawn(async move {
            inner.process(ctx, items).await;
        });
    }

    async fn process(&self, ctx: CancellationToken, items: Vec<T>) {
        let count = items.len();
        let outcome = AssertUnwindSafe((self.process_fn)(ctx, items))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                debug!(processor = %self.name, count, "Batch processed");
                metrics::record_batch_flush(&self.name, "success", count);
            }
            Ok(Err(e)) => {
                error!(processor = %self.name, count, "Failed to process batch: {:#}", e);
                metrics::record_batch_flush(&self.name, "failed", count);
            }
            Err(payload) => {
                error!(processor = %self.name, count, panic = %panic_message(payload.as_ref()), "Batch processing panicked");
                metrics::record_batch_flush(&self.name, "failed", count);
            }
        }
    }
}
