use crate::lock::LockStore;
use crate::metrics;
use crate::worker::panic_message;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for releasing the lock after a tick, independent of the loop token.
pub const LOCK_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Used when the configured interval is zero.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub type TaskFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Derive the advisory lock key of a task from its name.
///
/// FNV-1a 64 of the UTF-8 bytes with the sign bit cleared. The value is part of
/// the cross-instance contract: every process must compute the same key for the
/// same name.
pub fn generate_lock_id(name: &str) -> i64 {
    let hash = name.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    (hash & 0x7FFF_FFFF_FFFF_FFFF) as i64
}

pub struct SingletonConfig {
    /// Used for logs and to derive the lock id.
    pub name: String,
    pub lock_store: Arc<dyn LockStore>,
    pub interval: Duration,
    /// When non-zero, the first attempt happens after this delay instead of
    /// after the first interval.
    pub initial_delay: Duration,
    pub task_fn: TaskFn,
}

impl SingletonConfig {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        lock_store: Arc<dyn LockStore>,
        interval: Duration,
        task_fn: F,
    ) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            lock_store,
            interval,
            initial_delay: Duration::ZERO,
            task_fn: Arc::new(move |ctx: CancellationToken| task_fn(ctx).boxed()),
        }
    }

    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }
}

struct SingletonInner {
    name: String,
    lock_id: i64,
    lock_store: Arc<dyn LockStore>,
    interval: Duration,
    initial_delay: Duration,
    task_fn: TaskFn,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Runs a function periodically, guarded by an advisory lock so that only one
/// instance sharing the lock store executes it per tick.
pub struct SingletonTask {
    inner: Arc<SingletonInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl SingletonTask {
    pub fn new(config: SingletonConfig) -> Self {
        let interval = if config.interval.is_zero() {
            warn!(task = %config.name, "Singleton interval is zero, using {:?}", DEFAULT_INTERVAL);
            DEFAULT_INTERVAL
        } else {
            config.interval
        };

        Self {
            inner: Arc::new(SingletonInner {
                lock_id: generate_lock_id(&config.name),
                name: config.name,
                lock_store: config.lock_store,
                interval,
                initial_delay: config.initial_delay,
                task_fn: config.task_fn,
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn lock_id(&self) -> i64 {
        self.inner.lock_id
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self, ctx: &CancellationToken) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.started {
            warn!(task = %self.inner.name, "Singleton task already started, ignoring start");
            return;
        }

        let token = ctx.child_token();
        let inner = Arc::clone(&self.inner);
        let loop_token = token.clone();
        lifecycle.handle = Some(tokio::spawn(async move {
            inner.run(loop_token).await;
        }));
        lifecycle.token = Some(token);
        lifecycle.started = true;

        info!(
            task = %self.inner.name,
            interval_ms = self.inner.interval.as_millis() as u64,
            lock_id = self.inner.lock_id,
            "Singleton task started"
        );
    }

    /// Cancel the loop and wait for the tick in progress, if any.
    pub async fn stop(&self) {
        let (token, handle) = {
            let mut lifecycle = self.lifecycle();
            (lifecycle.token.take(), lifecycle.handle.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = %self.inner.name, "Singleton task loop terminated abnormally: {}", e);
            }
            info!(task = %self.inner.name, "Singleton task stopped");
        }
    }
}

impl SingletonInner {
    async fn run(&self, token: CancellationToken) {
        if !self.initial_delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.initial_delay) => {
                    self.try_execute(&token).await;
                }
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    self.try_execute(&token).await;
                }
            }
        }
    }

    async fn try_execute(&self, token: &CancellationToken) {
        let checkout = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            checkout = self.lock_store.checkout() => checkout,
        };
        let mut session = match checkout {
            Ok(session) => session,
            Err(e) => {
                if !token.is_cancelled() {
                    error!(task = %self.name, "Failed to acquire connection for singleton task: {}", e);
                    metrics::record_singleton_tick(&self.name, "error");
                }
                return;
            }
        };

        match session.try_acquire(self.lock_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task = %self.name, "Singleton task skipped - lock held by another instance");
                metrics::record_singleton_tick(&self.name, "skipped");
                return;
            }
            Err(e) => {
                if !token.is_cancelled() {
                    error!(task = %self.name, "Failed to try advisory lock: {}", e);
                    metrics::record_singleton_tick(&self.name, "error");
                }
                return;
            }
        }

        let outcome = AssertUnwindSafe((self.task_fn)(token.clone()))
            .catch_unwind()
            .await;

        match tokio::time::timeout(LOCK_RELEASE_TIMEOUT, session.release(self.lock_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(task = %self.name, "Failed to release advisory lock: {}", e);
            }
            Err(_) => {
                warn!(task = %self.name, "Timed out releasing advisory lock after {:?}", LOCK_RELEASE_TIMEOUT);
            }
        }

        match outcome {
            Ok(Ok(())) => {
                debug!(task = %self.name, "Singleton task executed");
                metrics::record_singleton_tick(&self.name, "executed");
            }
            Ok(Err(e)) => {
                metrics::record_singleton_tick(&self.name, "failed");
                if !token.is_cancelled() {
                    error!(task = %self.name, "Singleton task failed: {:#}", e);
                }
            }
            Err(payload) => {
                metrics::record_singleton_tick(&self.name, "failed");
                error!(
                    task = %self.name,
                    panic = %panic_message(payload.as_ref()),
                    "Singleton task panicked"
                );
            }
        }
    }
}
