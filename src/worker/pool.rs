use super::job::{panic_message, Job, OnJobComplete, OnJobPanic, OnJobStart, PoolConfig, PoolError};
use crate::metrics;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Started,
    /// Cancel issued and submissions closed, in-flight jobs are draining.
    Stopping,
    Stopped,
}

/// State shared between the pool handle, the dispatcher and the job tasks.
struct PoolShared {
    name: String,
    semaphore: Arc<Semaphore>,
    active_workers: AtomicUsize,
    tracker: TaskTracker,
    on_job_start: Option<OnJobStart>,
    on_job_complete: Option<OnJobComplete>,
    on_job_panic: Option<OnJobPanic>,
}

struct Lifecycle {
    state: PoolState,
    token: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

/// Bounded-concurrency job executor.
///
/// Jobs go through a bounded queue; a single dispatcher pulls them one at a time
/// and runs each on its own task once one of `max_workers` slots is free. While
/// every slot is busy the dispatcher waits, the queue fills up, and [`submit`]
/// starts rejecting work.
///
/// [`submit`]: WorkerPool::submit
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    max_workers: usize,
    queue_size: usize,
    job_tx: mpsc::Sender<Box<dyn Job>>,
    job_rx: Mutex<Option<mpsc::Receiver<Box<dyn Job>>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let config = config.with_defaults();
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);

        Self {
            shared: Arc::new(PoolShared {
                name: config.name,
                semaphore: Arc::new(Semaphore::new(config.max_workers)),
                active_workers: AtomicUsize::new(0),
                tracker: TaskTracker::new(),
                on_job_start: config.on_job_start,
                on_job_complete: config.on_job_complete,
                on_job_panic: config.on_job_panic,
            }),
            max_workers: config.max_workers,
            queue_size: config.queue_size,
            job_tx,
            job_rx: Mutex::new(Some(job_rx)),
            lifecycle: Mutex::new(Lifecycle {
                state: PoolState::Created,
                token: CancellationToken::new(),
                dispatcher: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle().state
    }

    /// Start the dispatcher. The pool's token is a child of `ctx`, cancelling
    /// `ctx` cancels every running job.
    pub fn start(&self, ctx: &CancellationToken) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != PoolState::Created {
            warn!(pool = %self.shared.name, state = ?lifecycle.state, "Worker pool already started");
            return;
        }

        let receiver = match self.receiver().take() {
            Some(receiver) => receiver,
            None => {
                error!(pool = %self.shared.name, "Worker pool queue receiver missing");
                return;
            }
        };

        let token = ctx.child_token();
        let shared = Arc::clone(&self.shared);
        let dispatcher_token = token.clone();
        lifecycle.dispatcher = Some(tokio::spawn(async move {
            shared.dispatch(receiver, dispatcher_token).await;
        }));
        lifecycle.token = token;
        lifecycle.state = PoolState::Started;

        info!(
            pool = %self.shared.name,
            max_workers = self.max_workers,
            queue_size = self.queue_size,
            "Worker pool started"
        );
    }

    /// Stop the pool and wait until every dispatched job finished.
    ///
    /// Jobs still sitting in the queue are discarded. Calling `stop` again while a
    /// drain is running waits for that drain.
    pub async fn stop(&self) {
        let (token, dispatcher) = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                PoolState::Stopped => return,
                PoolState::Stopping => {
                    drop(lifecycle);
                    self.shared.tracker.wait().await;
                    return;
                }
                PoolState::Created => {
                    lifecycle.state = PoolState::Stopped;
                    drop(lifecycle);
                    let discarded = self.receiver().take().map(drain_queue).unwrap_or(0);
                    if discarded > 0 {
                        warn!(pool = %self.shared.name, discarded, "Worker pool stopped before start, discarding queued jobs");
                    }
                    self.shared.tracker.close();
                    return;
                }
                PoolState::Started => {
                    lifecycle.state = PoolState::Stopping;
                    (lifecycle.token.clone(), lifecycle.dispatcher.take())
                }
            }
        };

        info!(pool = %self.shared.name, "Stopping worker pool...");
        token.cancel();

        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!(pool = %self.shared.name, "Worker pool dispatcher terminated abnormally: {}", e);
            }
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        self.lifecycle().state = PoolState::Stopped;
        info!(pool = %self.shared.name, "Worker pool stopped");
    }

    /// Queue a job without waiting. Returns `false` if the job was dropped
    /// because the queue is full or the pool is stopping.
    pub fn submit(&self, job: Box<dyn Job>) -> bool {
        if self.is_closed() {
            warn!(pool = %self.shared.name, job_id = %job.id(), "Worker pool stopped, dropping job");
            metrics::record_job_dropped(&self.shared.name);
            return false;
        }

        match self.job_tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(pool = %self.shared.name, job_id = %job.id(), "Job queue full, dropping job");
                metrics::record_job_dropped(&self.shared.name);
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(pool = %self.shared.name, job_id = %job.id(), "Worker pool stopped, dropping job");
                metrics::record_job_dropped(&self.shared.name);
                false
            }
        }
    }

    /// Queue a job, waiting for room in the queue.
    ///
    /// Gives up when `ctx` is cancelled ([`PoolError::Cancelled`]) or when the pool
    /// itself is shutting down ([`PoolError::ShuttingDown`]).
    pub async fn submit_wait(
        &self,
        ctx: &CancellationToken,
        job: Box<dyn Job>,
    ) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Stopped);
        }
        let pool_token = self.lifecycle().token.clone();

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(PoolError::Cancelled),
            _ = pool_token.cancelled() => Err(PoolError::ShuttingDown),
            sent = self.job_tx.send(job) => sent.map_err(|_| PoolError::Stopped),
        }
    }

    /// Number of jobs currently executing.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting in the queue.
    pub fn queue_length(&self) -> usize {
        self.job_tx.max_capacity() - self.job_tx.capacity()
    }

    fn is_closed(&self) -> bool {
        matches!(self.state(), PoolState::Stopping | PoolState::Stopped)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn receiver(&self) -> MutexGuard<'_, Option<mpsc::Receiver<Box<dyn Job>>>> {
        self.job_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PoolShared {
    /// Dispatcher loop: one job at a time, blocking on the semaphore when all
    /// workers are busy.
    async fn dispatch(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Box<dyn Job>>,
        token: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => break,
                job = receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = token.cancelled() => {
                    debug!(pool = %self.name, job_id = %job.id(), "Discarding job pulled during shutdown");
                    metrics::record_job_dropped(&self.name);
                    break;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let active = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_active_workers(&self.name, active);

            let shared = Arc::clone(&self);
            let ctx = token.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                let _active = ActiveWorkerGuard { shared: &shared };
                shared.run_job(job, ctx).await;
            });
        }

        let discarded = drain_queue(receiver);
        if discarded > 0 {
            warn!(pool = %self.name, discarded, "Discarded queued jobs on shutdown");
        }
    }

    async fn run_job(&self, job: Box<dyn Job>, ctx: CancellationToken) {
        let start = Instant::now();
        let job_id = job.id();

        let execution = async {
            if let Some(on_start) = &self.on_job_start {
                on_start(job.as_ref());
            }
            job.execute(ctx).await
        };
        let outcome = AssertUnwindSafe(execution).catch_unwind().await;
        let duration = start.elapsed();

        match outcome {
            Ok(result) => {
                match &result {
                    Ok(()) => {
                        debug!(pool = %self.name, job_id = %job_id, duration_ms = duration.as_millis() as u64, "Job completed");
                        metrics::record_job_execution(&self.name, "success", duration);
                    }
                    Err(e) => {
                        error!(pool = %self.name, job_id = %job_id, duration_ms = duration.as_millis() as u64, "Job failed: {:#}", e);
                        metrics::record_job_execution(&self.name, "failed", duration);
                    }
                }
                if let Some(on_complete) = &self.on_job_complete {
                    on_complete(job.as_ref(), result.as_ref().err(), duration);
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(pool = %self.name, job_id = %job_id, panic = %message, "Worker panic recovered");
                metrics::record_job_execution(&self.name, "panic", duration);
                if let Some(on_panic) = &self.on_job_panic {
                    on_panic(job.as_ref(), &message);
                }
            }
        }
    }
}

/// Decrements the active worker count when a job task ends, however it ends.
struct ActiveWorkerGuard<'a> {
    shared: &'a PoolShared,
}

impl Drop for ActiveWorkerGuard<'_> {
    fn drop(&mut self) {
        let active = self.shared.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_workers(&self.shared.name, active);
    }
}

fn drain_queue(mut receiver: mpsc::Receiver<Box<dyn Job>>) -> usize {
    receiver.close();
    let mut discarded = 0;
    while receiver.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}
