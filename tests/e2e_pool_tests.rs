//! End-to-end tests for the worker pool
//!
//! Covers queue capacity, bounded concurrency and shutdown behaviour.

mod common;

use background_core::{PoolConfig, PoolError, PoolState, WorkerPool};
use common::{wait_until, GatedJob, SleepJob};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

struct Counters {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl Counters {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn sleep_job(&self, id: usize, duration: Duration) -> Box<SleepJob> {
        Box::new(SleepJob {
            id,
            duration,
            running: self.running.clone(),
            peak: self.peak.clone(),
            completed: self.completed.clone(),
        })
    }
}

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_capacity_before_start() {
    let pool = WorkerPool::new(PoolConfig::new("capacity", 2, 5));
    let counters = Counters::new();

    let accepted: Vec<bool> = (0..7)
        .map(|i| pool.submit(counters.sleep_job(i, Duration::from_millis(10))))
        .collect();
    assert_eq!(accepted, vec![true, true, true, true, true, false, false]);
    assert_eq!(pool.queue_length(), 5);

    pool.start(&CancellationToken::new());
    assert!(
        wait_until(Duration::from_secs(5), || {
            counters.completed.load(Ordering::SeqCst) == 5
        })
        .await
    );
    assert!(counters.peak.load(Ordering::SeqCst) <= 2);

    // Drained, so capacity is back.
    assert!(pool.submit(counters.sleep_job(7, Duration::from_millis(10))));
    assert!(
        wait_until(Duration::from_secs(5), || {
            counters.completed.load(Ordering::SeqCst) == 6
        })
        .await
    );
    pool.stop().await;
    assert_eq!(counters.completed.load(Ordering::SeqCst), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_capacity_with_busy_workers() {
    let pool = WorkerPool::new(PoolConfig::new("busy", 2, 5));
    let gate = Arc::new(Semaphore::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let gated = |id: usize| {
        Box::new(GatedJob {
            id,
            gate: gate.clone(),
            completed: completed.clone(),
        })
    };

    pool.start(&CancellationToken::new());

    // Two jobs occupy the workers, a third is held by the dispatcher waiting
    // for a free slot.
    for id in 0..3 {
        assert!(pool.submit(gated(id)));
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            pool.active_workers() == 2 && pool.queue_length() == 0
        })
        .await
    );

    let accepted: Vec<bool> = (3..10).map(|id| pool.submit(gated(id))).collect();
    assert_eq!(accepted, vec![true, true, true, true, true, false, false]);

    gate.add_permits(100);
    assert!(
        wait_until(Duration::from_secs(5), || {
            completed.load(Ordering::SeqCst) == 8
        })
        .await
    );
    pool.stop().await;
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrency_never_exceeds_max_workers() {
    let pool = WorkerPool::new(PoolConfig::new("bounded", 3, 50));
    let counters = Counters::new();
    pool.start(&CancellationToken::new());

    for i in 0..30 {
        assert!(pool.submit(counters.sleep_job(i, Duration::from_millis(20))));
    }
    assert!(
        wait_until(Duration::from_secs(10), || {
            counters.completed.load(Ordering::SeqCst) == 30
        })
        .await
    );
    pool.stop().await;

    assert_eq!(counters.completed.load(Ordering::SeqCst), 30);
    assert_eq!(counters.peak.load(Ordering::SeqCst), 3);
    assert_eq!(pool.active_workers(), 0);
}

// =============================================================================
// Blocking submission
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_wait_applies_backpressure() {
    let pool = Arc::new(WorkerPool::new(PoolConfig::new("backpressure", 1, 1)));
    let counters = Counters::new();
    pool.start(&CancellationToken::new());

    let caller = CancellationToken::new();
    for i in 0..10 {
        pool.submit_wait(&caller, counters.sleep_job(i, Duration::from_millis(5)))
            .await
            .unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            counters.completed.load(Ordering::SeqCst) == 10
        })
        .await
    );
    pool.stop().await;
    assert_eq!(counters.completed.load(Ordering::SeqCst), 10);
    assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_submit_wait_after_stop() {
    let pool = WorkerPool::new(PoolConfig::new("stopped", 1, 1));
    let counters = Counters::new();
    pool.start(&CancellationToken::new());
    pool.stop().await;

    assert_eq!(pool.state(), PoolState::Stopped);
    let result = pool
        .submit_wait(&CancellationToken::new(), counters.sleep_job(0, Duration::ZERO))
        .await;
    assert_eq!(result, Err(PoolError::Stopped));
    assert!(!pool.submit(counters.sleep_job(1, Duration::ZERO)));
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_discards_queued_jobs() {
    let pool = WorkerPool::new(PoolConfig::new("discard", 1, 5));
    let counters = Counters::new();
    pool.start(&CancellationToken::new());

    for i in 0..4 {
        assert!(pool.submit(counters.sleep_job(i, Duration::from_millis(200))));
    }
    assert!(wait_until(Duration::from_secs(5), || pool.active_workers() == 1).await);

    // Only the running job finishes, the rest never start.
    pool.stop().await;
    assert_eq!(counters.completed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.active_workers(), 0);
    assert_eq!(pool.queue_length(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parent_cancellation_reaches_running_jobs() {
    struct WaitForCancel {
        observed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl background_core::Job for WaitForCancel {
        fn id(&self) -> String {
            "wait-for-cancel".to_string()
        }

        async fn execute(&self, ctx: CancellationToken) -> anyhow::Result<()> {
            ctx.cancelled().await;
            self.observed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let pool = WorkerPool::new(PoolConfig::new("cancel", 2, 4));
    let observed = Arc::new(AtomicUsize::new(0));
    let root = CancellationToken::new();
    pool.start(&root);

    for _ in 0..2 {
        assert!(pool.submit(Box::new(WaitForCancel {
            observed: observed.clone(),
        })));
    }
    assert!(wait_until(Duration::from_secs(5), || pool.active_workers() == 2).await);

    root.cancel();
    pool.stop().await;
    assert_eq!(observed.load(Ordering::SeqCst), 2);
}
