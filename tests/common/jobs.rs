use async_trait::async_trait;
use background_core::Job;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Sleeps for a fixed time and tracks how many instances run at once.
#[allow(dead_code)]
pub struct SleepJob {
    pub id: usize,
    pub duration: Duration,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub completed: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for SleepJob {
    fn id(&self) -> String {
        format!("sleep-{}", self.id)
    }

    async fn execute(&self, _ctx: CancellationToken) -> anyhow::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Blocks until a permit is added to its gate.
#[allow(dead_code)]
pub struct GatedJob {
    pub id: usize,
    pub gate: Arc<Semaphore>,
    pub completed: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for GatedJob {
    fn id(&self) -> String {
        format!("gated-{}", self.id)
    }

    async fn execute(&self, _ctx: CancellationToken) -> anyhow::Result<()> {
        let permit = self.gate.acquire().await?;
        permit.forget();
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
