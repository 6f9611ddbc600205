//! Common test infrastructure
//!
//! Test jobs and helpers shared by the end-to-end tests.
//! Tests should only import from this module, not from internal submodules.

mod jobs;

pub use jobs::{GatedJob, SleepJob};

use std::time::Duration;

/// Poll `condition` every few milliseconds until it holds or `timeout` elapsed.
/// Returns the final value of the condition.
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
