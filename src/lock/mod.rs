//! Session-scoped advisory locks used to elect a single runner across instances.
//!
//! A [`LockStore`] hands out [`LockSession`]s. A session behaves like one
//! dedicated database connection: locks acquired through it belong to it, and
//! dropping the session releases whatever it still holds.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod schema;
mod sqlite_lock_store;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryLockStore;
#[cfg(feature = "postgres")]
pub use postgres::PgLockStore;
pub use sqlite_lock_store::{SqliteLockStore, DEFAULT_BUSY_TIMEOUT, DEFAULT_LEASE};

#[derive(Debug, Error)]
pub enum LockError {
    /// The backend could not provide a session.
    #[error("lock store connection failed: {0}")]
    Connection(String),

    /// A lock or unlock statement failed on an established session.
    #[error("lock store query failed: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Check out a dedicated session. Acquire and release of one lock must go
    /// through the same session.
    async fn checkout(&self) -> Result<Box<dyn LockSession>, LockError>;
}

#[async_trait]
pub trait LockSession: Send {
    /// Try to take `lock_id` without waiting. `Ok(false)` means another session
    /// holds it.
    async fn try_acquire(&mut self, lock_id: i64) -> Result<bool, LockError>;

    /// Release `lock_id` if this session holds it.
    async fn release(&mut self, lock_id: i64) -> Result<(), LockError>;
}
