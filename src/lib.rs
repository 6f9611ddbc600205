//! Background execution core
//!
//! A bounded worker pool, a size/time triggered batch processor and periodic
//! singleton tasks coordinated through advisory locks.

pub mod background;
pub mod config;
pub mod lock;
pub mod metrics;
pub mod sqlite_persistence;
pub mod worker;

// Re-export commonly used types for convenience
pub use background::{generate_lock_id, SingletonConfig, SingletonTask};
pub use lock::{InMemoryLockStore, LockError, LockSession, LockStore, SqliteLockStore};
pub use worker::{BatchConfig, BatchProcessor, Job, PoolConfig, PoolError, PoolState, WorkerPool};

#[cfg(feature = "postgres")]
pub use lock::PgLockStore;
