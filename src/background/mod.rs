//! Periodic tasks that run on exactly one instance of a fleet.

mod singleton;

pub use singleton::{
    generate_lock_id, SingletonConfig, SingletonTask, TaskFn, DEFAULT_INTERVAL,
    LOCK_RELEASE_TIMEOUT,
};
