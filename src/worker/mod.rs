//! In-process execution primitives: a bounded worker pool and a batch processor.

mod batch;
mod job;
mod pool;

pub use batch::{
    BatchConfig, BatchProcessor, ProcessFn, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_PROCESSOR_NAME,
};
pub use job::{
    Job, OnJobComplete, OnJobPanic, OnJobStart, PoolConfig, PoolError, DEFAULT_MAX_WORKERS,
    DEFAULT_POOL_NAME, DEFAULT_QUEUE_SIZE,
};
pub use pool::{PoolState, WorkerPool};

pub(crate) use job::panic_message;
