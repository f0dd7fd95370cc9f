//! Durable delayed job queue with deduplication, retries and per-lane consumers.
//!
//! ## Components
//!
//! - [`Job`]: payload plus scheduling/retry metadata
//! - [`JobStore`]: persistence (in-memory, or Redis behind the `redis` feature)
//! - [`JobQueue`]: cloneable producer (`enqueue`, `cancel`, inspection)
//! - [`WorkerPool`]: one consumer loop per lane with its own concurrency limit
//!
//! Delivery is at-least-once: handlers must be idempotent.

pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;
pub mod worker;

pub use queue::{JobQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, EnqueueOptions, Job, JobAttemptRecord, JobHandle, JobId, JobStatus,
    QueueName, RetentionPolicy, RetryPolicy,
};
pub use worker::{HandlerError, JobHandler, LaneConfig, LaneStats, WorkerPool, WorkerPoolHandle};
