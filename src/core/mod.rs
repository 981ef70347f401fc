//! Concurrency primitives: resource pooling, retries, bounded task
//! scheduling, the worker thread pool and middleware pipelines.

pub mod error;
pub mod executor;
pub mod pipeline;
pub mod resource_pool;
pub mod retry;
pub mod task_queue;
pub mod worker_pool;

pub use error::{AppResult, ConfigError, QueueError, ResourcePoolError, RetryError};
pub use executor::{ExecutorId, FnExecutor, Spawn, TaskContext, TaskId, WorkerExecutor};
pub use pipeline::{
    ErrorBoundary, Logging, Middleware, Next, Pipeline, PipelineContext, RecordDuration,
    RecordError, Timing,
};
pub use resource_pool::{PoolGuard, Pooled, ResourceFactory, ResourcePool};
pub use retry::{Backoff, RetryExecutor};
pub use task_queue::{BoundedTaskQueue, QueueStats, TaskHandle, TaskStatus};
pub use worker_pool::{PoolError, PoolStats, WorkerPool};

pub use tokio_util::sync::CancellationToken;
