//! Configuration models for queues, pools and retry policies.

pub mod pool;
pub mod retry;

pub use pool::{OrchestraConfig, ResourcePoolConfig, TaskQueueConfig, WorkerPoolConfig};
pub use retry::RetryPolicy;
