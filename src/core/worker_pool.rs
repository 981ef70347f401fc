//! Fixed-capacity worker pool backed by dedicated OS threads.
//!
//! Each executor is an OS thread with its own single-threaded tokio runtime,
//! so CPU-bound work never stalls the caller's runtime. Executors are
//! created lazily up to `max_executors`; work that finds every executor
//! busy waits in a FIFO overflow queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_orchestra::config::WorkerPoolConfig;
//! use prometheus_orchestra::core::{FnExecutor, WorkerPool};
//! use std::time::Duration;
//!
//! let pool = WorkerPool::new(
//!     WorkerPoolConfig::new()
//!         .with_max_executors(4)
//!         .with_task_timeout(Duration::from_secs(5)),
//!     FnExecutor::new(|n: u64, _ctx| async move { Ok(n * 2) }),
//! )?;
//!
//! assert_eq!(pool.execute_task(21).await?, 42);
//! ```

mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use native::WorkerPool;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The task did not settle within the configured timeout. Its executor
    /// was discarded.
    TaskTimeout(Duration),

    /// The executor returned an error or panicked.
    TaskExecutionFailed(String),

    /// The pool has been terminated.
    PoolTerminated,

    /// The overflow queue is at `max_queue_depth`.
    QueueFull,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// Internal error (executor thread could not start, channel closed, etc.).
    Internal(String),
}

impl PoolError {
    /// Whether submitting the same work again may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TaskTimeout(_) | Self::QueueFull)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskTimeout(after) => write!(f, "task timed out after {after:?}"),
            Self::TaskExecutionFailed(msg) => write!(f, "task execution failed: {msg}"),
            Self::PoolTerminated => write!(f, "pool has been terminated"),
            Self::QueueFull => write!(f, "task queue is full"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured executor limit.
    pub max_executors: usize,

    /// Executors alive now.
    pub executor_count: usize,

    /// Executors running a task.
    pub active_tasks: usize,

    /// Tasks waiting in the overflow queue.
    pub queued_tasks: usize,

    /// Total tasks accepted.
    pub submitted_tasks: u64,

    /// Total tasks that returned a value.
    pub completed_tasks: u64,

    /// Total tasks that returned an error or panicked.
    pub failed_tasks: u64,

    /// Total tasks abandoned after the timeout.
    pub timed_out_tasks: u64,

    /// Total tasks dropped because their caller went away.
    pub cancelled_tasks: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub submitted_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub timed_out_tasks: AtomicU64,
    pub cancelled_tasks: AtomicU64,
}

impl PoolCounters {
    /// Combine the counters with the live executor figures.
    pub fn snapshot(
        &self,
        max_executors: usize,
        executor_count: usize,
        active_tasks: usize,
        queued_tasks: usize,
    ) -> PoolStats {
        PoolStats {
            max_executors,
            executor_count,
            active_tasks,
            queued_tasks,
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            timed_out_tasks: self.timed_out_tasks.load(Ordering::Relaxed),
            cancelled_tasks: self.cancelled_tasks.load(Ordering::Relaxed),
        }
    }
}
