//! Error types for orchestration primitives.

use thiserror::Error;

/// Configuration rejected by a constructor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Errors produced by a [`ResourcePool`](super::ResourcePool).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourcePoolError {
    /// Every resource is in use and the pool is at its maximum size.
    #[error("resource pool exhausted: {in_use} of {max_size} resources in use")]
    Exhausted {
        /// Resources currently handed out.
        in_use: usize,
        /// Configured maximum.
        max_size: usize,
    },
    /// The factory failed to construct a new resource.
    #[error("resource creation failed: {0}")]
    CreateFailed(String),
    /// The factory's reset hook failed; the resource was discarded.
    #[error("resource reset failed: {0}")]
    ResetFailed(String),
}

impl ResourcePoolError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::CreateFailed(_))
    }
}

/// Outcome of a task submitted to a [`BoundedTaskQueue`](super::BoundedTaskQueue)
/// that did not produce a value.
#[derive(Debug, Error)]
pub enum QueueError<E> {
    /// The task was discarded before it started, or cancelled while queued.
    #[error("task cancelled")]
    Cancelled,
    /// The task panicked while running.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task's own error, passed through unchanged.
    #[error("task failed: {0}")]
    Failed(E),
}

impl<E> QueueError<E> {
    /// Whether the task was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The task's own error, if that is what this is.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Cancelled | Self::Panicked(_) => None,
        }
    }
}

/// Failure of [`RetryExecutor::execute_cancellable`](super::RetryExecutor::execute_cancellable).
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The cancellation token fired before an attempt succeeded.
    #[error("retry cancelled")]
    Cancelled,
    /// Every attempt failed; carries the final attempt's error.
    #[error("retry attempts exhausted: {0}")]
    Exhausted(E),
}

impl<E> RetryError<E> {
    /// The final attempt's error, if attempts ran out.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
