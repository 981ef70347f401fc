//! Task execution traits and runtime spawning abstraction.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::AppResult;

/// Identifier assigned to every submitted task, unique per queue or pool.
pub type TaskId = u64;

/// Identifier of one executor handle inside a worker pool.
pub type ExecutorId = usize;

/// Per-task context handed to a [`WorkerExecutor`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task identifier assigned at submission.
    pub task_id: TaskId,
    /// Executor running the task.
    pub executor_id: ExecutorId,
    /// Fires when the task times out, the caller goes away, or the pool is
    /// terminated. Long-running executors should observe it and return early.
    pub cancellation: CancellationToken,
}

/// Executor trait for worker pools.
///
/// The executor is cloned into every executor thread. Result types do not
/// need to be serializable, so channels and handles are fine.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_orchestra::core::{AppResult, TaskContext, WorkerExecutor};
///
/// #[derive(Clone)]
/// struct Hasher;
///
/// #[async_trait]
/// impl WorkerExecutor<Vec<u8>, u64> for Hasher {
///     async fn execute(&self, payload: Vec<u8>, _ctx: TaskContext) -> AppResult<u64> {
///         Ok(payload.iter().map(|b| u64::from(*b)).sum())
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerExecutor<P, R>: Send + Sync + Clone + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Execute a task payload and return the result.
    ///
    /// # Threading
    ///
    /// Called from a dedicated executor thread with its own single-threaded
    /// tokio runtime, so CPU-bound work does not stall the caller's runtime.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller as
    /// [`PoolError::TaskExecutionFailed`](super::PoolError::TaskExecutionFailed).
    async fn execute(&self, payload: P, ctx: TaskContext) -> AppResult<R>;
}

/// Adapter turning an async closure into a [`WorkerExecutor`].
#[derive(Clone)]
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    /// Wrap `f`.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<P, R, F, Fut> WorkerExecutor<P, R> for FnExecutor<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P, TaskContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = AppResult<R>> + Send + 'static,
{
    async fn execute(&self, payload: P, ctx: TaskContext) -> AppResult<R> {
        (self.f)(payload, ctx).await
    }
}

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn: Send + Sync + 'static {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
