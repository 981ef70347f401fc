//! Bounded-concurrency FIFO task scheduler.
//!
//! At most `concurrency` tasks run at once; the rest wait in submission
//! order. Admission happens in one place (`QueueCore::admit`) under a
//! `parking_lot::Mutex` that is never held across an `.await`. Admitted
//! tasks are handed to a [`Spawn`] implementation, so the queue itself is
//! runtime-agnostic.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TaskQueueConfig;
use crate::runtime::TokioSpawner;
use crate::util::panic_message;

use super::{ConfigError, QueueError, Spawn, TaskId};

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a free slot.
    Queued,
    /// Admitted and running.
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an error or a panic.
    Failed,
    /// Discarded before it started.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will not change state again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Configured concurrency limit.
    pub concurrency: usize,
    /// Tasks running now.
    pub running: usize,
    /// Tasks waiting for a slot.
    pub pending: usize,
    /// Tasks ever added.
    pub submitted: u64,
    /// Tasks that finished with a value.
    pub completed: u64,
    /// Tasks that finished with an error or panicked.
    pub failed: u64,
    /// Tasks discarded before they started.
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

enum Outcome {
    Completed,
    Failed,
    Panicked,
}

/// Result of running a task body: how it ended, plus the deferred delivery
/// of its value to the [`TaskHandle`]. Delivery runs after the slot is freed.
struct Completion {
    outcome: Outcome,
    deliver: Box<dyn FnOnce() + Send>,
}

type TaskBody = Box<dyn FnOnce() -> BoxFuture<'static, Completion> + Send>;

struct QueuedTask {
    id: TaskId,
    enqueued_at: Instant,
    cancellation: CancellationToken,
    status: Arc<Mutex<TaskStatus>>,
    body: TaskBody,
}

struct QueueState {
    pending: VecDeque<QueuedTask>,
    running: usize,
}

struct QueueCore {
    concurrency: usize,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    counters: QueueCounters,
}

impl QueueCore {
    /// Pop queued tasks into free slots. Tasks whose token already fired are
    /// skipped and count as cancelled.
    fn admit(&self) -> Vec<QueuedTask> {
        let mut admitted = Vec::new();
        let mut skipped = Vec::new();
        {
            let mut state = self.state.lock();
            while state.running < self.concurrency {
                let Some(task) = state.pending.pop_front() else {
                    break;
                };
                if task.cancellation.is_cancelled() {
                    *task.status.lock() = TaskStatus::Cancelled;
                    skipped.push(task);
                    continue;
                }
                state.running += 1;
                *task.status.lock() = TaskStatus::Running;
                admitted.push(task);
            }
        }
        if !skipped.is_empty() {
            self.counters
                .cancelled
                .fetch_add(skipped.len() as u64, Ordering::Relaxed);
        }
        admitted
    }

    fn finish(&self, id: TaskId, status: &Mutex<TaskStatus>, outcome: &Outcome) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        let next = match outcome {
            Outcome::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                TaskStatus::Completed
            }
            Outcome::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                TaskStatus::Failed
            }
            Outcome::Panicked => {
                warn!(task_id = id, "queued task panicked");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                TaskStatus::Failed
            }
        };
        *status.lock() = next;
    }

    /// Free the slot of an admitted task whose future was dropped before it
    /// settled, e.g. because the runtime shut down.
    fn abandon(&self, id: TaskId, status: &Mutex<TaskStatus>) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        *status.lock() = TaskStatus::Cancelled;
        warn!(task_id = id, "admitted task dropped before it settled");
    }

    /// Remove one queued task. Returns `false` if it already left the queue.
    fn discard(&self, id: TaskId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(pos) = state.pending.iter().position(|t| t.id == id) else {
                return false;
            };
            let task = state.pending.remove(pos);
            if let Some(task) = &task {
                *task.status.lock() = TaskStatus::Cancelled;
            }
            task
        };
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = id, "queued task cancelled");
        // Dropping the body closes the result channel outside the lock.
        drop(removed);
        true
    }
}

/// Scheduler that runs at most `concurrency` asynchronous tasks at a time,
/// admitting the rest in FIFO order as slots free up.
///
/// # Example
///
/// ```rust,ignore
/// use prometheus_orchestra::config::TaskQueueConfig;
/// use prometheus_orchestra::core::BoundedTaskQueue;
///
/// let queue = BoundedTaskQueue::tokio(TaskQueueConfig::new().with_concurrency(2))?;
/// let handle = queue.add(|| async { Ok::<_, std::io::Error>(42) });
/// assert_eq!(handle.await?, 42);
/// ```
pub struct BoundedTaskQueue<S: Spawn = TokioSpawner> {
    core: Arc<QueueCore>,
    spawner: Arc<S>,
}

impl<S: Spawn> Clone for BoundedTaskQueue<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            spawner: Arc::clone(&self.spawner),
        }
    }
}

impl<S: Spawn> fmt::Debug for BoundedTaskQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTaskQueue")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BoundedTaskQueue<TokioSpawner> {
    /// Create a queue that spawns onto the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn tokio(config: TaskQueueConfig) -> Result<Self, ConfigError> {
        Self::new(config, TokioSpawner::current())
    }
}

impl<S: Spawn> BoundedTaskQueue<S> {
    /// Create a queue that runs admitted tasks through `spawner`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: TaskQueueConfig, spawner: S) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError)?;
        Ok(Self {
            core: Arc::new(QueueCore {
                concurrency: config.concurrency,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    running: 0,
                }),
                next_id: AtomicU64::new(1),
                counters: QueueCounters::default(),
            }),
            spawner: Arc::new(spawner),
        })
    }

    /// Enqueue a zero-argument async operation.
    ///
    /// The operation starts immediately if a slot is free, otherwise once
    /// every task added before it has been admitted. Dropping the returned
    /// handle does not cancel the task.
    pub fn add<T, E, F, Fut>(&self, op: F) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.add_cancellable(move |_| op())
    }

    /// Enqueue an operation that receives the task's cancellation token.
    pub fn add_cancellable<T, E, F, Fut>(&self, op: F) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let cancellation = CancellationToken::new();
        let status = Arc::new(Mutex::new(TaskStatus::Queued));
        let (tx, rx) = oneshot::channel();

        let token = cancellation.clone();
        let body: TaskBody = Box::new(move || {
            async move {
                let result = AssertUnwindSafe(async move { op(token).await })
                    .catch_unwind()
                    .await;
                let (outcome, value) = match result {
                    Ok(Ok(v)) => (Outcome::Completed, Ok(v)),
                    Ok(Err(e)) => (Outcome::Failed, Err(QueueError::Failed(e))),
                    Err(panic) => (
                        Outcome::Panicked,
                        Err(QueueError::Panicked(panic_message(&*panic))),
                    ),
                };
                Completion {
                    outcome,
                    deliver: Box::new(move || {
                        // The handle may have been dropped; nobody is listening then.
                        let _ = tx.send(value);
                    }),
                }
            }
            .boxed()
        });

        let pending = {
            let mut state = self.core.state.lock();
            state.pending.push_back(QueuedTask {
                id,
                enqueued_at: Instant::now(),
                cancellation: cancellation.clone(),
                status: Arc::clone(&status),
                body,
            });
            state.pending.len()
        };
        self.core.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = id, pending, "task queued");

        pump(&self.core, &self.spawner);

        TaskHandle {
            id,
            rx,
            cancellation,
            status,
            queue: Arc::downgrade(&self.core),
        }
    }

    /// Discard every task that has not started. Their handles resolve to
    /// [`QueueError::Cancelled`]; running tasks are unaffected.
    ///
    /// Returns the number of tasks discarded.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueuedTask> = self.core.state.lock().pending.drain(..).collect();
        for task in &drained {
            task.cancellation.cancel();
            *task.status.lock() = TaskStatus::Cancelled;
        }
        let count = drained.len();
        self.core
            .counters
            .cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            debug!(count, "queue cleared");
        }
        count
    }

    /// Tasks waiting for a slot.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.state.lock().pending.len()
    }

    /// Tasks running now.
    #[must_use]
    pub fn running(&self) -> usize {
        self.core.state.lock().running
    }

    /// Configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.core.concurrency
    }

    /// Whether nothing is queued or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.core.state.lock();
        state.pending.is_empty() && state.running == 0
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let (running, pending) = {
            let state = self.core.state.lock();
            (state.running, state.pending.len())
        };
        let counters = &self.core.counters;
        QueueStats {
            concurrency: self.core.concurrency,
            running,
            pending,
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Running slot held by a spawned task. Dropping it unsettled gives the
/// slot back, so a spawner that discards the future cannot leak it.
struct Slot {
    core: Arc<QueueCore>,
    id: TaskId,
    status: Arc<Mutex<TaskStatus>>,
    settled: bool,
}

impl Slot {
    fn settle(&mut self, outcome: &Outcome) {
        self.settled = true;
        self.core.finish(self.id, &self.status, outcome);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.settled {
            self.core.abandon(self.id, &self.status);
        }
    }
}

/// Admit as many tasks as there are free slots and spawn them. Each spawned
/// task frees its slot and pumps again when it settles.
fn pump<S: Spawn>(core: &Arc<QueueCore>, spawner: &Arc<S>) {
    for task in core.admit() {
        let QueuedTask {
            id,
            enqueued_at,
            status,
            body,
            ..
        } = task;
        debug!(task_id = id, waited = ?enqueued_at.elapsed(), "task admitted");

        let mut slot = Slot {
            core: Arc::clone(core),
            id,
            status,
            settled: false,
        };
        let next_spawner = Arc::clone(spawner);
        spawner.spawn(async move {
            let Completion { outcome, deliver } = body().await;
            slot.settle(&outcome);
            deliver();
            pump(&slot.core, &next_spawner);
        });
    }
}

/// Future resolving to the outcome of a task added to a
/// [`BoundedTaskQueue`].
#[must_use = "a task handle does nothing unless awaited or cancelled"]
pub struct TaskHandle<T, E> {
    id: TaskId,
    rx: oneshot::Receiver<Result<T, QueueError<E>>>,
    cancellation: CancellationToken,
    status: Arc<Mutex<TaskStatus>>,
    queue: Weak<QueueCore>,
}

impl<T, E> TaskHandle<T, E> {
    /// Task identifier, unique within its queue.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    /// Token that fires when this task is cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Cancel the task. A queued task is removed and resolves to
    /// [`QueueError::Cancelled`]; a running task only sees its token fire.
    pub fn cancel(&self) {
        self.cancellation.cancel();
        if let Some(core) = self.queue.upgrade() {
            core.discard(self.id);
        }
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<T, QueueError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(QueueError::Cancelled)))
    }
}
