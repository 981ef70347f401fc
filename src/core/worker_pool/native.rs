//! Native implementation of `WorkerPool` using OS threads.
//!
//! Each executor thread owns a single-threaded tokio runtime and receives
//! one job at a time over a `crossbeam_channel::bounded(1)` channel. All
//! dispatch decisions (which executor, spawn or overflow) are taken under
//! the pool's `parking_lot::Mutex`. While a task runs, the caller's reply
//! sender stays with the pool: completion, timeout and termination each
//! take it under that lock, so a task is settled exactly once.
//!
//! Timeouts are enforced by one watchdog thread per pool, whether or not
//! the caller is still waiting. Executors and the watchdog hold a `Weak`
//! reference so a dropped pool never stays alive because of them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::executor::{ExecutorId, TaskContext, TaskId, WorkerExecutor};
use crate::util::panic_message;

use super::{PoolCounters, PoolError, PoolStats};

type Reply<R> = oneshot::Sender<Result<R, PoolError>>;

/// A submitted task waiting for an executor.
struct Job<P, R> {
    task_id: TaskId,
    payload: P,
    cancellation: CancellationToken,
    reply: Reply<R>,
}

/// The part of a job the executor thread receives.
struct Dispatch<P> {
    task_id: TaskId,
    payload: P,
    cancellation: CancellationToken,
}

/// Task currently owned by an executor.
struct Running<R> {
    task_id: TaskId,
    cancellation: CancellationToken,
    reply: Reply<R>,
}

/// Pool-side view of one executor thread.
struct ExecutorHandle<P, R> {
    id: ExecutorId,
    job_tx: Sender<Dispatch<P>>,
    /// `None` when idle.
    current: Option<Running<R>>,
}

/// Expiry of one running task, armed by its executor when the task starts.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    executor_id: ExecutorId,
    task_id: TaskId,
}

/// How an executor finished with its task.
enum Settled<R> {
    Finished {
        result: Result<R, PoolError>,
        healthy: bool,
    },
    /// The caller went away before the task produced anything.
    Cancelled,
}

struct PoolState<P, R> {
    executors: Vec<ExecutorHandle<P, R>>,
    overflow: VecDeque<Job<P, R>>,
    /// Started with the first executor; dropped on terminate.
    watchdog: Option<Sender<Deadline>>,
    terminated: bool,
}

struct Shared<P, R, E> {
    config: WorkerPoolConfig,
    executor: E,
    state: Mutex<PoolState<P, R>>,
    counters: PoolCounters,
    next_executor_id: AtomicUsize,
    next_task_id: AtomicU64,
    shutdown: CancellationToken,
}

impl<P, R, E> Shared<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    fn submit(self: &Arc<Self>, job: Job<P, R>) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return Err(PoolError::PoolTerminated);
            }
            if let Some(depth) = self.config.max_queue_depth {
                let has_capacity = state.executors.len() < self.config.max_executors
                    || state.executors.iter().any(|e| e.current.is_none());
                if !has_capacity && state.overflow.len() >= depth {
                    warn!(depth, "worker pool overflow queue is full");
                    return Err(PoolError::QueueFull);
                }
            }
            state.overflow.push_back(job);
        }
        self.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        self.pump();
        Ok(())
    }

    /// Hand overflow jobs to idle executors, spawning new ones while under
    /// the limit. Stops at the first job that finds no capacity.
    fn pump(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while !state.terminated {
            let Some(job) = state.overflow.pop_front() else {
                break;
            };
            if job.cancellation.is_cancelled() {
                self.counters.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = job.task_id, "dropping overflow job whose caller left");
                continue;
            }

            let idx = if let Some(idx) = state.executors.iter().position(|e| e.current.is_none()) {
                idx
            } else if state.executors.len() < self.config.max_executors {
                match self.spawn_executor(&mut state) {
                    Ok(handle) => {
                        state.executors.push(handle);
                        state.executors.len() - 1
                    }
                    Err(e) => {
                        error!(error = %e, "failed to spawn executor thread");
                        self.counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                        let _ = job
                            .reply
                            .send(Err(PoolError::Internal(format!("failed to spawn executor: {e}"))));
                        continue;
                    }
                }
            } else {
                state.overflow.push_front(job);
                break;
            };

            let Job {
                task_id,
                payload,
                cancellation,
                reply,
            } = job;
            let dispatch = Dispatch {
                task_id,
                payload,
                cancellation: cancellation.clone(),
            };
            match state.executors[idx].job_tx.try_send(dispatch) {
                Ok(()) => {
                    let executor = &mut state.executors[idx];
                    executor.current = Some(Running {
                        task_id,
                        cancellation,
                        reply,
                    });
                    debug!(executor_id = executor.id, task_id, "task dispatched");
                }
                Err(err) => {
                    // The executor thread is gone; forget it and retry the job.
                    let dead = state.executors.swap_remove(idx);
                    warn!(executor_id = dead.id, "executor unavailable, discarding");
                    let Dispatch { payload, .. } = err.into_inner();
                    state.overflow.push_front(Job {
                        task_id,
                        payload,
                        cancellation,
                        reply,
                    });
                }
            }
        }
    }

    fn spawn_executor(
        self: &Arc<Self>,
        state: &mut PoolState<P, R>,
    ) -> std::io::Result<ExecutorHandle<P, R>> {
        let watchdog = match &state.watchdog {
            Some(tx) => tx.clone(),
            None => {
                let tx = self.spawn_watchdog()?;
                state.watchdog = Some(tx.clone());
                tx
            }
        };

        let id = self.next_executor_id.fetch_add(1, Ordering::Relaxed);
        let (job_tx, job_rx) = bounded::<Dispatch<P>>(1);
        let shared = Arc::downgrade(self);
        let executor = self.executor.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.config.task_timeout();

        thread::Builder::new()
            .name(format!("{}-{id}", self.config.thread_name_prefix))
            .stack_size(self.config.thread_stack_size)
            .spawn(move || {
                run_executor(id, &job_rx, &shared, &executor, &shutdown, &watchdog, timeout);
            })?;

        debug!(executor_id = id, "executor spawned");
        Ok(ExecutorHandle {
            id,
            job_tx,
            current: None,
        })
    }

    fn spawn_watchdog(self: &Arc<Self>) -> std::io::Result<Sender<Deadline>> {
        let (tx, rx) = unbounded();
        let shared = Arc::downgrade(self);
        thread::Builder::new()
            .name(format!("{}-watchdog", self.config.thread_name_prefix))
            .spawn(move || run_watchdog(&rx, &shared))?;
        debug!("watchdog spawned");
        Ok(tx)
    }

    /// Record the end of a task and deliver its result. Returns whether the
    /// executor stays in the pool; `false` tells the thread to exit.
    fn finish(self: &Arc<Self>, executor_id: ExecutorId, task_id: TaskId, settled: Settled<R>) -> bool {
        let (retained, delivery) = {
            let mut state = self.state.lock();
            let Some(idx) = state.executors.iter().position(|e| {
                e.id == executor_id && e.current.as_ref().is_some_and(|r| r.task_id == task_id)
            }) else {
                // Retired after a timeout, or the pool was terminated.
                return false;
            };
            let running = state.executors[idx].current.take();

            let (result, healthy) = match settled {
                Settled::Finished { result, healthy } => {
                    let counter = if result.is_ok() {
                        &self.counters.completed_tasks
                    } else {
                        &self.counters.failed_tasks
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    (Some(result), healthy)
                }
                Settled::Cancelled => {
                    self.counters.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
                    (None, true)
                }
            };

            let retained = healthy && !state.terminated;
            if !retained {
                state.executors.swap_remove(idx);
            }
            (retained, running.zip(result))
        };

        if let Some((running, result)) = delivery {
            // The caller may have stopped waiting.
            let _ = running.reply.send(result);
        }
        self.pump();
        retained
    }

    /// Abandon an executor whose task outlived its deadline: cancel the
    /// task, fail the caller with `TaskTimeout`, drop the executor from the
    /// pool and free its slot. No-op if the task already settled.
    fn retire(self: &Arc<Self>, executor_id: ExecutorId, task_id: TaskId) {
        let removed = {
            let mut state = self.state.lock();
            let pos = state.executors.iter().position(|e| {
                e.id == executor_id && e.current.as_ref().is_some_and(|r| r.task_id == task_id)
            });
            pos.map(|idx| state.executors.swap_remove(idx))
        };
        let Some(mut handle) = removed else {
            return;
        };
        if let Some(running) = handle.current.take() {
            running.cancellation.cancel();
            let _ = running
                .reply
                .send(Err(PoolError::TaskTimeout(self.config.task_timeout())));
        }
        self.counters.timed_out_tasks.fetch_add(1, Ordering::Relaxed);
        warn!(executor_id, task_id, "task timed out, executor discarded");
        // Closing the job channel lets the thread exit once its task returns.
        drop(handle);
        self.pump();
    }

    /// Remove an executor that could not start, failing the task it was given.
    fn discard(self: &Arc<Self>, executor_id: ExecutorId, reason: &str) {
        let removed = {
            let mut state = self.state.lock();
            let pos = state.executors.iter().position(|e| e.id == executor_id);
            pos.map(|idx| state.executors.swap_remove(idx))
        };
        if let Some(running) = removed.and_then(|mut handle| handle.current.take()) {
            self.counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
            let _ = running.reply.send(Err(PoolError::Internal(reason.to_string())));
        }
        self.pump();
    }
}

/// Fixed-capacity pool of executor threads for CPU-bound work.
///
/// Executors are created lazily, one per concurrently running task, up to
/// `max_executors`. Every dispatched task is bounded by `task_timeout`,
/// measured from the moment an executor picks it up, and enforced even when
/// nobody awaits the result any more.
///
/// Dropping the pool terminates it.
pub struct WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    shared: Arc<Shared<P, R, E>>,
}

impl<P, R, E> WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    /// Create a new worker pool with the given configuration and executor.
    ///
    /// No threads are spawned until work arrives.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: WorkerPoolConfig, executor: E) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        info!(
            max_executors = config.max_executors,
            task_timeout_ms = config.task_timeout_ms,
            max_queue_depth = ?config.max_queue_depth,
            "worker pool initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    executors: Vec::with_capacity(config.max_executors),
                    overflow: VecDeque::new(),
                    watchdog: None,
                    terminated: false,
                }),
                config,
                executor,
                counters: PoolCounters::default(),
                next_executor_id: AtomicUsize::new(0),
                next_task_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Run `payload` on an executor and wait for its result.
    ///
    /// Dropping the returned future cancels the task. A queued task is then
    /// never started; a running one has its future dropped at the next
    /// `.await`. Work that blocks its thread keeps the executor until it
    /// returns or its timeout retires the executor.
    ///
    /// # Errors
    ///
    /// - `PoolError::TaskTimeout` if the task did not settle in time
    /// - `PoolError::TaskExecutionFailed` if the executor failed or panicked
    /// - `PoolError::PoolTerminated` if the pool is or becomes terminated
    /// - `PoolError::QueueFull` if the overflow queue is at its limit
    pub async fn execute_task(&self, payload: P) -> Result<R, PoolError> {
        let task_id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancellation = self.shared.shutdown.child_token();
        let (reply, result_rx) = oneshot::channel();

        self.shared.submit(Job {
            task_id,
            payload,
            cancellation: cancellation.clone(),
            reply,
        })?;
        debug!(task_id, "task submitted");

        let guard = cancellation.drop_guard();
        let result = result_rx
            .await
            .unwrap_or_else(|_| Err(PoolError::Internal("task ended without a result".into())));
        guard.disarm();
        result
    }

    /// Terminate the pool: close every executor's channel, cancel running
    /// tasks, fail running and queued work with `PoolError::PoolTerminated`,
    /// and reject further submissions. Idempotent.
    ///
    /// Executor threads are detached, not joined; one that is stuck in a
    /// task exits once that task returns.
    pub fn terminate(&self) {
        let (executors, overflow, watchdog) = {
            let mut state = self.shared.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            (
                std::mem::take(&mut state.executors),
                std::mem::take(&mut state.overflow),
                state.watchdog.take(),
            )
        };

        self.shared.shutdown.cancel();
        let running = executors.len();
        for mut handle in executors {
            if let Some(task) = handle.current.take() {
                let _ = task.reply.send(Err(PoolError::PoolTerminated));
            }
        }
        let pending = overflow.len();
        for job in overflow {
            let _ = job.reply.send(Err(PoolError::PoolTerminated));
        }
        drop(watchdog);

        info!(executors = running, pending, "worker pool terminated");
    }

    /// Whether [`terminate`](Self::terminate) has run.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }

    /// Executors alive now.
    #[must_use]
    pub fn executor_count(&self) -> usize {
        self.shared.state.lock().executors.len()
    }

    /// Executors running a task.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .executors
            .iter()
            .filter(|e| e.current.is_some())
            .count()
    }

    /// Tasks waiting in the overflow queue.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().overflow.len()
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (executor_count, active, queued) = {
            let state = self.shared.state.lock();
            (
                state.executors.len(),
                state.executors.iter().filter(|e| e.current.is_some()).count(),
                state.overflow.len(),
            )
        };
        self.shared
            .counters
            .snapshot(self.shared.config.max_executors, executor_count, active, queued)
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }
}

impl<P, R, E> Drop for WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Executor thread body.
fn run_executor<P, R, E>(
    id: ExecutorId,
    jobs: &Receiver<Dispatch<P>>,
    shared: &Weak<Shared<P, R, E>>,
    executor: &E,
    shutdown: &CancellationToken,
    watchdog: &Sender<Deadline>,
    timeout: Duration,
) where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(executor_id = id, error = %e, "failed to create executor runtime");
            if let Some(shared) = shared.upgrade() {
                shared.discard(id, &format!("executor runtime unavailable: {e}"));
            }
            return;
        }
    };

    debug!(executor_id = id, "executor thread started");

    // Blocks until a job arrives; returns Err once the pool drops the sender.
    while let Ok(Dispatch {
        task_id,
        payload,
        cancellation,
    }) = jobs.recv()
    {
        if shutdown.is_cancelled() {
            // `terminate` already failed the caller.
            break;
        }

        let settled = if cancellation.is_cancelled() {
            debug!(executor_id = id, task_id, "skipping task cancelled before start");
            Settled::Cancelled
        } else {
            if let Some(at) = Instant::now().checked_add(timeout) {
                let _ = watchdog.send(Deadline {
                    at,
                    executor_id: id,
                    task_id,
                });
            }
            debug!(executor_id = id, task_id, "executing task");
            run_task(id, task_id, &runtime, executor, payload, &cancellation)
        };

        let retained = shared
            .upgrade()
            .is_some_and(|s| s.finish(id, task_id, settled));
        if !retained {
            break;
        }
    }

    debug!(executor_id = id, "executor thread exiting");
}

/// Run one task to completion, panic or cancellation.
fn run_task<P, R, E>(
    executor_id: ExecutorId,
    task_id: TaskId,
    runtime: &Runtime,
    executor: &E,
    payload: P,
    cancellation: &CancellationToken,
) -> Settled<R>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    let ctx = TaskContext {
        task_id,
        executor_id,
        cancellation: cancellation.clone(),
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => None,
                result = executor.execute(payload, ctx) => Some(result),
            }
        })
    }));

    match outcome {
        Ok(Some(Ok(value))) => Settled::Finished {
            result: Ok(value),
            healthy: true,
        },
        Ok(Some(Err(e))) => {
            debug!(executor_id, task_id, error = %e, "task failed");
            Settled::Finished {
                result: Err(PoolError::TaskExecutionFailed(format!("{e:#}"))),
                healthy: true,
            }
        }
        Ok(None) => {
            debug!(executor_id, task_id, "task dropped after cancellation");
            Settled::Cancelled
        }
        Err(panic) => {
            let msg = panic_message(&*panic);
            error!(executor_id, task_id, panic = %msg, "executor panicked");
            Settled::Finished {
                result: Err(PoolError::TaskExecutionFailed(format!("executor panicked: {msg}"))),
                healthy: false,
            }
        }
    }
}

/// Watchdog thread body: retires executors whose task outlived its deadline.
///
/// Deadlines of tasks that already settled are stale; retiring them is a
/// no-op because the executor no longer runs that task id.
fn run_watchdog<P, R, E>(deadlines: &Receiver<Deadline>, shared: &Weak<Shared<P, R, E>>)
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    let mut armed: BinaryHeap<Reverse<Deadline>> = BinaryHeap::new();
    loop {
        let received = match armed.peek() {
            Some(Reverse(next)) => deadlines.recv_deadline(next.at),
            None => deadlines.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(deadline) => armed.push(Reverse(deadline)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while armed.peek().is_some_and(|Reverse(next)| next.at <= now) {
            let Some(Reverse(expired)) = armed.pop() else {
                break;
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.retire(expired.executor_id, expired.task_id);
        }
    }
    debug!("watchdog exiting");
}
