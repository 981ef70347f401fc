//! Integration tests for WorkerPool
//!
//! These tests validate:
//! - Basic task execution on dedicated executor threads
//! - Lazy executor creation bounded by `max_executors`
//! - FIFO dispatch of overflow work
//! - Timeout handling and executor replacement, with or without a waiting caller
//! - Execution failures, termination and queue limits
//! - Non-serializable results (channels)

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::join_all;
use prometheus_orchestra::config::WorkerPoolConfig;
use prometheus_orchestra::core::{
    AppResult, ExecutorId, PoolError, TaskContext, WorkerExecutor, WorkerPool,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// TEST EXECUTORS
// ============================================================================

/// Simple executor that adds two numbers
#[derive(Clone)]
struct AddExecutor;

#[async_trait]
impl WorkerExecutor<(i32, i32), i32> for AddExecutor {
    async fn execute(&self, payload: (i32, i32), _ctx: TaskContext) -> AppResult<i32> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(payload.0 + payload.1)
    }
}

/// Work items understood by `ScriptedExecutor`.
#[derive(Debug)]
enum Job {
    /// Record the value and return it with the executor id.
    Echo(u32),
    /// Fail with the given message.
    Fail(&'static str),
    /// Never settle until the task is cancelled.
    Hang,
    /// Never settle and ignore cancellation.
    Stall,
    /// Block the executor thread without yielding.
    Block(Duration),
}

#[derive(Clone, Default)]
struct ScriptedExecutor {
    order: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl WorkerExecutor<Job, (u32, ExecutorId)> for ScriptedExecutor {
    async fn execute(&self, job: Job, ctx: TaskContext) -> AppResult<(u32, ExecutorId)> {
        match job {
            Job::Echo(n) => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.order.lock().unwrap().push(n);
                Ok((n, ctx.executor_id))
            }
            Job::Fail(msg) => Err(anyhow!("{msg}")),
            Job::Hang => {
                ctx.cancellation.cancelled().await;
                Err(anyhow!("cancelled"))
            }
            Job::Stall => std::future::pending().await,
            Job::Block(duration) => {
                std::thread::sleep(duration);
                Ok((0, ctx.executor_id))
            }
        }
    }
}

/// Executor that tracks how many tasks run at once
#[derive(Clone, Default)]
struct CountingExecutor {
    execution_count: Arc<AtomicU64>,
    concurrent_count: Arc<AtomicU64>,
    max_concurrent: Arc<AtomicU64>,
}

#[async_trait]
impl WorkerExecutor<u64, u64> for CountingExecutor {
    async fn execute(&self, payload: u64, _ctx: TaskContext) -> AppResult<u64> {
        let now = self.concurrent_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        // Blocking sleep: executors are real threads.
        std::thread::sleep(Duration::from_millis(20));
        self.concurrent_count.fetch_sub(1, Ordering::SeqCst);
        self.execution_count.fetch_add(1, Ordering::SeqCst);
        Ok(payload * 2)
    }
}

/// Executor returning a channel receiver (not serializable)
#[derive(Clone)]
struct StreamingExecutor;

#[async_trait]
impl WorkerExecutor<usize, tokio::sync::mpsc::Receiver<String>> for StreamingExecutor {
    async fn execute(
        &self,
        tokens: usize,
        _ctx: TaskContext,
    ) -> AppResult<tokio::sync::mpsc::Receiver<String>> {
        let (tx, rx) = tokio::sync::mpsc::channel(tokens.max(1));
        for i in 0..tokens {
            tx.send(format!("token-{i}")).await?;
        }
        Ok(rx)
    }
}

fn config(max_executors: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new()
        .with_max_executors(max_executors)
        .with_task_timeout(Duration::from_secs(10))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// BASIC EXECUTION
// ============================================================================

#[tokio::test]
async fn test_basic_execution() {
    let pool = WorkerPool::new(config(2), AddExecutor).unwrap();

    assert_eq!(pool.execute_task((2, 3)).await.unwrap(), 5);
    assert_eq!(pool.execute_task((-1, 1)).await.unwrap(), 0);

    let stats = pool.stats();
    assert_eq!(stats.submitted_tasks, 2);
    assert_eq!(stats.completed_tasks, 2);
    assert_eq!(stats.failed_tasks, 0);
}

#[tokio::test]
async fn test_concurrency_bounded_by_max_executors() {
    let executor = CountingExecutor::default();
    let pool = WorkerPool::new(config(3), executor.clone()).unwrap();

    let results = join_all((0..12).map(|i| pool.execute_task(i))).await;
    let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();

    assert_eq!(values, (0..12).map(|i| i * 2).collect::<Vec<_>>());
    assert_eq!(executor.execution_count.load(Ordering::SeqCst), 12);
    assert!(executor.max_concurrent.load(Ordering::SeqCst) <= 3);
    assert!(pool.executor_count() <= 3);
}

#[tokio::test]
async fn test_overflow_dispatched_in_fifo_order() {
    let executor = ScriptedExecutor::default();
    let pool = WorkerPool::new(config(1), executor.clone()).unwrap();

    let results = join_all((0..6).map(|i| pool.execute_task(Job::Echo(i)))).await;
    for (i, result) in results.into_iter().enumerate() {
        let (value, executor_id) = result.unwrap();
        assert_eq!(value as usize, i);
        assert_eq!(executor_id, 0);
    }

    assert_eq!(*executor.order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(pool.executor_count(), 1);
    assert_eq!(pool.queued_count(), 0);
}

#[tokio::test]
async fn test_non_serializable_results() {
    let pool = WorkerPool::new(config(1), StreamingExecutor).unwrap();

    let mut rx = pool.execute_task(3).await.unwrap();
    let mut tokens = Vec::new();
    while let Some(token) = rx.recv().await {
        tokens.push(token);
    }
    assert_eq!(tokens, vec!["token-0", "token-1", "token-2"]);
}

// ============================================================================
// FAILURES AND TIMEOUTS
// ============================================================================

#[tokio::test]
async fn test_execution_failure_keeps_executor() {
    let pool = WorkerPool::new(config(1), ScriptedExecutor::default()).unwrap();

    let err = pool.execute_task(Job::Fail("bad payload")).await.unwrap_err();
    match err {
        PoolError::TaskExecutionFailed(msg) => assert!(msg.contains("bad payload")),
        other => panic!("unexpected error: {other}"),
    }

    let (value, executor_id) = pool.execute_task(Job::Echo(9)).await.unwrap();
    assert_eq!(value, 9);
    assert_eq!(executor_id, 0);
    assert_eq!(pool.stats().failed_tasks, 1);
}

#[tokio::test]
async fn test_timeout_discards_executor_and_dispatches_next() {
    let timeout = Duration::from_millis(200);
    let pool = WorkerPool::new(
        WorkerPoolConfig::new()
            .with_max_executors(1)
            .with_task_timeout(timeout),
        ScriptedExecutor::default(),
    )
    .unwrap();

    // The second task waits in overflow behind the hanging one.
    let started = Instant::now();
    let (hung, queued) = tokio::join!(
        pool.execute_task(Job::Hang),
        pool.execute_task(Job::Echo(1)),
    );

    assert_eq!(hung.unwrap_err(), PoolError::TaskTimeout(timeout));
    assert!(started.elapsed() >= timeout);

    let (value, executor_id) = queued.unwrap();
    assert_eq!(value, 1);
    assert_ne!(executor_id, 0, "timed-out executor must not be reused");

    let (_, later_executor) = pool.execute_task(Job::Echo(2)).await.unwrap();
    assert_eq!(later_executor, executor_id);

    let stats = pool.stats();
    assert_eq!(stats.timed_out_tasks, 1);
    assert_eq!(stats.completed_tasks, 2);
    assert_eq!(stats.executor_count, 1);
}

#[tokio::test]
async fn test_dropped_caller_cancels_task() {
    let pool = Arc::new(WorkerPool::new(config(1), ScriptedExecutor::default()).unwrap());

    let waiting = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_task(Job::Hang).await })
    };
    wait_until(|| pool.active_count() == 1).await;

    waiting.abort();
    // The hanging task observes its token, returns, and frees the executor.
    wait_until(|| pool.active_count() == 0).await;

    let (_, executor_id) = pool.execute_task(Job::Echo(3)).await.unwrap();
    assert_eq!(executor_id, 0);
}

fn short_timeout_pool(timeout: Duration) -> WorkerPool<Job, (u32, ExecutorId), ScriptedExecutor> {
    WorkerPool::new(
        WorkerPoolConfig::new()
            .with_max_executors(1)
            .with_task_timeout(timeout),
        ScriptedExecutor::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_stalled_task_times_out_for_waiting_caller() {
    let timeout = Duration::from_millis(100);
    let pool = short_timeout_pool(timeout);

    let err = pool.execute_task(Job::Stall).await.unwrap_err();
    assert_eq!(err, PoolError::TaskTimeout(timeout));

    let (value, executor_id) = pool.execute_task(Job::Echo(4)).await.unwrap();
    assert_eq!(value, 4);
    assert_ne!(executor_id, 0);
    assert_eq!(pool.stats().timed_out_tasks, 1);
}

#[tokio::test]
async fn test_blocked_thread_does_not_delay_timeout() {
    let timeout = Duration::from_millis(100);
    let pool = short_timeout_pool(timeout);

    let started = Instant::now();
    let err = pool
        .execute_task(Job::Block(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert_eq!(err, PoolError::TaskTimeout(timeout));
    assert!(started.elapsed() < Duration::from_secs(2));

    // A fresh executor serves the next task while the old thread is still blocked.
    let (value, executor_id) = pool.execute_task(Job::Echo(5)).await.unwrap();
    assert_eq!(value, 5);
    assert_ne!(executor_id, 0);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_timeout_frees_slot_after_caller_left() {
    let pool = short_timeout_pool(Duration::from_millis(100));

    // The caller gives up long before the task's own timeout.
    let gave_up = tokio::time::timeout(
        Duration::from_millis(20),
        pool.execute_task(Job::Block(Duration::from_secs(1))),
    )
    .await;
    assert!(gave_up.is_err());

    wait_until(|| pool.stats().timed_out_tasks == 1).await;
    assert_eq!(pool.active_count(), 0);

    let (value, executor_id) = pool.execute_task(Job::Echo(6)).await.unwrap();
    assert_eq!(value, 6);
    assert_ne!(executor_id, 0);
    assert_eq!(pool.executor_count(), 1);
}

#[tokio::test]
async fn test_stalled_task_released_when_caller_leaves() {
    let pool = short_timeout_pool(Duration::from_secs(10));

    let gave_up =
        tokio::time::timeout(Duration::from_millis(20), pool.execute_task(Job::Stall)).await;
    assert!(gave_up.is_err());

    // The stalled future is dropped at its next await; the executor survives.
    wait_until(|| pool.active_count() == 0).await;
    let (_, executor_id) = pool.execute_task(Job::Echo(7)).await.unwrap();
    assert_eq!(executor_id, 0);

    let stats = pool.stats();
    assert_eq!(stats.cancelled_tasks, 1);
    assert_eq!(stats.timed_out_tasks, 0);
}

#[tokio::test]
async fn test_abandoned_overflow_job_never_runs() {
    let executor = ScriptedExecutor::default();
    let pool = Arc::new(WorkerPool::new(config(1), executor.clone()).unwrap());

    let running = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_task(Job::Hang).await })
    };
    wait_until(|| pool.active_count() == 1).await;
    let queued = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_task(Job::Echo(1)).await })
    };
    wait_until(|| pool.queued_count() == 1).await;

    queued.abort();
    let _ = queued.await;
    running.abort();
    let _ = running.await;

    wait_until(|| pool.stats().cancelled_tasks == 2).await;
    assert_eq!(pool.queued_count(), 0);

    let (value, _) = pool.execute_task(Job::Echo(2)).await.unwrap();
    assert_eq!(value, 2);
    assert_eq!(*executor.order.lock().unwrap(), vec![2]);
    assert_eq!(pool.stats().completed_tasks, 1);
}

// ============================================================================
// TERMINATION AND LIMITS
// ============================================================================

#[tokio::test]
async fn test_terminate_fails_running_and_queued_work() {
    let pool = Arc::new(WorkerPool::new(config(1), ScriptedExecutor::default()).unwrap());

    let running = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_task(Job::Hang).await })
    };
    wait_until(|| pool.active_count() == 1).await;
    let queued = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_task(Job::Echo(1)).await })
    };
    wait_until(|| pool.queued_count() == 1).await;

    pool.terminate();

    assert_eq!(running.await.unwrap().unwrap_err(), PoolError::PoolTerminated);
    assert_eq!(queued.await.unwrap().unwrap_err(), PoolError::PoolTerminated);
    assert_eq!(
        pool.execute_task(Job::Echo(2)).await.unwrap_err(),
        PoolError::PoolTerminated
    );
    assert!(pool.is_terminated());
    assert_eq!(pool.executor_count(), 0);
}

#[tokio::test]
async fn test_queue_full_when_overflow_at_depth() {
    let pool = Arc::new(
        WorkerPool::new(config(1).with_max_queue_depth(1), ScriptedExecutor::default()).unwrap(),
    );

    let running = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_task(Job::Hang).await })
    };
    wait_until(|| pool.active_count() == 1).await;
    let queued = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute_task(Job::Echo(1)).await })
    };
    wait_until(|| pool.queued_count() == 1).await;

    let err = pool.execute_task(Job::Echo(2)).await.unwrap_err();
    assert_eq!(err, PoolError::QueueFull);
    assert!(err.is_transient());

    pool.terminate();
    assert!(running.await.unwrap().is_err());
    assert!(queued.await.unwrap().is_err());
}

#[test]
fn test_invalid_config_rejected() {
    let err = WorkerPool::new(WorkerPoolConfig::new().with_max_executors(0), AddExecutor)
        .err()
        .unwrap();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}
