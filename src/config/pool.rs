//! Pool, queue and root orchestration configuration structures.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::RetryPolicy;

/// Default per-task timeout for worker pools.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 30_000;

/// Default stack size for executor threads (2 MiB).
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Configuration for a [`BoundedTaskQueue`](crate::core::BoundedTaskQueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// Maximum number of tasks running at once.
    pub concurrency: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl TaskQueueConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Validate queue configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be greater than 0".into());
        }
        Ok(())
    }
}

/// Configuration for a [`ResourcePool`](crate::core::ResourcePool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Maximum number of resources the pool will ever track.
    pub max_size: usize,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self { max_size: 10 }
    }
}

impl ResourcePoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum pool size.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Validate pool configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".into());
        }
        Ok(())
    }
}

/// Configuration for a [`WorkerPool`](crate::core::WorkerPool).
///
/// Executors are created lazily, so `max_executors` is an upper bound and not
/// a number of threads spawned up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum number of executor threads.
    pub max_executors: usize,
    /// Per-task timeout in milliseconds, measured from the moment an executor
    /// starts the task.
    pub task_timeout_ms: u64,
    /// Optional bound on the overflow queue. `None` means unbounded.
    pub max_queue_depth: Option<usize>,
    /// Stack size for executor threads.
    pub thread_stack_size: usize,
    /// Name prefix for executor threads.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_executors: num_cpus::get(),
            task_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            max_queue_depth: None,
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            thread_name_prefix: "orchestra-worker".into(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of executors.
    #[must_use]
    pub const fn with_max_executors(mut self, max_executors: usize) -> Self {
        self.max_executors = max_executors;
        self
    }

    /// Set the per-task timeout.
    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Bound the overflow queue.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Set the executor thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Set the executor thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Per-task timeout as a [`Duration`].
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Validate worker pool configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_executors == 0 {
            return Err("max_executors must be greater than 0".into());
        }
        if self.task_timeout_ms == 0 {
            return Err("task_timeout_ms must be greater than 0".into());
        }
        if self.max_queue_depth == Some(0) {
            return Err("max_queue_depth must be greater than 0 when set".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Root configuration: one entry per independently configured primitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestraConfig {
    /// Task queue settings.
    pub task_queue: TaskQueueConfig,
    /// Retry policy settings.
    pub retry: RetryPolicy,
    /// Worker pool settings.
    pub worker_pool: WorkerPoolConfig,
    /// Named resource pools.
    pub resource_pools: HashMap<String, ResourcePoolConfig>,
}

impl OrchestraConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.task_queue
            .validate()
            .map_err(|e| format!("task_queue invalid: {e}"))?;
        self.retry
            .validate()
            .map_err(|e| format!("retry invalid: {e}"))?;
        self.worker_pool
            .validate()
            .map_err(|e| format!("worker_pool invalid: {e}"))?;
        for (name, pool) in &self.resource_pools {
            pool.validate()
                .map_err(|e| format!("resource pool `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by `ORCHESTRA_*`
    /// environment variables. A `.env` file is loaded first if present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Recognised keys: `ORCHESTRA_QUEUE_CONCURRENCY`,
    /// `ORCHESTRA_RETRY_MAX_ATTEMPTS`, `ORCHESTRA_RETRY_DELAY_MS`,
    /// `ORCHESTRA_RETRY_BACKOFF`, `ORCHESTRA_RETRY_BACKOFF_MULTIPLIER`,
    /// `ORCHESTRA_WORKER_MAX_EXECUTORS`, `ORCHESTRA_WORKER_TASK_TIMEOUT_MS`,
    /// `ORCHESTRA_WORKER_MAX_QUEUE_DEPTH`.
    pub fn apply_env<L>(&mut self, lookup: L) -> Result<(), String>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_QUEUE_CONCURRENCY")? {
            self.task_queue.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_RETRY_DELAY_MS")? {
            self.retry.delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_RETRY_BACKOFF")? {
            self.retry.backoff = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_RETRY_BACKOFF_MULTIPLIER")? {
            self.retry.backoff_multiplier = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_WORKER_MAX_EXECUTORS")? {
            self.worker_pool.max_executors = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_WORKER_TASK_TIMEOUT_MS")? {
            self.worker_pool.task_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCHESTRA_WORKER_MAX_QUEUE_DEPTH")? {
            self.worker_pool.max_queue_depth = Some(v);
        }
        Ok(())
    }
}

fn parse_var<T, L>(lookup: &L, key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
    L: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("{key}: cannot parse `{raw}`: {e}"))
        })
        .transpose()
}
