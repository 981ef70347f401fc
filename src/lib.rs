//! # Prometheus Orchestra
//!
//! In-process concurrency and resource-orchestration primitives for async
//! Rust services.
//!
//! The crate provides five cooperating building blocks. Each is constructed
//! explicitly from its own configuration and passed to the code that uses
//! it; there are no global singletons.
//!
//! - **`BoundedTaskQueue`**: runs at most *C* async tasks at a time on the
//!   caller's runtime and admits the rest in FIFO order.
//! - **`RetryExecutor`**: retries a fallible async operation with optional
//!   exponential backoff, cap and jitter.
//! - **`WorkerPool`**: dedicated OS threads (each with its own
//!   single-threaded tokio runtime) for CPU-bound work, with lazy executor
//!   creation, an overflow queue and per-task timeouts.
//! - **`ResourcePool`**: bounded, non-blocking pool of reusable objects with
//!   scoped acquisition.
//! - **`Pipeline`**: asynchronous middleware chain over a shared mutable
//!   context, with error-boundary, timing and logging handlers.
//!
//! Cancellation is explicit: `tokio_util::sync::CancellationToken` is
//! threaded through queue tasks, worker pool tasks and retries.
//!
//! ## BoundedTaskQueue with retries
//!
//! ```rust,ignore
//! use prometheus_orchestra::config::{RetryPolicy, TaskQueueConfig};
//! use prometheus_orchestra::core::{BoundedTaskQueue, RetryExecutor};
//!
//! let queue = BoundedTaskQueue::tokio(TaskQueueConfig::new().with_concurrency(4))?;
//! let retry = RetryExecutor::new(RetryPolicy::new().with_max_attempts(5))?;
//!
//! let handle = queue.add(move || async move {
//!     retry.execute(|| fetch_quote()).await
//! });
//! let quote = handle.await?;
//! ```
//!
//! ## WorkerPool
//!
//! ```rust,ignore
//! use prometheus_orchestra::config::WorkerPoolConfig;
//! use prometheus_orchestra::core::{FnExecutor, WorkerPool};
//!
//! let pool = WorkerPool::new(
//!     WorkerPoolConfig::new().with_max_executors(4),
//!     FnExecutor::new(|block: Vec<u8>, _ctx| async move { Ok(checksum(&block)) }),
//! )?;
//! let sum = pool.execute_task(data).await?;
//! ```
//!
//! ## Configuration
//!
//! `config::OrchestraConfig` collects every section and loads from JSON or
//! `ORCHESTRA_*` environment variables; `builders` turn it into ready
//! instances.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Concurrency primitives and their error types.
pub mod core;
/// Configuration models with validation and defaults.
pub mod config;
/// Builders to construct primitives from configuration.
pub mod builders;
/// Runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
