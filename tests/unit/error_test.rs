//! Tests for error types

use prometheus_orchestra::core::{ConfigError, PoolError, QueueError, ResourcePoolError, RetryError};
use std::time::Duration;

#[test]
fn test_pool_error_display() {
    assert_eq!(
        PoolError::TaskTimeout(Duration::from_secs(2)).to_string(),
        "task timed out after 2s"
    );
    assert_eq!(PoolError::PoolTerminated.to_string(), "pool has been terminated");
    assert_eq!(PoolError::QueueFull.to_string(), "task queue is full");
}

#[test]
fn test_pool_error_transience() {
    assert!(PoolError::QueueFull.is_transient());
    assert!(PoolError::TaskTimeout(Duration::from_millis(10)).is_transient());
    assert!(!PoolError::PoolTerminated.is_transient());
    assert!(!PoolError::TaskExecutionFailed("bad".into()).is_transient());
}

#[test]
fn test_resource_pool_error_display() {
    let err = ResourcePoolError::Exhausted { in_use: 3, max_size: 3 };
    assert_eq!(
        err.to_string(),
        "resource pool exhausted: 3 of 3 resources in use"
    );
    assert!(err.is_transient());
}

#[test]
fn test_config_error_display() {
    let err = ConfigError("concurrency must be greater than 0".into());
    assert_eq!(
        err.to_string(),
        "invalid configuration: concurrency must be greater than 0"
    );
}

#[test]
fn test_queue_error_wraps_task_error() {
    let err: QueueError<String> = QueueError::Failed("declined".into());
    assert_eq!(err.to_string(), "task failed: declined");
    assert!(!err.is_cancelled());
    assert!(QueueError::<String>::Cancelled.is_cancelled());
}

#[test]
fn test_retry_error_into_inner() {
    let exhausted: RetryError<&str> = RetryError::Exhausted("last");
    assert_eq!(exhausted.to_string(), "retry attempts exhausted: last");
    assert_eq!(exhausted.into_inner(), Some("last"));
    assert_eq!(RetryError::<&str>::Cancelled.into_inner(), None);
}

#[test]
fn test_errors_convert_into_anyhow() {
    let err: anyhow::Error = PoolError::QueueFull.into();
    assert!(err.downcast_ref::<PoolError>().is_some());
}
