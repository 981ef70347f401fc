//! Tests for configuration validation and loading

use prometheus_orchestra::config::{
    OrchestraConfig, ResourcePoolConfig, RetryPolicy, TaskQueueConfig, WorkerPoolConfig,
};
use std::collections::HashMap;
use std::time::Duration;

#[test]
fn test_task_queue_config_validation() {
    assert!(TaskQueueConfig::new().validate().is_ok());
    assert!(TaskQueueConfig::new().with_concurrency(8).validate().is_ok());
    assert!(TaskQueueConfig::new().with_concurrency(0).validate().is_err());
}

#[test]
fn test_resource_pool_config_validation() {
    assert_eq!(ResourcePoolConfig::default().max_size, 10);
    assert!(ResourcePoolConfig::new().with_max_size(0).validate().is_err());
}

#[test]
fn test_worker_pool_config_invalid_values() {
    let base = WorkerPoolConfig::new().with_max_executors(2);
    assert!(base.validate().is_ok());

    assert!(base.clone().with_max_executors(0).validate().is_err());
    assert!(base
        .clone()
        .with_task_timeout(Duration::ZERO)
        .validate()
        .is_err());
    assert!(base.clone().with_max_queue_depth(0).validate().is_err());
    assert!(base.with_thread_stack_size(1024).validate().is_err());
}

#[test]
fn test_worker_pool_config_timeout_roundtrip() {
    let cfg = WorkerPoolConfig::new().with_task_timeout(Duration::from_millis(1500));
    assert_eq!(cfg.task_timeout_ms, 1500);
    assert_eq!(cfg.task_timeout(), Duration::from_millis(1500));
}

#[test]
fn test_orchestra_config_names_invalid_section() {
    let mut pools = HashMap::new();
    pools.insert("db".to_string(), ResourcePoolConfig::new().with_max_size(0));
    let cfg = OrchestraConfig {
        resource_pools: pools,
        ..OrchestraConfig::default()
    };

    let err = cfg.validate().unwrap_err();
    assert!(err.contains("db"), "unexpected message: {err}");
}

#[test]
fn test_orchestra_config_from_json() {
    let json = r#"
    {
        "task_queue": { "concurrency": 4 },
        "retry": { "max_attempts": 5, "delay_ms": 50, "jitter": 0.1 },
        "worker_pool": { "max_executors": 2, "task_timeout_ms": 5000 },
        "resource_pools": { "http": { "max_size": 16 } }
    }
    "#;

    let cfg = OrchestraConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.task_queue.concurrency, 4);
    assert_eq!(cfg.retry.max_attempts, 5);
    assert_eq!(cfg.retry.delay(), Duration::from_millis(50));
    // Unspecified fields keep their defaults.
    assert!(cfg.retry.backoff);
    assert_eq!(cfg.worker_pool.max_executors, 2);
    assert_eq!(cfg.worker_pool.max_queue_depth, None);
    assert_eq!(cfg.resource_pools["http"].max_size, 16);
}

#[test]
fn test_orchestra_config_from_json_rejects_invalid() {
    assert!(OrchestraConfig::from_json_str(r#"{ "task_queue": { "concurrency": 0 } }"#).is_err());
    assert!(OrchestraConfig::from_json_str("not json").is_err());
}

#[test]
fn test_apply_env_overrides() {
    let vars: HashMap<&str, &str> = [
        ("ORCHESTRA_QUEUE_CONCURRENCY", "6"),
        ("ORCHESTRA_RETRY_MAX_ATTEMPTS", "2"),
        ("ORCHESTRA_RETRY_BACKOFF", "false"),
        ("ORCHESTRA_WORKER_MAX_QUEUE_DEPTH", " 32 "),
    ]
    .into_iter()
    .collect();

    let mut cfg = OrchestraConfig::default();
    cfg.apply_env(|key| vars.get(key).map(|v| (*v).to_string()))
        .unwrap();

    assert_eq!(cfg.task_queue.concurrency, 6);
    assert_eq!(cfg.retry.max_attempts, 2);
    assert!(!cfg.retry.backoff);
    assert_eq!(cfg.worker_pool.max_queue_depth, Some(32));
    assert_eq!(cfg.retry.delay_ms, RetryPolicy::default().delay_ms);
}

#[test]
fn test_apply_env_reports_bad_value() {
    let mut cfg = OrchestraConfig::default();
    let err = cfg
        .apply_env(|key| (key == "ORCHESTRA_WORKER_MAX_EXECUTORS").then(|| "many".to_string()))
        .unwrap_err();
    assert!(err.contains("ORCHESTRA_WORKER_MAX_EXECUTORS"));
}
