//! Tests for builder modules

use prometheus_orchestra::builders::{
    build_orchestra, build_resource_pools, build_retry_executor, build_worker_pool,
};
use prometheus_orchestra::config::{OrchestraConfig, ResourcePoolConfig, TaskQueueConfig};
use prometheus_orchestra::core::{
    AppResult, ConfigError, FnExecutor, PoolError, ResourceFactory, TaskContext,
};
use prometheus_orchestra::runtime::TokioSpawner;

struct LabelFactory {
    label: String,
}

impl ResourceFactory for LabelFactory {
    type Resource = String;

    fn create(&self) -> AppResult<String> {
        Ok(self.label.clone())
    }
}

fn config_with_pools(names: &[(&str, usize)]) -> OrchestraConfig {
    let mut cfg = OrchestraConfig::default();
    for (name, size) in names {
        cfg.resource_pools
            .insert((*name).to_string(), ResourcePoolConfig::new().with_max_size(*size));
    }
    cfg
}

#[tokio::test]
async fn test_build_orchestra_from_defaults() {
    let mut cfg = OrchestraConfig::default();
    cfg.task_queue = TaskQueueConfig::new().with_concurrency(3);

    let orchestra = build_orchestra(&cfg, TokioSpawner::current()).unwrap();
    assert_eq!(orchestra.task_queue.concurrency(), 3);
    assert_eq!(orchestra.retry.policy().max_attempts, 3);

    let value = orchestra
        .task_queue
        .add(|| async { Ok::<_, String>(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);
}

#[test]
fn test_build_rejects_invalid_section() {
    let mut cfg = OrchestraConfig::default();
    cfg.retry.max_attempts = 0;
    let err = build_retry_executor(&cfg).unwrap_err();
    assert!(err.0.contains("retry"));
}

#[test]
fn test_build_resource_pools_per_entry() {
    let cfg = config_with_pools(&[("primary", 2), ("replica", 5)]);
    let pools = build_resource_pools(&cfg, |name, _| {
        Ok(LabelFactory {
            label: name.to_string(),
        })
    })
    .unwrap();

    assert_eq!(pools.len(), 2);
    assert_eq!(pools["primary"].max_size(), 2);
    assert_eq!(pools["replica"].max_size(), 5);
    let conn = pools["replica"].acquire().unwrap();
    assert_eq!(conn.as_str(), "replica");
}

#[test]
fn test_build_resource_pools_factory_error() {
    let cfg = config_with_pools(&[("cache", 1)]);
    let err = build_resource_pools::<LabelFactory, _>(&cfg, |name, _| {
        Err(ConfigError(format!("no factory for {name}")))
    })
    .unwrap_err();
    assert_eq!(err.0, "no factory for cache");
}

#[tokio::test]
async fn test_build_worker_pool() {
    let mut cfg = OrchestraConfig::default();
    cfg.worker_pool.max_executors = 1;
    let pool = build_worker_pool(
        &cfg,
        FnExecutor::new(|n: u64, _ctx: TaskContext| async move { Ok::<_, anyhow::Error>(n + 1) }),
    )
    .unwrap();
    assert_eq!(pool.execute_task(41).await.unwrap(), 42);

    cfg.worker_pool.max_executors = 0;
    let err = build_worker_pool(
        &cfg,
        FnExecutor::new(|n: u64, _ctx: TaskContext| async move { Ok::<_, anyhow::Error>(n) }),
    )
    .err()
    .unwrap();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}
