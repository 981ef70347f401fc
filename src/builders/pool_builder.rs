//! Build queues, retry executors and pools from an [`OrchestraConfig`].
//!
//! Every builder validates the whole configuration first, so a bad section
//! is reported before anything is constructed.

use std::collections::HashMap;

use crate::config::{OrchestraConfig, ResourcePoolConfig};
use crate::core::{
    BoundedTaskQueue, ConfigError, PoolError, ResourceFactory, ResourcePool, RetryExecutor, Spawn,
    WorkerExecutor, WorkerPool,
};

/// The async primitives of one configuration, ready to hand to consumers.
#[derive(Debug)]
pub struct Orchestra<S: Spawn> {
    /// Bounded-concurrency scheduler.
    pub task_queue: BoundedTaskQueue<S>,
    /// Retry executor for the configured policy.
    pub retry: RetryExecutor,
}

/// Build the task queue and retry executor described by `cfg`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the configuration is invalid.
pub fn build_orchestra<S: Spawn>(
    cfg: &OrchestraConfig,
    spawner: S,
) -> Result<Orchestra<S>, ConfigError> {
    Ok(Orchestra {
        task_queue: build_task_queue(cfg, spawner)?,
        retry: build_retry_executor(cfg)?,
    })
}

/// Build the bounded task queue described by `cfg.task_queue`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the configuration is invalid.
pub fn build_task_queue<S: Spawn>(
    cfg: &OrchestraConfig,
    spawner: S,
) -> Result<BoundedTaskQueue<S>, ConfigError> {
    cfg.validate().map_err(ConfigError)?;
    BoundedTaskQueue::new(cfg.task_queue.clone(), spawner)
}

/// Build a retry executor for `cfg.retry`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the configuration is invalid.
pub fn build_retry_executor(cfg: &OrchestraConfig) -> Result<RetryExecutor, ConfigError> {
    cfg.validate().map_err(ConfigError)?;
    RetryExecutor::new(cfg.retry.clone())
}

/// Build the worker pool described by `cfg.worker_pool`.
///
/// # Errors
///
/// Returns `PoolError::InvalidConfig` if the configuration is invalid.
pub fn build_worker_pool<P, R, E>(
    cfg: &OrchestraConfig,
    executor: E,
) -> Result<WorkerPool<P, R, E>, PoolError>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    cfg.validate().map_err(PoolError::InvalidConfig)?;
    WorkerPool::new(cfg.worker_pool.clone(), executor)
}

/// Build one resource pool per entry of `cfg.resource_pools`, asking
/// `factory_for` for each pool's factory.
///
/// # Errors
///
/// Returns [`ConfigError`] if the configuration is invalid or a factory
/// cannot be produced.
pub fn build_resource_pools<F, FF>(
    cfg: &OrchestraConfig,
    mut factory_for: FF,
) -> Result<HashMap<String, ResourcePool<F>>, ConfigError>
where
    F: ResourceFactory,
    FF: FnMut(&str, &ResourcePoolConfig) -> Result<F, ConfigError>,
{
    cfg.validate().map_err(ConfigError)?;

    let mut pools = HashMap::with_capacity(cfg.resource_pools.len());
    for (name, pool_cfg) in &cfg.resource_pools {
        let factory = factory_for(name, pool_cfg)?;
        let pool = ResourcePool::new(pool_cfg.clone(), factory)
            .map_err(|e| ConfigError(format!("resource pool {name}: {}", e.0)))?;
        pools.insert(name.clone(), pool);
    }

    Ok(pools)
}
