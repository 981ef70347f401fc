//! Builders to construct orchestration primitives from configuration.

pub mod pool_builder;

pub use pool_builder::{
    build_orchestra, build_resource_pools, build_retry_executor, build_task_queue,
    build_worker_pool, Orchestra,
};
