//! Tests for tokio spawner utilities

use prometheus_orchestra::core::Spawn;
use prometheus_orchestra::runtime::TokioSpawner;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_try_current_outside_runtime() {
    assert!(TokioSpawner::try_current().is_none());
}

#[test]
fn test_spawner_from_foreign_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let spawner = TokioSpawner::new(runtime.handle().clone());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send("ran").unwrap();
    });
    assert_eq!(runtime.block_on(rx).unwrap(), "ran");
}
