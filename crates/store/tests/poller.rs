#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{InstanceId, ProductKind, ProductStatus};
use keel_kubehub::{MemoryCluster, WorkloadHealth};
use keel_store::{spawn_status_poller, StatusPolicy};
use tokio_util::sync::CancellationToken;

async fn wait_for(rx: &mut tokio::sync::watch::Receiver<ProductStatus>, want: ProductStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != want {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("status not reached in time");
    assert_eq!(*rx.borrow(), want);
}

#[tokio::test]
async fn poller_publishes_status_and_snapshot() {
    let cluster = Arc::new(MemoryCluster::new());
    let id = InstanceId::new("ns", "demo");
    cluster.set_health(&id, vec![WorkloadHealth::new("web", 2, 1), WorkloadHealth::new("db", 1, 1)]);
    let cancel = CancellationToken::new();
    let handle = spawn_status_poller(cluster.clone(), ProductKind::BlackDuck, id.clone(), StatusPolicy::default(), Duration::from_millis(10), cancel.clone());
    let mut rx = handle.subscribe();

    wait_for(&mut rx, ProductStatus::PartiallyReady).await;
    assert_eq!(handle.current().message.as_deref(), Some("waiting for web"));

    cluster.set_health(&id, vec![WorkloadHealth::new("web", 2, 2), WorkloadHealth::new("db", 1, 1)]);
    wait_for(&mut rx, ProductStatus::Ready).await;
    let snap = handle.current();
    assert_eq!(snap.workloads.len(), 2);
    assert!(snap.message.is_none());

    cancel.cancel();
    handle.join().await;
}

#[tokio::test]
async fn an_absent_expected_workload_keeps_the_product_from_ready() {
    let cluster = Arc::new(MemoryCluster::new());
    let id = InstanceId::new("ns", "demo");
    cluster.set_health(&id, vec![WorkloadHealth::new("web", 1, 1), WorkloadHealth::new("retired", 1, 0)]);
    let cancel = CancellationToken::new();
    let handle = spawn_status_poller(
        cluster.clone(),
        ProductKind::BlackDuck,
        id.clone(),
        StatusPolicy::default(),
        Duration::from_millis(10),
        cancel.clone(),
    );
    handle.set_expected(vec!["web".to_string(), "db".to_string()]);

    let snap = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snap = handle.current();
            if snap.message.as_deref() == Some("waiting for db (missing)") {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("missing workload not reported");
    assert_eq!(snap.status, ProductStatus::PartiallyReady);
    assert_eq!(snap.workloads, vec![WorkloadHealth::new("db", 1, 0), WorkloadHealth::new("web", 1, 1)]);

    // The stray workload does not count once everything expected is up.
    cluster.set_health(&id, vec![WorkloadHealth::new("web", 1, 1), WorkloadHealth::new("db", 1, 1), WorkloadHealth::new("retired", 1, 0)]);
    let mut rx = handle.subscribe();
    wait_for(&mut rx, ProductStatus::Ready).await;
    cancel.cancel();
    handle.join().await;
}

#[tokio::test]
async fn transient_read_errors_do_not_fail_the_product() {
    let cluster = Arc::new(MemoryCluster::new());
    let id = InstanceId::new("ns", "demo");
    cluster.set_health(&id, vec![WorkloadHealth::new("web", 1, 1)]);
    cluster.fail_health(&id, 2);
    let policy = StatusPolicy { failure_threshold: 3, grace: Duration::ZERO };
    let cancel = CancellationToken::new();
    let handle = spawn_status_poller(cluster.clone(), ProductKind::BlackDuck, id, policy, Duration::from_millis(10), cancel.clone());
    let mut rx = handle.subscribe();
    wait_for(&mut rx, ProductStatus::Ready).await;
    assert_eq!(handle.current().consecutive_failures, 0);
    cancel.cancel();
    handle.join().await;
}

#[tokio::test]
async fn persistent_read_errors_fail_after_threshold() {
    let cluster = Arc::new(MemoryCluster::new());
    let id = InstanceId::new("ns", "demo");
    cluster.fail_health(&id, u32::MAX);
    let policy = StatusPolicy { failure_threshold: 3, grace: Duration::ZERO };
    let cancel = CancellationToken::new();
    let handle = spawn_status_poller(cluster.clone(), ProductKind::BlackDuck, id, policy, Duration::from_millis(10), cancel.clone());
    let mut rx = handle.subscribe();
    wait_for(&mut rx, ProductStatus::Failed).await;
    assert!(handle.current().consecutive_failures >= 3);
    assert!(handle.current().message.clone().unwrap().starts_with("health read failed"));
    cancel.cancel();
    handle.join().await;
}

#[tokio::test]
async fn cancellation_stops_the_poller() {
    let cluster = Arc::new(MemoryCluster::new());
    let cancel = CancellationToken::new();
    let handle = spawn_status_poller(cluster, ProductKind::Alert, InstanceId::new("ns", "x"), StatusPolicy::default(), Duration::from_millis(10), cancel.clone());
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle.join()).await.expect("poller did not stop");
}
