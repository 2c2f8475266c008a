#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_api::{Operator, OperatorSettings, PassRecord, Pipeline, Supervisor, SupervisorConfig};
use keel_apply::{Reconciler, RetryConfig};
use keel_core::{
    ComponentKind, InstanceId, ObjectKind, PartialComponentConfig, ProductKind, ProductSpec, Version,
};
use keel_kubehub::{MemoryCluster, ProductEvent};
use keel_persist::MemoryCache;
use keel_store::StatusPolicy;
use serde_json::{json, Value};
use tokio::sync::watch;

fn pipeline(cluster: Arc<MemoryCluster>, retry: RetryConfig) -> Arc<Pipeline> {
    let registry = Arc::new(keel_products::registry().unwrap());
    Arc::new(Pipeline::new(registry, cluster, Reconciler::new(retry)))
}

fn fast() -> SupervisorConfig {
    SupervisorConfig {
        status_policy: StatusPolicy { failure_threshold: 3, grace: Duration::ZERO },
        status_interval: Duration::from_millis(10),
    }
}

fn alert(generation: i64) -> ProductSpec {
    let mut spec = ProductSpec::new(InstanceId::new("ns", "alert"), ProductKind::Alert, Version::parse("6.0.0").unwrap());
    spec.generation = Some(generation);
    spec
}

async fn wait_for_pass(
    rx: &mut watch::Receiver<Option<Arc<PassRecord>>>,
    done: impl Fn(&PassRecord) -> bool,
) -> Arc<PassRecord> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(rec) = rx.borrow_and_update().clone() {
                if done(&rec) {
                    return rec;
                }
            }
            rx.changed().await.expect("supervisor stopped");
        }
    })
    .await
    .expect("pass not seen in time")
}

async fn wait_for_status(cluster: &MemoryCluster, kind: ProductKind, id: &InstanceId, phase: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(s) = cluster.status(kind, id) {
                if s["phase"] == phase {
                    return s;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status {} not written; last {:?}", phase, cluster.status(kind, id)))
}

#[tokio::test]
async fn operator_reconciles_a_black_duck_document() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut op = Operator::new(pipeline(cluster.clone(), RetryConfig::immediate(2)), OperatorSettings {
        disable_persist: true,
        status_interval_secs: 1,
        ..Default::default()
    });
    let doc = json!({
        "apiVersion": "synopsys.com/v1",
        "kind": "BlackDuck",
        "metadata": { "name": "hub", "namespace": "synopsys", "generation": 2 },
        "spec": { "version": "2020.6.0" }
    });
    op.handle(ProductEvent::Applied(doc)).unwrap();
    let id = InstanceId::new("synopsys", "hub");
    assert_eq!(op.instances(), vec![(ProductKind::BlackDuck, id.clone())]);

    let mut passes = op.supervisor(ProductKind::BlackDuck, &id).unwrap().passes();
    let rec = wait_for_pass(&mut passes, |_| true).await;
    let result = rec.result.as_ref().unwrap();
    assert!(!result.has_failures());
    assert_eq!(rec.generation, Some(2));

    let log = cluster.mutations();
    let first_workload = log.iter().position(|(_, k)| k.kind == ObjectKind::Workload).unwrap();
    let last_secret = log.iter().rposition(|(_, k)| k.kind == ObjectKind::Secret).unwrap();
    assert!(last_secret < first_workload);

    let status = wait_for_status(&cluster, ProductKind::BlackDuck, &id, "Ready").await;
    assert_eq!(status["observedGeneration"], 2);
    assert_eq!(status["counts"]["created"].as_u64().unwrap() as usize, result.nodes.len());

    op.handle(ProductEvent::Deleted(ProductKind::BlackDuck, id)).unwrap();
    assert!(op.instances().is_empty());
}

fn alert_doc(name: &str, generation: i64) -> Value {
    json!({
        "apiVersion": "synopsys.com/v1",
        "kind": "Alert",
        "metadata": { "name": name, "namespace": "ns", "generation": generation },
        "spec": { "version": "6.0.0" }
    })
}

#[tokio::test]
async fn products_of_different_kinds_may_share_a_name() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut op = Operator::new(pipeline(cluster.clone(), RetryConfig::immediate(1)), OperatorSettings {
        disable_persist: true,
        status_interval_secs: 1,
        ..Default::default()
    });
    let id = InstanceId::new("ns", "shared");
    op.handle(ProductEvent::Applied(alert_doc("shared", 1))).unwrap();
    op.handle(ProductEvent::Applied(json!({
        "kind": "BlackDuck",
        "metadata": { "name": "shared", "namespace": "ns", "generation": 1 },
        "spec": { "version": "2020.6.0" }
    })))
    .unwrap();
    assert_eq!(op.instances(), vec![(ProductKind::BlackDuck, id.clone()), (ProductKind::Alert, id.clone())]);

    for kind in [ProductKind::BlackDuck, ProductKind::Alert] {
        let mut passes = op.supervisor(kind, &id).unwrap().passes();
        let rec = wait_for_pass(&mut passes, |_| true).await;
        assert!(!rec.result.as_ref().unwrap().has_failures());
        wait_for_status(&cluster, kind, &id, "Ready").await;
    }

    op.handle(ProductEvent::Deleted(ProductKind::Alert, id.clone())).unwrap();
    assert_eq!(op.instances(), vec![(ProductKind::BlackDuck, id.clone())]);
    assert!(!op.supervisor(ProductKind::BlackDuck, &id).unwrap().is_deleted());
    op.shutdown().await;
}

#[tokio::test]
async fn status_only_updates_do_not_start_a_pass() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut op = Operator::new(pipeline(cluster.clone(), RetryConfig::immediate(1)), OperatorSettings {
        disable_persist: true,
        ..Default::default()
    });
    let id = InstanceId::new("ns", "alert");
    op.handle(ProductEvent::Applied(alert_doc("alert", 1))).unwrap();
    let mut passes = op.supervisor(ProductKind::Alert, &id).unwrap().passes();
    wait_for_pass(&mut passes, |r| r.seq == 1).await;

    let mut echoed = alert_doc("alert", 1);
    echoed["status"] = json!({ "phase": "Ready", "observedGeneration": 1 });
    op.handle(ProductEvent::Applied(echoed)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(passes.borrow().as_ref().map(|r| r.seq), Some(1));

    op.handle(ProductEvent::Applied(alert_doc("alert", 2))).unwrap();
    let rec = wait_for_pass(&mut passes, |r| r.seq == 2).await;
    assert_eq!(rec.generation, Some(2));
    op.shutdown().await;
}

#[tokio::test]
async fn invalid_document_is_rejected_and_reported() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut op = Operator::new(pipeline(cluster.clone(), RetryConfig::immediate(1)), OperatorSettings {
        disable_persist: true,
        ..Default::default()
    });
    let doc = json!({
        "kind": "Alert",
        "metadata": { "name": "alert", "namespace": "ns" },
        "spec": { "version": "6.0.0", "turbo": true }
    });
    assert!(op.handle(ProductEvent::Applied(doc)).is_err());
    assert!(op.instances().is_empty());
    let status = wait_for_status(&cluster, ProductKind::Alert, &InstanceId::new("ns", "alert"), "Failed").await;
    assert!(status["message"].as_str().unwrap().contains("turbo"));
}

#[tokio::test]
async fn newer_specs_coalesce_while_a_pass_runs() {
    let cluster = Arc::new(MemoryCluster::new().with_latency(Duration::from_millis(5)));
    let sup = Supervisor::spawn(pipeline(cluster.clone(), RetryConfig::immediate(1)), Box::new(MemoryCache::new()), alert(1), fast());
    let mut passes = sup.passes();
    for g in 2..=4 {
        sup.submit(alert(g));
    }

    let rec = wait_for_pass(&mut passes, |r| r.generation == Some(4)).await;
    // At most the first spec and the newest one ran.
    assert!(rec.seq <= 2, "ran {} passes", rec.seq);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(passes.borrow().as_ref().map(|r| r.seq), Some(rec.seq));
    sup.shutdown().await;
}

#[tokio::test]
async fn resync_runs_the_current_spec_again() {
    let cluster = Arc::new(MemoryCluster::new());
    let sup = Supervisor::spawn(pipeline(cluster.clone(), RetryConfig::immediate(1)), Box::new(MemoryCache::new()), alert(1), fast());
    let mut passes = sup.passes();
    wait_for_pass(&mut passes, |r| r.seq == 1).await;
    cluster.clear_mutations();

    sup.resync();
    let rec = wait_for_pass(&mut passes, |r| r.seq == 2).await;
    let counts = rec.result.as_ref().unwrap().counts();
    assert_eq!(counts.unchanged, rec.result.as_ref().unwrap().nodes.len());
    assert!(cluster.mutations().is_empty());
    sup.shutdown().await;
}

#[tokio::test]
async fn delete_skips_the_rest_of_the_pass() {
    let cluster = Arc::new(MemoryCluster::new().with_latency(Duration::from_millis(40)));
    let spec = ProductSpec::new(InstanceId::new("synopsys", "hub"), ProductKind::BlackDuck, Version::parse("2020.6.0").unwrap());
    let sup = Supervisor::spawn(pipeline(cluster.clone(), RetryConfig::immediate(1)), Box::new(MemoryCache::new()), spec, fast());
    let mut passes = sup.passes();
    tokio::time::sleep(Duration::from_millis(150)).await;
    sup.delete();
    assert!(sup.is_deleted());

    let rec = wait_for_pass(&mut passes, |_| true).await;
    let counts = rec.result.as_ref().unwrap().counts();
    assert!(counts.skipped > 0, "{:?}", counts);
    assert_eq!(counts.failed + counts.blocked, 0);

    // Submissions after delete are ignored, and the loop and poller exit.
    sup.submit(alert(9));
    tokio::time::timeout(Duration::from_secs(5), sup.shutdown()).await.expect("supervisor did not stop");
}

#[tokio::test]
async fn compose_errors_are_written_as_failed() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut spec = alert(1);
    spec.overrides.insert(ComponentKind::from("nope"), PartialComponentConfig::default());
    let sup = Supervisor::spawn(pipeline(cluster.clone(), RetryConfig::immediate(1)), Box::new(MemoryCache::new()), spec, fast());
    let mut passes = sup.passes();
    let rec = wait_for_pass(&mut passes, |_| true).await;
    assert!(rec.result.is_err());

    let status = wait_for_status(&cluster, ProductKind::Alert, &InstanceId::new("ns", "alert"), "Failed").await;
    assert!(status["message"].as_str().unwrap().contains("ns/alert"));
    assert!(cluster.is_empty());
    sup.shutdown().await;
}
