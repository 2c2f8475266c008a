#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_apply::{order, plan, PlannedAction, Reconciler, RetryConfig};
use keel_core::{
    EnvFrom, InstanceId, NodeId, NodeOutcome, ObjectBody, ObjectGraph, ObjectKind, ObjectNode, ProductKind, ProductSpec,
    ProductStatus, Version, WorkloadBody, SIGNATURE_ANNOTATION,
};
use keel_kubehub::{testing::Mutation, ClusterError, MemoryCluster, ObjectKey};
use keel_persist::{AppliedRecord, MemoryCache, SignatureCache};
use tokio_util::sync::CancellationToken;

fn data(v: &str) -> BTreeMap<String, String> { BTreeMap::from([("k".to_string(), v.to_string())]) }

fn workload(name: &str, env_from: Vec<EnvFrom>) -> ObjectNode {
    let body = WorkloadBody {
        replicas: 1,
        selector: BTreeMap::from([("app".to_string(), name.to_string())]),
        containers: vec![keel_core::ContainerBody {
            name: name.into(),
            image: "busybox:1".into(),
            resources: Default::default(),
            env: vec![],
            env_from,
            ports: vec![],
            volume_mounts: vec![],
            liveness: None,
        }],
        volumes: vec![],
        service_account: None,
        pull_secrets: vec![],
        security: None,
    };
    ObjectNode::new(name, name, ObjectBody::Workload(body))
}

/// a (secret) <- b (workload); c (config) <- d (workload)
fn four_nodes(config_value: &str) -> ObjectGraph {
    let mut g = ObjectGraph::new(InstanceId::new("ns", "demo"));
    g.insert(ObjectNode::new("a", "a", ObjectBody::Secret { data: data("s") })).unwrap();
    g.insert(workload("b", vec![EnvFrom::Secret("a".into())])).unwrap();
    g.insert(ObjectNode::new("c", "c", ObjectBody::ConfigData { data: data(config_value) })).unwrap();
    g.insert(workload("d", vec![EnvFrom::ConfigData("c".into())])).unwrap();
    g
}

fn blackduck_graph() -> ObjectGraph {
    let registry = keel_products::registry().unwrap();
    let spec = ProductSpec::new(InstanceId::new("synopsys", "hub"), ProductKind::BlackDuck, Version::parse("2020.6.0").unwrap());
    keel_registry::compose(&registry, &spec).unwrap()
}

#[tokio::test]
async fn second_apply_is_all_unchanged() {
    let graph = blackduck_graph();
    let cluster = MemoryCluster::new();
    let cache = MemoryCache::new();
    let r = Reconciler::default();
    let cancel = CancellationToken::new();

    let first = r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();
    assert_eq!(first.counts().created, graph.len());
    assert_eq!(first.status, ProductStatus::Pending);
    cluster.clear_mutations();

    let second = r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();
    assert!(second.nodes.iter().all(|n| n.outcome == NodeOutcome::Unchanged));
    assert!(cluster.mutations().is_empty());
}

#[tokio::test]
async fn secrets_and_config_are_created_before_workloads() {
    let graph = blackduck_graph();
    let cluster = MemoryCluster::new();
    Reconciler::default().apply(&graph, &cluster, &MemoryCache::new(), &CancellationToken::new()).await.unwrap();
    let log = cluster.mutations();
    let pos = |kind: ObjectKind, name: &str| log.iter().position(|(_, k)| k.kind == kind && k.name == name).unwrap();
    let first_workload = log.iter().position(|(_, k)| k.kind == ObjectKind::Workload).unwrap();
    assert!(pos(ObjectKind::Secret, "hub-blackduck-db-creds") < first_workload);
    assert!(pos(ObjectKind::ConfigData, "hub-blackduck-config") < first_workload);
    assert!(log.iter().all(|(m, _)| *m == Mutation::Create));
}

#[tokio::test]
async fn failed_node_blocks_only_its_dependents() {
    let graph = four_nodes("1");
    let cluster = MemoryCluster::new();
    cluster.fail_always(NodeId::secret("a"), ClusterError::Rejected("quota exceeded".into()));
    let result = Reconciler::new(RetryConfig::immediate(2))
        .apply(&graph, &cluster, &MemoryCache::new(), &CancellationToken::new())
        .await
        .unwrap();

    match result.outcome(&NodeId::secret("a")).unwrap() {
        NodeOutcome::Failed { error } => assert!(error.contains("gave up after 2 attempts"), "{}", error),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(result.outcome(&NodeId::workload("b")), Some(&NodeOutcome::Blocked { by: NodeId::secret("a") }));
    assert_eq!(result.outcome(&NodeId::config("c")), Some(&NodeOutcome::Created));
    assert_eq!(result.outcome(&NodeId::workload("d")), Some(&NodeOutcome::Created));
    assert_eq!(result.status, ProductStatus::Failed);
    assert_eq!(result.first_error().map(|e| e.starts_with("Secret/a")), Some(true));
}

#[tokio::test]
async fn conflicts_are_refetched_and_retried() {
    let cluster = MemoryCluster::new();
    let cache = MemoryCache::new();
    let r = Reconciler::new(RetryConfig::immediate(1));
    let cancel = CancellationToken::new();
    r.apply(&four_nodes("1"), &cluster, &cache, &cancel).await.unwrap();

    cluster.fail_next(NodeId::config("c"), ClusterError::Conflict("stale".into()), 1);
    let result = r.apply(&four_nodes("2"), &cluster, &cache, &cancel).await.unwrap();
    let c = result.nodes.iter().find(|n| n.id == NodeId::config("c")).unwrap();
    assert_eq!(c.outcome, NodeOutcome::Updated);
    assert_eq!(c.attempts, 2);
    assert!(!result.has_failures());
}

#[tokio::test]
async fn create_race_resolves_to_update_or_unchanged() {
    let cluster = MemoryCluster::new();
    cluster.fail_next(NodeId::config("c"), ClusterError::AlreadyExists, 1);
    let result = Reconciler::new(RetryConfig::immediate(1))
        .apply(&four_nodes("1"), &cluster, &MemoryCache::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.outcome(&NodeId::config("c")), Some(&NodeOutcome::Created));
}

#[tokio::test]
async fn drift_is_repaired_for_the_touched_node_only() {
    let graph = four_nodes("1");
    let cluster = MemoryCluster::new();
    let cache = MemoryCache::new();
    let r = Reconciler::default();
    let cancel = CancellationToken::new();
    r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();

    cluster.tamper(&ObjectKey::new("ns", ObjectKind::ConfigData, "c"), |m| {
        m["metadata"]["annotations"][SIGNATURE_ANNOTATION] = serde_json::json!("edited");
    });
    let result = r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();
    let counts = result.counts();
    assert_eq!((counts.updated, counts.unchanged), (1, 3));
    assert_eq!(result.outcome(&NodeId::config("c")), Some(&NodeOutcome::Updated));
}

#[tokio::test]
async fn body_edits_behind_an_intact_signature_are_restored() {
    let graph = four_nodes("1");
    let cluster = MemoryCluster::new();
    let cache = MemoryCache::new();
    let r = Reconciler::default();
    let cancel = CancellationToken::new();
    r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();

    let config = ObjectKey::new("ns", ObjectKind::ConfigData, "c");
    cluster.tamper(&config, |m| m["data"]["k"] = serde_json::json!("hand-edited"));
    cluster.tamper(&ObjectKey::new("ns", ObjectKind::Secret, "a"), |m| m["data"]["k"] = serde_json::json!("b3RoZXI="));

    let preview = plan(&graph, &cluster).await.unwrap();
    let updates: Vec<&NodeId> = preview.iter().filter(|c| c.action == PlannedAction::Update).map(|c| &c.id).collect();
    assert_eq!(updates, vec![&NodeId::config("c"), &NodeId::secret("a")]);

    let result = r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();
    assert_eq!(result.outcome(&NodeId::config("c")), Some(&NodeOutcome::Updated));
    assert_eq!(result.outcome(&NodeId::secret("a")), Some(&NodeOutcome::Updated));
    assert_eq!(result.counts().unchanged, 2);
    assert_eq!(cluster.object(&config).unwrap().manifest["data"]["k"], "1");

    let again = r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();
    assert_eq!(again.counts().unchanged, 4);
}

#[tokio::test]
async fn cancelled_pass_skips_remaining_nodes() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let cluster = MemoryCluster::new();
    let result = Reconciler::default().apply(&four_nodes("1"), &cluster, &MemoryCache::new(), &cancel).await.unwrap();
    assert!(result.nodes.iter().all(|n| n.outcome == NodeOutcome::Skipped));
    assert_eq!(result.status, ProductStatus::Pending);
    assert!(cluster.is_empty());
}

#[tokio::test]
async fn cancellation_stops_retrying() {
    let cluster = MemoryCluster::new();
    cluster.fail_always(NodeId::secret("a"), ClusterError::Transport("unreachable".into()));
    let retry = RetryConfig { max_attempts: 50, initial_delay: std::time::Duration::from_secs(30), ..RetryConfig::default() };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let result = Reconciler::new(retry).apply(&four_nodes("1"), &cluster, &MemoryCache::new(), &cancel).await.unwrap();
    let a = result.nodes.iter().find(|n| n.id == NodeId::secret("a")).unwrap();
    assert_eq!(a.attempts, 1);
    assert!(matches!(a.outcome, NodeOutcome::Failed { .. }));
    // `c` sorts ahead of `a` and was applied before the failure.
    assert_eq!(result.outcome(&NodeId::config("c")), Some(&NodeOutcome::Created));
    assert_eq!(result.outcome(&NodeId::workload("b")), Some(&NodeOutcome::Skipped));
    assert_eq!(result.outcome(&NodeId::workload("d")), Some(&NodeOutcome::Skipped));
}

#[tokio::test]
async fn signature_cache_tracks_applied_nodes() {
    let graph = four_nodes("1");
    let cache = MemoryCache::new();
    Reconciler::default().apply(&graph, &MemoryCluster::new(), &cache, &CancellationToken::new()).await.unwrap();
    for node in graph.nodes() {
        let last = cache.last("ns", &node.id).unwrap().unwrap();
        assert_eq!(last.signature, node.signature());
        assert!(!last.resource_version.is_empty());
    }
}

#[tokio::test]
async fn cache_vouches_only_for_the_version_it_recorded() {
    let graph = four_nodes("1");
    let cluster = MemoryCluster::new();
    let cache = MemoryCache::new();
    let r = Reconciler::default();
    let cancel = CancellationToken::new();
    r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();

    let id = NodeId::config("c");
    let key = ObjectKey::new("ns", ObjectKind::ConfigData, "c");
    cluster.tamper(&key, |m| m["data"]["k"] = serde_json::json!("hand-edited"));
    let edited_rv = cluster.object(&key).unwrap().resource_version.unwrap();
    cache.put(AppliedRecord::new("ns", &id, graph.get(&id).unwrap().signature(), edited_rv)).unwrap();

    let trusted = r.apply(&graph, &cluster, &cache, &cancel).await.unwrap();
    assert_eq!(trusted.outcome(&id), Some(&NodeOutcome::Unchanged));
    assert_eq!(cluster.mutations().len(), 4);

    let compared = r.apply(&graph, &cluster, &MemoryCache::new(), &cancel).await.unwrap();
    assert_eq!(compared.outcome(&id), Some(&NodeOutcome::Updated));
}

#[tokio::test]
async fn plan_previews_without_mutating() {
    let graph = four_nodes("1");
    let cluster = MemoryCluster::new();
    let before = plan(&graph, &cluster).await.unwrap();
    assert!(before.iter().all(|p| p.action == PlannedAction::Create));
    assert_eq!(before.iter().map(|p| p.id.clone()).collect::<Vec<_>>(), order(&graph).unwrap());
    assert!(cluster.is_empty());

    Reconciler::default().apply(&graph, &cluster, &MemoryCache::new(), &CancellationToken::new()).await.unwrap();
    let after = plan(&four_nodes("2"), &cluster).await.unwrap();
    let changed: Vec<_> = after.iter().filter(|p| p.action == PlannedAction::Update).map(|p| p.id.clone()).collect();
    assert_eq!(changed, vec![NodeId::config("c")]);
    assert!(after.iter().find(|p| p.id == NodeId::config("c")).unwrap().summary.updates >= 1);
}
