//! Dependency-ordered, idempotent application of an object graph.

use std::collections::BTreeMap;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::{
    ApplyError, BuildError, NodeId, NodeOutcome, NodeResult, ObjectGraph, ObjectNode, ProductStatus, ReconciliationResult,
};
use keel_kubehub::{body_drifted, ClusterClient, ClusterError, LiveObject, ObjectKey};
use keel_persist::{AppliedRecord, SignatureCache};

use crate::retry::RetryConfig;

/// Referenced nodes before dependents; ties broken by lowest `NodeId`.
pub fn order(graph: &ObjectGraph) -> Result<Vec<NodeId>, BuildError> { graph.topological_order() }

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    retry: RetryConfig,
}

enum Step {
    Done(NodeOutcome, Option<LiveObject>),
    Race(&'static str, ClusterError),
    Error(&'static str, ClusterError),
}

impl Reconciler {
    pub fn new(retry: RetryConfig) -> Self { Self { retry } }

    pub fn retry(&self) -> &RetryConfig { &self.retry }

    /// Apply `graph` in dependency order.
    ///
    /// Failed nodes block their dependents only; independent nodes continue.
    /// Once `cancel` fires, nodes not yet started are `Skipped`.
    pub async fn apply(
        &self,
        graph: &ObjectGraph,
        cluster: &dyn ClusterClient,
        cache: &dyn SignatureCache,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationResult, BuildError> {
        let started = Instant::now();
        let ids = order(graph)?;
        let ns = graph.instance.namespace.as_str();
        let mut outcomes: BTreeMap<NodeId, NodeOutcome> = BTreeMap::new();
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(node) = graph.get(&id) else { continue };
            let result = if cancel.is_cancelled() {
                NodeResult { id: id.clone(), outcome: NodeOutcome::Skipped, attempts: 0 }
            } else if let Some(by) = blocker(graph, &id, &outcomes) {
                counter!("apply_blocked_total", 1u64);
                debug!(instance = %graph.instance, node = %id, blocked_by = %by, "node blocked");
                NodeResult { id: id.clone(), outcome: NodeOutcome::Blocked { by }, attempts: 0 }
            } else {
                self.apply_node(ns, node, cluster, cache, cancel).await
            };
            outcomes.insert(id, result.outcome.clone());
            nodes.push(result);
        }

        let mut result = ReconciliationResult { instance: graph.instance.clone(), nodes, status: ProductStatus::Pending };
        if result.has_failures() {
            result.status = ProductStatus::Failed;
        }
        let c = result.counts();
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            instance = %graph.instance,
            created = c.created,
            updated = c.updated,
            unchanged = c.unchanged,
            failed = c.failed,
            blocked = c.blocked,
            skipped = c.skipped,
            "reconciliation pass finished"
        );
        Ok(result)
    }

    async fn apply_node(
        &self,
        ns: &str,
        node: &ObjectNode,
        cluster: &dyn ClusterClient,
        cache: &dyn SignatureCache,
        cancel: &CancellationToken,
    ) -> NodeResult {
        let key = ObjectKey::of(ns, &node.id);
        let signature = node.signature();
        let vouched = vouched_version(cache, ns, node, &signature);
        let max = self.retry.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut races = 0u32;
        let mut failures = 0u32;
        let outcome = loop {
            attempts += 1;
            match step(cluster, &key, node, &signature, vouched.as_deref()).await {
                Step::Done(outcome, live) => {
                    record(cache, ns, node, &signature, &outcome, live.as_ref());
                    break outcome;
                }
                // Another writer got there first: re-fetch straight away.
                Step::Race(_, e) if races < max && !cancel.is_cancelled() => {
                    races += 1;
                    counter!("apply_race_total", 1u64);
                    debug!(node = %node.id, error = %e, "write raced; re-fetching");
                }
                Step::Race(action, e) | Step::Error(action, e) => {
                    failures += 1;
                    if failures >= max || cancel.is_cancelled() {
                        break failed(node, attempts, action, &e);
                    }
                    let delay = self.retry.delay(failures);
                    warn!(node = %node.id, attempt = attempts, error = %e, delay_ms = delay.as_millis() as u64, "apply failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break failed(node, attempts, action, &e),
                    }
                }
            }
        };
        NodeResult { id: node.id.clone(), outcome, attempts }
    }
}

fn failed(node: &ObjectNode, attempts: u32, action: &'static str, e: &ClusterError) -> NodeOutcome {
    let error = if attempts == 1 {
        ApplyError::Cluster { node: node.id.to_string(), action, reason: e.to_string() }
    } else {
        ApplyError::Exhausted { node: node.id.to_string(), attempts, last: e.to_string() }
    };
    counter!("apply_failed_total", 1u64);
    warn!(node = %node.id, attempts, error = %error, "node failed");
    NodeOutcome::Failed { error: error.to_string() }
}

/// First in-graph dependency that failed or was itself blocked.
fn blocker(graph: &ObjectGraph, id: &NodeId, outcomes: &BTreeMap<NodeId, NodeOutcome>) -> Option<NodeId> {
    graph
        .dependencies_of(id)
        .into_iter()
        .find(|d| outcomes.get(*d).map(NodeOutcome::is_failure).unwrap_or(false))
        .cloned()
}

/// Resource version the cache last wrote `signature` at, if that is the newest record.
fn vouched_version(cache: &dyn SignatureCache, ns: &str, node: &ObjectNode, signature: &str) -> Option<String> {
    match cache.last(ns, &node.id) {
        Ok(Some(last)) if last.signature == signature && !last.resource_version.is_empty() => Some(last.resource_version),
        Ok(_) => None,
        Err(e) => {
            debug!(node = %node.id, error = %e, "signature cache read failed");
            None
        }
    }
}

/// Live signature matches and the body is either vouched for by the cache or still holds the rendered fields.
fn in_sync(ns: &str, node: &ObjectNode, signature: &str, vouched: Option<&str>, live: &LiveObject) -> bool {
    if live.signature.as_deref() != Some(signature) {
        return false;
    }
    if vouched.is_some() && live.resource_version.as_deref() == vouched {
        return true;
    }
    !body_drifted(ns, node, &live.manifest)
}

async fn step(cluster: &dyn ClusterClient, key: &ObjectKey, node: &ObjectNode, signature: &str, vouched: Option<&str>) -> Step {
    let live = match cluster.get(key).await {
        Ok(l) => l,
        Err(e) => return Step::Error("get", e),
    };
    match live {
        None => match cluster.create(&key.namespace, node).await {
            Ok(l) => {
                counter!("apply_created_total", 1u64);
                Step::Done(NodeOutcome::Created, Some(l))
            }
            Err(e @ ClusterError::AlreadyExists) => Step::Race("create", e),
            Err(e) => Step::Error("create", e),
        },
        Some(l) if in_sync(&key.namespace, node, signature, vouched, &l) => {
            counter!("apply_unchanged_total", 1u64);
            Step::Done(NodeOutcome::Unchanged, Some(l))
        }
        Some(l) => {
            if l.signature.as_deref() == Some(signature) {
                counter!("apply_drift_total", 1u64);
                info!(node = %node.id, "live object edited out of band; restoring");
            }
            let rv = l.resource_version.unwrap_or_default();
            match cluster.update(&key.namespace, node, &rv).await {
                Ok(l) => {
                    counter!("apply_updated_total", 1u64);
                    Step::Done(NodeOutcome::Updated, Some(l))
                }
                Err(e @ (ClusterError::Conflict(_) | ClusterError::NotFound)) => Step::Race("update", e),
                Err(e) => Step::Error("update", e),
            }
        }
    }
}

fn record(cache: &dyn SignatureCache, ns: &str, node: &ObjectNode, signature: &str, outcome: &NodeOutcome, live: Option<&LiveObject>) {
    let rv = live.and_then(|l| l.resource_version.clone()).unwrap_or_default();
    if matches!(outcome, NodeOutcome::Unchanged) {
        if let Ok(Some(last)) = cache.last(ns, &node.id) {
            if last.signature == signature && last.resource_version == rv {
                return;
            }
        }
    }
    if let Err(e) = cache.put(AppliedRecord::new(ns, &node.id, signature, rv)) {
        warn!(node = %node.id, error = %e, "signature cache write failed");
    }
}
