//! In-memory cluster for tests and `--dry-run`.
//!
//! Objects are stored as rendered manifests with a monotonically increasing
//! resource version. Failures can be injected per node id.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;

use keel_core::{InstanceId, NodeId, ObjectKind, ObjectNode, ProductKind};

use crate::client::{ClusterClient, ClusterError, LiveObject, ObjectKey, WorkloadHealth};
use crate::cluster::product_selector;
use crate::render::{live_signature, render_manifest, served_form};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Create,
    Update,
}

#[derive(Debug, Clone)]
struct Injected {
    error: ClusterError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, LiveObject>,
    next_rv: u64,
    failures: BTreeMap<NodeId, Injected>,
    health: BTreeMap<InstanceId, Vec<WorkloadHealth>>,
    health_failures: BTreeMap<InstanceId, u32>,
    mutations: Vec<(Mutation, ObjectKey)>,
    statuses: BTreeMap<(ProductKind, InstanceId), Json>,
    status_conflicts: u32,
    status_patches: u32,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Delay every call, to widen race windows in concurrency tests.
    pub fn with_latency(mut self, d: Duration) -> Self {
        self.latency = Some(d);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    async fn pause(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    /// Fail the next `times` mutations of `id` with `error`.
    pub fn fail_next(&self, id: NodeId, error: ClusterError, times: u32) {
        self.lock().failures.insert(id, Injected { error, remaining: Some(times) });
    }

    pub fn fail_always(&self, id: NodeId, error: ClusterError) {
        self.lock().failures.insert(id, Injected { error, remaining: None });
    }

    pub fn clear_failures(&self) { self.lock().failures.clear(); }

    /// Report fixed workload health for `instance` instead of deriving it from stored workloads.
    pub fn set_health(&self, instance: &InstanceId, health: Vec<WorkloadHealth>) {
        self.lock().health.insert(instance.clone(), health);
    }

    /// Make the next `times` health reads for `instance` fail with a transport error.
    pub fn fail_health(&self, instance: &InstanceId, times: u32) {
        self.lock().health_failures.insert(instance.clone(), times);
    }

    /// Answer the next `times` status patches with a conflict.
    pub fn conflict_status(&self, times: u32) { self.lock().status_conflicts = times; }

    pub fn mutations(&self) -> Vec<(Mutation, ObjectKey)> { self.lock().mutations.clone() }

    pub fn clear_mutations(&self) { self.lock().mutations.clear(); }

    pub fn object(&self, key: &ObjectKey) -> Option<LiveObject> { self.lock().objects.get(key).cloned() }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    pub fn status(&self, kind: ProductKind, instance: &InstanceId) -> Option<Json> {
        self.lock().statuses.get(&(kind, instance.clone())).cloned()
    }

    /// Status patch attempts, including conflicted ones.
    pub fn status_patches(&self) -> u32 { self.lock().status_patches }

    /// Replace a stored object's manifest out of band, bumping its resource version.
    pub fn tamper(&self, key: &ObjectKey, edit: impl FnOnce(&mut Json)) {
        let mut st = self.lock();
        st.next_rv += 1;
        let rv = st.next_rv.to_string();
        if let Some(obj) = st.objects.get_mut(key) {
            edit(&mut obj.manifest);
            obj.resource_version = Some(rv);
            obj.signature = live_signature(&obj.manifest);
        }
    }
}

fn labelled(o: &LiveObject, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| o.manifest.pointer("/metadata/labels").and_then(|l| l.get(k)).and_then(Json::as_str) == Some(v.as_str()))
}

fn injected(st: &mut State, id: &NodeId) -> Option<ClusterError> {
    let inj = st.failures.get_mut(id)?;
    match inj.remaining.as_mut() {
        None => Some(inj.error.clone()),
        Some(0) => None,
        Some(n) => {
            *n -= 1;
            Some(inj.error.clone())
        }
    }
}

fn store(st: &mut State, namespace: &str, node: &ObjectNode) -> LiveObject {
    st.next_rv += 1;
    let mut manifest = served_form(render_manifest(namespace, node));
    let rv = st.next_rv.to_string();
    manifest["metadata"]["resourceVersion"] = Json::String(rv.clone());
    let key = ObjectKey::of(namespace, &node.id);
    let live = LiveObject { key: key.clone(), resource_version: Some(rv), signature: Some(node.signature()), manifest };
    st.objects.insert(key, live.clone());
    live
}

/// RFC 7386 merge patch.
fn merge_patch(target: &mut Json, patch: &Json) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p.iter() {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>, ClusterError> {
        self.pause().await;
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn create(&self, namespace: &str, node: &ObjectNode) -> Result<LiveObject, ClusterError> {
        self.pause().await;
        let mut st = self.lock();
        if let Some(e) = injected(&mut st, &node.id) {
            return Err(e);
        }
        let key = ObjectKey::of(namespace, &node.id);
        if st.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists);
        }
        st.mutations.push((Mutation::Create, key));
        Ok(store(&mut st, namespace, node))
    }

    async fn update(&self, namespace: &str, node: &ObjectNode, resource_version: &str) -> Result<LiveObject, ClusterError> {
        self.pause().await;
        let mut st = self.lock();
        if let Some(e) = injected(&mut st, &node.id) {
            return Err(e);
        }
        let key = ObjectKey::of(namespace, &node.id);
        match st.objects.get(&key) {
            None => return Err(ClusterError::NotFound),
            Some(live) if live.resource_version.as_deref() != Some(resource_version) => {
                return Err(ClusterError::Conflict(format!("{} is at a newer resource version", key)));
            }
            Some(_) => {}
        }
        st.mutations.push((Mutation::Update, key));
        Ok(store(&mut st, namespace, node))
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ObjectKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<LiveObject>, ClusterError> {
        self.pause().await;
        let st = self.lock();
        Ok(st
            .objects
            .values()
            .filter(|o| o.key.namespace == namespace && o.key.kind == kind)
            .filter(|o| labelled(o, selector))
            .cloned()
            .collect())
    }

    async fn workload_health(&self, kind: ProductKind, instance: &InstanceId) -> Result<Vec<WorkloadHealth>, ClusterError> {
        self.pause().await;
        let mut st = self.lock();
        if let Some(n) = st.health_failures.get_mut(instance) {
            if *n > 0 {
                *n -= 1;
                return Err(ClusterError::Transport("health read failed".into()));
            }
        }
        if let Some(h) = st.health.get(instance) {
            return Ok(h.clone());
        }
        // Stored workloads report every replica ready.
        let selector = product_selector(kind, instance);
        Ok(st
            .objects
            .values()
            .filter(|o| o.key.namespace == instance.namespace && o.key.kind == ObjectKind::Workload)
            .filter(|o| labelled(o, &selector))
            .map(|o| {
                let replicas = o.manifest.pointer("/spec/replicas").and_then(Json::as_u64).unwrap_or(1) as u32;
                WorkloadHealth::new(o.key.name.clone(), replicas, replicas)
            })
            .collect())
    }

    async fn patch_status(&self, kind: ProductKind, instance: &InstanceId, status: &Json) -> Result<(), ClusterError> {
        self.pause().await;
        let mut st = self.lock();
        st.status_patches += 1;
        if st.status_conflicts > 0 {
            st.status_conflicts -= 1;
            return Err(ClusterError::Conflict("status was modified".into()));
        }
        let slot = st.statuses.entry((kind, instance.clone())).or_insert_with(|| Json::Object(Default::default()));
        merge_patch(slot, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ObjectBody, WorkloadBody, INSTANCE_LABEL, PRODUCT_LABEL};
    use serde_json::json;

    fn config(name: &str, v: &str) -> ObjectNode {
        ObjectNode::new(name, "config", ObjectBody::ConfigData { data: BTreeMap::from([("k".to_string(), v.to_string())]) })
    }

    #[tokio::test]
    async fn create_then_update_requires_current_version() {
        let c = MemoryCluster::new();
        let live = c.create("ns", &config("a", "1")).await.unwrap();
        assert_eq!(c.create("ns", &config("a", "1")).await.unwrap_err(), ClusterError::AlreadyExists);
        let rv = live.resource_version.unwrap();
        let updated = c.update("ns", &config("a", "2"), &rv).await.unwrap();
        assert_ne!(updated.resource_version.as_deref(), Some(rv.as_str()));
        assert!(matches!(c.update("ns", &config("a", "3"), &rv).await, Err(ClusterError::Conflict(_))));
        assert_eq!(c.mutations().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let c = MemoryCluster::new();
        c.fail_next(NodeId::config("a"), ClusterError::Transport("down".into()), 2);
        assert!(c.create("ns", &config("a", "1")).await.is_err());
        assert!(c.create("ns", &config("a", "1")).await.is_err());
        assert!(c.create("ns", &config("a", "1")).await.is_ok());
    }

    fn deployment(name: &str, product: ProductKind, replicas: u32) -> ObjectNode {
        let w = WorkloadBody {
            replicas,
            selector: BTreeMap::new(),
            containers: vec![],
            volumes: vec![],
            service_account: None,
            pull_secrets: vec![],
            security: None,
        };
        ObjectNode::new(name, "web", ObjectBody::Workload(w)).with_labels(BTreeMap::from([
            (INSTANCE_LABEL.to_string(), "demo".to_string()),
            (PRODUCT_LABEL.to_string(), product.as_str().to_string()),
        ]))
    }

    #[tokio::test]
    async fn health_defaults_to_stored_workloads() {
        let c = MemoryCluster::new();
        let id = InstanceId::new("ns", "demo");
        c.create("ns", &deployment("demo-blackduck-web", ProductKind::BlackDuck, 3)).await.unwrap();
        c.create("ns", &deployment("demo-alert-web", ProductKind::Alert, 1)).await.unwrap();
        assert_eq!(
            c.workload_health(ProductKind::BlackDuck, &id).await.unwrap(),
            vec![WorkloadHealth::new("demo-blackduck-web", 3, 3)]
        );
        assert_eq!(c.workload_health(ProductKind::Alert, &id).await.unwrap(), vec![WorkloadHealth::new("demo-alert-web", 1, 1)]);
        assert!(c.workload_health(ProductKind::OpsSight, &id).await.unwrap().is_empty());
        c.fail_health(&id, 1);
        assert!(c.workload_health(ProductKind::BlackDuck, &id).await.is_err());
        c.set_health(&id, vec![WorkloadHealth::new("demo-blackduck-web", 3, 1)]);
        assert!(!c.workload_health(ProductKind::BlackDuck, &id).await.unwrap()[0].is_healthy());
    }

    #[tokio::test]
    async fn status_patches_merge_and_conflict() {
        let c = MemoryCluster::new();
        let id = InstanceId::new("ns", "demo");
        c.patch_status(ProductKind::Alert, &id, &json!({ "phase": "Pending", "message": "x" })).await.unwrap();
        c.conflict_status(1);
        assert!(c.patch_status(ProductKind::Alert, &id, &json!({ "phase": "Ready" })).await.is_err());
        c.patch_status(ProductKind::Alert, &id, &json!({ "phase": "Ready", "message": null })).await.unwrap();
        assert_eq!(c.status(ProductKind::Alert, &id), Some(json!({ "phase": "Ready" })));
        assert_eq!(c.status_patches(), 3);
    }
}
