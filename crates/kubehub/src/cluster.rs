//! `ClusterClient` over kube dynamic objects.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use keel_core::{InstanceId, ObjectKind, ObjectNode, ProductKind, INSTANCE_LABEL, PRODUCT_LABEL};

use crate::client::{ClusterClient, ClusterError, LiveObject, ObjectKey, WorkloadHealth};
use crate::render::{gvk, live_signature, render_manifest};

/// API group and version serving the product custom resources.
pub const PRODUCT_GROUP: &str = "synopsys.com";
pub const PRODUCT_VERSION: &str = "v1";

pub fn product_gvk(kind: ProductKind) -> GroupVersionKind {
    GroupVersionKind { group: PRODUCT_GROUP.into(), version: PRODUCT_VERSION.into(), kind: kind.resource_kind().into() }
}

/// Resolve a served resource through an already-run discovery.
pub(crate) fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Some((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    None
}

fn map_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound,
            409 if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists,
            409 => ClusterError::Conflict(resp.message),
            400..=499 => ClusterError::Rejected(format!("{} ({})", resp.message, resp.code)),
            _ => ClusterError::Transport(format!("{} ({})", resp.message, resp.code)),
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

fn to_live(key: ObjectKey, obj: &DynamicObject) -> Result<LiveObject, ClusterError> {
    let manifest = serde_json::to_value(obj).map_err(|e| ClusterError::Transport(e.to_string()))?;
    Ok(LiveObject {
        key,
        resource_version: obj.metadata.resource_version.clone(),
        signature: live_signature(&manifest),
        manifest,
    })
}

fn to_dynamic(namespace: &str, node: &ObjectNode, resource_version: Option<&str>) -> Result<DynamicObject, ClusterError> {
    let mut manifest = render_manifest(namespace, node);
    if let Some(rv) = resource_version {
        manifest["metadata"]["resourceVersion"] = serde_json::Value::String(rv.to_string());
    }
    serde_json::from_value(manifest).map_err(|e| ClusterError::Rejected(format!("render {}: {}", node.id, e)))
}

/// Labels carried by every workload of one product instance.
pub(crate) fn product_selector(kind: ProductKind, instance: &InstanceId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PRODUCT_LABEL.to_string(), kind.as_str().to_string()),
        (INSTANCE_LABEL.to_string(), instance.name.clone()),
    ])
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Cluster client backed by a kube `Client`. Discovery runs once at connect.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    resources: BTreeMap<ObjectKind, ApiResource>,
    products: BTreeMap<ProductKind, ApiResource>,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::with_client(client).await
    }

    pub async fn with_client(client: Client) -> Result<Self> {
        let started = std::time::Instant::now();
        let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
        let mut resources = BTreeMap::new();
        for kind in ObjectKind::ALL {
            let (g, v, k) = gvk(kind);
            let want = GroupVersionKind { group: g.into(), version: v.into(), kind: k.into() };
            match find_api_resource(&discovery, &want) {
                Some((ar, _)) => { resources.insert(kind, ar); }
                None => debug!(kind = kind.as_str(), "kind not served by this cluster"),
            }
        }
        let mut products = BTreeMap::new();
        for kind in ProductKind::ALL {
            if let Some((ar, _)) = find_api_resource(&discovery, &product_gvk(kind)) {
                products.insert(kind, ar);
            }
        }
        histogram!("discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(kinds = resources.len(), products = products.len(), "cluster discovery cached");
        Ok(Self { client, resources, products })
    }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, namespace: &str, kind: ObjectKind) -> Result<Api<DynamicObject>, ClusterError> {
        let ar = self.resources.get(&kind).ok_or_else(|| {
            let (g, v, k) = gvk(kind);
            ClusterError::Rejected(format!("{}/{}/{} is not served by this cluster", g, v, k))
        })?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, ar))
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>, ClusterError> {
        let api = self.api(&key.namespace, key.kind)?;
        match api.get_opt(&key.name).await.map_err(map_err)? {
            Some(obj) => Ok(Some(to_live(key.clone(), &obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, namespace: &str, node: &ObjectNode) -> Result<LiveObject, ClusterError> {
        let api = self.api(namespace, node.id.kind)?;
        let obj = to_dynamic(namespace, node, None)?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(map_err)?;
        counter!("kube_create_total", 1u64);
        to_live(ObjectKey::of(namespace, &node.id), &created)
    }

    async fn update(&self, namespace: &str, node: &ObjectNode, resource_version: &str) -> Result<LiveObject, ClusterError> {
        let api = self.api(namespace, node.id.kind)?;
        let obj = to_dynamic(namespace, node, Some(resource_version))?;
        let replaced = api.replace(&node.id.name, &PostParams::default(), &obj).await.map_err(map_err)?;
        counter!("kube_update_total", 1u64);
        to_live(ObjectKey::of(namespace, &node.id), &replaced)
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ObjectKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<LiveObject>, ClusterError> {
        let api = self.api(namespace, kind)?;
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = api.list(&lp).await.map_err(map_err)?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            let name = obj.metadata.name.clone().unwrap_or_default();
            out.push(to_live(ObjectKey::new(namespace, kind, name), obj)?);
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn workload_health(&self, kind: ProductKind, instance: &InstanceId) -> Result<Vec<WorkloadHealth>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &instance.namespace);
        let lp = ListParams::default().labels(&selector_string(&product_selector(kind, instance)));
        let list = api.list(&lp).await.map_err(map_err)?;
        let mut out: Vec<WorkloadHealth> = list
            .items
            .iter()
            .map(|d| {
                let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1).max(0) as u32;
                let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0).max(0) as u32;
                WorkloadHealth::new(d.metadata.name.clone().unwrap_or_default(), desired, ready)
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn patch_status(&self, kind: ProductKind, instance: &InstanceId, status: &serde_json::Value) -> Result<(), ClusterError> {
        let Some(ar) = self.products.get(&kind) else {
            warn!(product = %kind, "product resource not served; status not written");
            return Err(ClusterError::Rejected(format!("{} is not served by this cluster", kind.resource_kind())));
        };
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &instance.namespace, ar);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&instance.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: reason.into(), code })
    }

    #[test]
    fn kube_errors_map_to_cluster_classes() {
        assert_eq!(map_err(api_err(404, "NotFound")), ClusterError::NotFound);
        assert_eq!(map_err(api_err(409, "AlreadyExists")), ClusterError::AlreadyExists);
        assert_eq!(map_err(api_err(409, "Conflict")), ClusterError::Conflict("boom".into()));
        assert!(matches!(map_err(api_err(422, "Invalid")), ClusterError::Rejected(_)));
        assert!(matches!(map_err(api_err(503, "ServiceUnavailable")), ClusterError::Transport(_)));
    }

    #[test]
    fn selectors_render_sorted() {
        let sel = BTreeMap::from([("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())]);
        assert_eq!(selector_string(&sel), "a=1,b=2");
    }

    #[test]
    fn health_selector_names_product_and_instance() {
        let sel = product_selector(ProductKind::Alert, &InstanceId::new("ns", "shared"));
        assert_eq!(selector_string(&sel), "keel.io/instance=shared,keel.io/product=alert");
    }

    #[test]
    fn product_resources_live_under_synopsys_group() {
        let g = product_gvk(ProductKind::BlackDuck);
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("synopsys.com", "v1", "BlackDuck"));
    }
}
