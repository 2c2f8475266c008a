//! Spec in, reconciled cluster out: compose then apply.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_apply::{order, Reconciler};
use keel_core::{KeelError, ObjectGraph, ProductSpec, ReconciliationResult};
use keel_kubehub::{render_manifest, ClusterClient};
use keel_persist::SignatureCache;
use keel_registry::{compose, Registry};

pub struct Pipeline {
    registry: Arc<Registry>,
    cluster: Arc<dyn ClusterClient>,
    reconciler: Reconciler,
    credential_seed: Option<String>,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, cluster: Arc<dyn ClusterClient>, reconciler: Reconciler) -> Self {
        Self { registry, cluster, reconciler, credential_seed: None }
    }

    /// Seed for generated secrets, applied to specs that carry none.
    pub fn with_credential_seed(mut self, seed: Option<String>) -> Self {
        self.credential_seed = seed;
        self
    }

    fn seeded<'a>(&self, spec: &'a ProductSpec) -> Cow<'a, ProductSpec> {
        match (&spec.credential_seed, &self.credential_seed) {
            (None, Some(seed)) => Cow::Owned(ProductSpec { credential_seed: Some(seed.clone()), ..spec.clone() }),
            _ => Cow::Borrowed(spec),
        }
    }

    pub fn registry(&self) -> &Registry { &self.registry }
    pub fn cluster(&self) -> Arc<dyn ClusterClient> { Arc::clone(&self.cluster) }

    pub fn compose(&self, spec: &ProductSpec) -> Result<ObjectGraph, KeelError> { compose(&self.registry, &self.seeded(spec)) }

    /// One full reconciliation pass for `spec`.
    pub async fn reconcile(
        &self,
        spec: &ProductSpec,
        cache: &dyn SignatureCache,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationResult, KeelError> {
        let graph = self.compose(spec)?;
        let result = self
            .reconciler
            .apply(&graph, self.cluster.as_ref(), cache, cancel)
            .await
            .map_err(|e| e.for_instance(&spec.id))?;
        info!(instance = %spec.id, status = %result.status, "pipeline pass done");
        Ok(result)
    }
}

/// Rendered manifests for `spec`, in apply order.
pub fn render(registry: &Registry, spec: &ProductSpec) -> Result<Vec<Json>> {
    let graph = compose(registry, spec).context("composing object graph")?;
    let ids = order(&graph).context("ordering object graph")?;
    Ok(ids
        .iter()
        .filter_map(|id| graph.get(id))
        .map(|node| render_manifest(&spec.id.namespace, node))
        .collect())
}
