//! Watch-driven operator: one supervisor per product instance, periodic resync.
//!
//! Instances are keyed by product kind and namespaced name, so a Black Duck
//! and an Alert may share a name without sharing a supervisor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use keel_apply::Reconciler;
use keel_core::{InstanceId, OutcomeCounts, ProductKind, ProductStatus};
use keel_kubehub::{watch_products, ClusterClient, KubeCluster, ProductEvent};
use keel_registry::Registry;

use crate::pipeline::Pipeline;
use crate::settings::OperatorSettings;
use crate::status::{write_status, ProductStatusReport};
use crate::supervisor::{Supervisor, SupervisorConfig};

/// Pause before a failed watcher is restarted.
const WATCH_RESTART: Duration = Duration::from_secs(5);

pub struct Operator {
    pipeline: Arc<Pipeline>,
    settings: OperatorSettings,
    supervisors: FxHashMap<InstanceKey, Supervisor>,
}

/// Product kind plus namespaced name.
pub type InstanceKey = (ProductKind, InstanceId);

impl Operator {
    pub fn new(pipeline: Arc<Pipeline>, settings: OperatorSettings) -> Self {
        Self { pipeline, settings, supervisors: FxHashMap::default() }
    }

    fn default_namespace(&self) -> &str { self.settings.namespace.as_deref().unwrap_or("default") }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig { status_policy: self.settings.status_policy(), status_interval: self.settings.status_interval() }
    }

    /// Route one watch event to its instance supervisor.
    pub fn handle(&mut self, event: ProductEvent) -> Result<()> {
        match event {
            ProductEvent::Applied(doc) => {
                counter!("operator_applied_events_total", 1u64);
                let spec = match keel_schema::from_manifest(&doc, self.default_namespace()) {
                    Ok(spec) => spec,
                    Err(e) => {
                        self.report_invalid(&doc, &e.to_string());
                        return Err(e).context("parsing product document");
                    }
                };
                let key = (spec.product, spec.id.clone());
                if let Some(sup) = self.supervisors.get(&key) {
                    // Status write-backs come back as events with an unchanged generation.
                    sup.submit(spec);
                    return Ok(());
                }
                let sup = Supervisor::spawn(Arc::clone(&self.pipeline), self.settings.open_cache(), spec, self.supervisor_config());
                self.supervisors.insert(key, sup);
            }
            ProductEvent::Deleted(kind, id) => {
                counter!("operator_deleted_events_total", 1u64);
                match self.supervisors.remove(&(kind, id.clone())) {
                    Some(sup) => {
                        sup.delete();
                        tokio::spawn(sup.shutdown());
                    }
                    None => debug!(product = %kind, instance = %id, "delete for unknown instance"),
                }
            }
        }
        Ok(())
    }

    /// Re-enqueue every live instance.
    pub fn resync_all(&self) {
        debug!(instances = self.supervisors.len(), "resync");
        for sup in self.supervisors.values() {
            sup.resync();
        }
    }

    pub fn supervisor(&self, kind: ProductKind, id: &InstanceId) -> Option<&Supervisor> {
        self.supervisors.get(&(kind, id.clone()))
    }

    pub fn instances(&self) -> Vec<InstanceKey> {
        let mut ids: Vec<InstanceKey> = self.supervisors.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown(mut self) {
        for (_, sup) in self.supervisors.drain() {
            sup.shutdown().await;
        }
    }

    /// Surface a document that failed to parse on its own status, when it names itself.
    fn report_invalid(&self, doc: &Json, reason: &str) {
        let kind = doc.get("kind").and_then(Json::as_str).and_then(|k| k.parse::<ProductKind>().ok());
        let name = doc.pointer("/metadata/name").and_then(Json::as_str);
        let (Some(kind), Some(name)) = (kind, name) else { return };
        let ns = doc.pointer("/metadata/namespace").and_then(Json::as_str).unwrap_or(self.default_namespace());
        let id = InstanceId::new(ns, name);
        let generation = doc.pointer("/metadata/generation").and_then(Json::as_i64);
        let report = ProductStatusReport::new(ProductStatus::Failed, Some(reason.to_string()), generation, OutcomeCounts::default());
        let cluster = self.pipeline.cluster();
        tokio::spawn(async move {
            write_status(cluster.as_ref(), kind, &id, &report).await;
        });
    }
}

/// Run the operator against the current kube context until ctrl-c.
pub async fn run(settings: OperatorSettings, registry: Arc<Registry>) -> Result<()> {
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::connect().await.context("connecting to cluster")?);
    if settings.credential_seed.is_none() {
        warn!("KEEL_CREDENTIAL_SEED unset; generated secrets derive from instance identity alone");
    }
    let pipeline = Arc::new(
        Pipeline::new(registry, cluster, Reconciler::new(settings.retry())).with_credential_seed(settings.credential_seed.clone()),
    );

    let (tx, mut rx) = mpsc::channel::<ProductEvent>(settings.queue_cap.max(1));
    for kind in ProductKind::ALL {
        let tx = tx.clone();
        let ns = settings.namespace.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = watch_products(kind, ns.as_deref(), tx.clone()).await {
                    counter!("watch_restarts_total", 1u64);
                    warn!(product = %kind, error = %format!("{:#}", e), "product watcher failed");
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(WATCH_RESTART).await;
            }
        });
    }
    drop(tx);

    let mut operator = Operator::new(pipeline, settings.clone());
    let mut resync = tokio::time::interval(settings.resync());
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    resync.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    info!(ns = ?settings.namespace, resync_secs = settings.resync_secs, "operator running");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            ev = rx.recv() => match ev {
                Some(ev) => {
                    if let Err(e) = operator.handle(ev) {
                        warn!(error = %format!("{:#}", e), "event rejected");
                    }
                }
                None => {
                    warn!("all watchers stopped");
                    break;
                }
            },
            _ = resync.tick() => operator.resync_all(),
        }
    }
    operator.shutdown().await;
    Ok(())
}
