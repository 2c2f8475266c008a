//! Cluster seam used by the reconciler, the status poller and the status writer.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use keel_core::{InstanceId, NodeId, ObjectKind, ObjectNode, ProductKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cluster address of one object: namespace plus the logical node identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub kind: ObjectKind,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, kind: ObjectKind, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind, name: name.into() }
    }

    pub fn of(namespace: &str, id: &NodeId) -> Self { Self::new(namespace, id.kind, id.name.clone()) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind.as_str(), self.name)
    }
}

/// What the cluster currently holds for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveObject {
    pub key: ObjectKey,
    pub resource_version: Option<String>,
    /// Signature annotation stamped by the last apply, if any.
    pub signature: Option<String>,
    pub manifest: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Races with another writer; resolved by re-fetching rather than backing off.
    pub fn is_race(&self) -> bool { matches!(self, ClusterError::AlreadyExists | ClusterError::Conflict(_)) }
}

/// Observed readiness of one workload controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadHealth {
    pub name: String,
    pub desired: u32,
    pub ready: u32,
}

impl WorkloadHealth {
    pub fn new(name: impl Into<String>, desired: u32, ready: u32) -> Self { Self { name: name.into(), desired, ready } }
    pub fn is_healthy(&self) -> bool { self.ready >= self.desired }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>, ClusterError>;

    async fn create(&self, namespace: &str, node: &ObjectNode) -> Result<LiveObject, ClusterError>;

    /// Replace the object, guarded by the live `resource_version`.
    async fn update(&self, namespace: &str, node: &ObjectNode, resource_version: &str) -> Result<LiveObject, ClusterError>;

    async fn list(
        &self,
        namespace: &str,
        kind: ObjectKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<LiveObject>, ClusterError>;

    /// Health of every workload labelled with both `kind` and `instance`.
    async fn workload_health(&self, kind: ProductKind, instance: &InstanceId) -> Result<Vec<WorkloadHealth>, ClusterError>;

    /// Merge-patch the status sub-resource of a product resource.
    async fn patch_status(&self, kind: ProductKind, instance: &InstanceId, status: &serde_json::Value) -> Result<(), ClusterError>;
}
