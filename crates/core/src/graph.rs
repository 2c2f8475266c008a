//! Intermediate object model: deployable nodes, their references and the per-instance graph.
//!
//! Nodes reference each other by logical [`NodeId`] (kind + name), never by
//! cluster-assigned identity. Translation to concrete manifests happens at the
//! cluster boundary (`keel-kubehub`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{EnvVar, Port, Probe, Resources, VolumeMount};
use crate::error::BuildError;
use crate::spec::{ComponentKind, InstanceId, SecurityContext};

/// Kind of deployable artifact. Declaration order doubles as the apply tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    ConfigData,
    Secret,
    ServiceAccount,
    VolumeClaim,
    Endpoint,
    Workload,
    Route,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::ConfigData,
        ObjectKind::Secret,
        ObjectKind::ServiceAccount,
        ObjectKind::VolumeClaim,
        ObjectKind::Endpoint,
        ObjectKind::Workload,
        ObjectKind::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::ConfigData => "ConfigData",
            ObjectKind::Secret => "Secret",
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::VolumeClaim => "VolumeClaim",
            ObjectKind::Endpoint => "Endpoint",
            ObjectKind::Workload => "Workload",
            ObjectKind::Route => "Route",
        }
    }
}

/// Logical identity of a node within one instance graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub kind: ObjectKind,
    pub name: String,
}

impl NodeId {
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self { Self { kind, name: name.into() } }
    pub fn config(name: impl Into<String>) -> Self { Self::new(ObjectKind::ConfigData, name) }
    pub fn secret(name: impl Into<String>) -> Self { Self::new(ObjectKind::Secret, name) }
    pub fn workload(name: impl Into<String>) -> Self { Self::new(ObjectKind::Workload, name) }
    pub fn endpoint(name: impl Into<String>) -> Self { Self::new(ObjectKind::Endpoint, name) }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.kind.as_str(), self.name) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exposure {
    #[default]
    ClusterIp,
    NodePort,
    LoadBalancer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsTermination {
    #[default]
    Passthrough,
    Edge,
}

/// Whole config-data or secret bound into a container's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvFrom {
    ConfigData(String),
    Secret(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeBody {
    EmptyDir { name: String },
    Claim { name: String, claim: String },
    Secret { name: String, secret: String },
    ConfigData { name: String, config: String },
}

impl VolumeBody {
    pub fn name(&self) -> &str {
        match self {
            VolumeBody::EmptyDir { name } | VolumeBody::Claim { name, .. } | VolumeBody::Secret { name, .. } | VolumeBody::ConfigData { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerBody {
    pub name: String,
    pub image: String,
    pub resources: Resources,
    pub env: Vec<EnvVar>,
    pub env_from: Vec<EnvFrom>,
    pub ports: Vec<Port>,
    pub volume_mounts: Vec<VolumeMount>,
    pub liveness: Option<Probe>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadBody {
    pub replicas: u32,
    pub selector: BTreeMap<String, String>,
    pub containers: Vec<ContainerBody>,
    pub volumes: Vec<VolumeBody>,
    pub service_account: Option<String>,
    pub pull_secrets: Vec<String>,
    pub security: Option<SecurityContext>,
}

/// Kind-specific specification of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectBody {
    ConfigData { data: BTreeMap<String, String> },
    Secret { data: BTreeMap<String, String> },
    ServiceAccount,
    VolumeClaim { size: String, storage_class: Option<String> },
    Endpoint { selector: BTreeMap<String, String>, ports: Vec<Port>, exposure: Exposure },
    Workload(WorkloadBody),
    Route { endpoint: String, port: String, tls: TlsTermination },
}

impl ObjectBody {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectBody::ConfigData { .. } => ObjectKind::ConfigData,
            ObjectBody::Secret { .. } => ObjectKind::Secret,
            ObjectBody::ServiceAccount => ObjectKind::ServiceAccount,
            ObjectBody::VolumeClaim { .. } => ObjectKind::VolumeClaim,
            ObjectBody::Endpoint { .. } => ObjectKind::Endpoint,
            ObjectBody::Workload(_) => ObjectKind::Workload,
            ObjectBody::Route { .. } => ObjectKind::Route,
        }
    }

    /// References implied by the body itself.
    fn implied_refs(&self) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        match self {
            ObjectBody::Workload(w) => {
                for c in w.containers.iter() {
                    for ef in c.env_from.iter() {
                        match ef {
                            EnvFrom::ConfigData(n) => out.insert(NodeId::config(n.clone())),
                            EnvFrom::Secret(n) => out.insert(NodeId::secret(n.clone())),
                        };
                    }
                }
                for v in w.volumes.iter() {
                    match v {
                        VolumeBody::EmptyDir { .. } => {}
                        VolumeBody::Claim { claim, .. } => { out.insert(NodeId::new(ObjectKind::VolumeClaim, claim.clone())); }
                        VolumeBody::Secret { secret, .. } => { out.insert(NodeId::secret(secret.clone())); }
                        VolumeBody::ConfigData { config, .. } => { out.insert(NodeId::config(config.clone())); }
                    }
                }
                if let Some(sa) = &w.service_account {
                    out.insert(NodeId::new(ObjectKind::ServiceAccount, sa.clone()));
                }
                for ps in w.pull_secrets.iter() {
                    out.insert(NodeId::secret(ps.clone()));
                }
            }
            ObjectBody::Route { endpoint, .. } => { out.insert(NodeId::endpoint(endpoint.clone())); }
            _ => {}
        }
        out
    }
}

/// One deployable artifact plus the nodes it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectNode {
    pub id: NodeId,
    pub component: ComponentKind,
    pub labels: BTreeMap<String, String>,
    pub body: ObjectBody,
    pub refs: BTreeSet<NodeId>,
}

#[derive(Serialize)]
struct SignatureView<'a> {
    kind: ObjectKind,
    name: &'a str,
    labels: &'a BTreeMap<String, String>,
    body: &'a ObjectBody,
}

impl ObjectNode {
    /// Create a node; references implied by the body are recorded automatically.
    pub fn new(name: impl Into<String>, component: impl Into<ComponentKind>, body: ObjectBody) -> Self {
        let refs = body.implied_refs();
        Self { id: NodeId::new(body.kind(), name), component: component.into(), labels: BTreeMap::new(), body, refs }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Declare an explicit dependency not visible in the body.
    pub fn depends_on(mut self, id: NodeId) -> Self {
        self.refs.insert(id);
        self
    }

    /// Stable SHA-256 over kind, name, labels and body.
    pub fn signature(&self) -> String {
        let view = SignatureView { kind: self.id.kind, name: &self.id.name, labels: &self.labels, body: &self.body };
        // Serialization of plain structs and BTreeMaps cannot fail
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// All deployable nodes for one instance plus declared pre-existing externals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGraph {
    pub instance: InstanceId,
    nodes: BTreeMap<NodeId, ObjectNode>,
    externals: BTreeSet<NodeId>,
}

impl ObjectGraph {
    pub fn new(instance: InstanceId) -> Self {
        Self { instance, nodes: BTreeMap::new(), externals: BTreeSet::new() }
    }

    pub fn insert(&mut self, node: ObjectNode) -> Result<(), BuildError> {
        if self.nodes.contains_key(&node.id) {
            return Err(BuildError::DuplicateNode { node: node.id.to_string() });
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Declare a resource that exists outside this graph (e.g. an image pull secret).
    pub fn declare_external(&mut self, id: NodeId) { self.externals.insert(id); }

    pub fn get(&self, id: &NodeId) -> Option<&ObjectNode> { self.nodes.get(id) }
    pub fn nodes(&self) -> impl Iterator<Item = &ObjectNode> { self.nodes.values() }
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> { self.nodes.keys() }
    pub fn externals(&self) -> &BTreeSet<NodeId> { &self.externals }
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn workloads(&self) -> impl Iterator<Item = &ObjectNode> {
        self.nodes.values().filter(|n| n.id.kind == ObjectKind::Workload)
    }

    /// In-graph dependencies of `id` (externals excluded).
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<&NodeId> {
        match self.nodes.get(id) {
            Some(n) => n.refs.iter().filter(|r| self.nodes.contains_key(*r)).collect(),
            None => Vec::new(),
        }
    }

    /// Every reference must resolve to a node in this graph or a declared external.
    pub fn validate_references(&self) -> Result<(), BuildError> {
        for node in self.nodes.values() {
            for r in node.refs.iter() {
                if !self.nodes.contains_key(r) && !self.externals.contains(r) {
                    return Err(BuildError::DanglingReference { from: node.id.to_string(), to: r.to_string() });
                }
            }
        }
        Ok(())
    }

    /// Kahn ordering: referenced nodes first; ties broken by lowest `NodeId`.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, BuildError> {
        let mut indegree: BTreeMap<&NodeId, usize> = self.nodes.keys().map(|k| (k, 0usize)).collect();
        let mut dependents: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
        for node in self.nodes.values() {
            for dep in self.dependencies_of(&node.id) {
                if let Some(d) = indegree.get_mut(&node.id) { *d += 1; }
                dependents.entry(dep).or_default().push(&node.id);
            }
        }
        let mut ready: BTreeSet<&NodeId> = indegree.iter().filter(|(_, d)| **d == 0).map(|(k, _)| *k).collect();
        let mut out = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            out.push(next.clone());
            if let Some(ds) = dependents.get(next) {
                for d in ds.iter() {
                    if let Some(deg) = indegree.get_mut(*d) {
                        *deg -= 1;
                        if *deg == 0 { ready.insert(*d); }
                    }
                }
            }
        }
        if out.len() != self.nodes.len() {
            let stuck: Vec<String> = indegree.iter().filter(|(_, d)| **d > 0).map(|(k, _)| k.to_string()).collect();
            return Err(BuildError::GraphCycle { nodes: stuck });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str) -> ObjectNode {
        ObjectNode::new(name, "db", ObjectBody::Secret { data: BTreeMap::from([("k".to_string(), "v".to_string())]) })
    }

    fn workload(name: &str, secret: &str) -> ObjectNode {
        let body = WorkloadBody {
            replicas: 1,
            selector: BTreeMap::new(),
            containers: vec![ContainerBody {
                name: "c".into(),
                image: "img:1".into(),
                resources: Resources::default(),
                env: vec![],
                env_from: vec![EnvFrom::Secret(secret.to_string())],
                ports: vec![],
                volume_mounts: vec![],
                liveness: None,
            }],
            volumes: vec![],
            service_account: None,
            pull_secrets: vec![],
            security: None,
        };
        ObjectNode::new(name, "db", ObjectBody::Workload(body))
    }

    #[test]
    fn workload_refs_are_implied_by_body() {
        let w = workload("pg", "creds");
        assert!(w.refs.contains(&NodeId::secret("creds")));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let mut g = ObjectGraph::new(InstanceId::new("ns", "bd"));
        g.insert(workload("pg", "missing")).unwrap();
        let err = g.validate_references().unwrap_err();
        assert!(matches!(err, BuildError::DanglingReference { .. }), "{:?}", err);

        g.declare_external(NodeId::secret("missing"));
        g.validate_references().unwrap();
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let mut g = ObjectGraph::new(InstanceId::new("ns", "bd"));
        g.insert(secret("creds")).unwrap();
        assert!(matches!(g.insert(secret("creds")), Err(BuildError::DuplicateNode { .. })));
    }

    #[test]
    fn order_puts_secrets_before_workloads() {
        let mut g = ObjectGraph::new(InstanceId::new("ns", "bd"));
        // names chosen so lexical order alone would put the workload first
        g.insert(workload("a-pg", "z-creds")).unwrap();
        g.insert(secret("z-creds")).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![NodeId::secret("z-creds"), NodeId::workload("a-pg")]);
    }

    #[test]
    fn cycle_is_reported() {
        let mut g = ObjectGraph::new(InstanceId::new("ns", "bd"));
        g.insert(secret("a").depends_on(NodeId::config("b"))).unwrap();
        g.insert(
            ObjectNode::new("b", "db", ObjectBody::ConfigData { data: BTreeMap::new() }).depends_on(NodeId::secret("a")),
        )
        .unwrap();
        match g.topological_order() {
            Err(BuildError::GraphCycle { nodes }) => assert_eq!(nodes.len(), 2),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn signature_is_stable_and_content_sensitive() {
        let a = secret("creds");
        let b = secret("creds");
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().len(), 64);
        let c = ObjectNode::new("creds", "db", ObjectBody::Secret { data: BTreeMap::from([("k".to_string(), "other".to_string())]) });
        assert_ne!(a.signature(), c.signature());
    }
}
