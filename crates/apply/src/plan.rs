//! Read-only preview of what an apply would do, with per-node diff counts.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use keel_core::{BuildError, NodeId, ObjectGraph};
use keel_kubehub::{body_drifted, render_manifest, served_form, strip_noisy, ClusterClient, ClusterError, ObjectKey};

use crate::reconcile::order;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlannedAction {
    Create,
    Update,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub id: NodeId,
    pub action: PlannedAction,
    pub summary: DiffSummary,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("reading {key}: {source}")]
    Cluster { key: String, source: ClusterError },
}

/// Count leaf-level differences of `target` relative to `base`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Compare every node against the live object, in apply order. Nothing is mutated.
pub async fn plan(graph: &ObjectGraph, cluster: &dyn ClusterClient) -> Result<Vec<PlannedChange>, PlanError> {
    let ns = graph.instance.namespace.as_str();
    let mut out = Vec::with_capacity(graph.len());
    for id in order(graph)? {
        let Some(node) = graph.get(&id) else { continue };
        let key = ObjectKey::of(ns, &id);
        let live = cluster.get(&key).await.map_err(|source| PlanError::Cluster { key: key.to_string(), source })?;
        let target = strip_noisy(served_form(render_manifest(ns, node)));
        let change = match live {
            None => PlannedChange { id, action: PlannedAction::Create, summary: diff_summary(&target, &Json::Null) },
            Some(l) if l.signature.as_deref() == Some(node.signature().as_str()) && !body_drifted(ns, node, &l.manifest) => {
                PlannedChange { id, action: PlannedAction::Unchanged, summary: DiffSummary::default() }
            }
            Some(l) => PlannedChange { id, action: PlannedAction::Update, summary: diff_summary(&target, &strip_noisy(l.manifest)) },
        };
        out.push(change);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn diff_against_nothing_is_one_update() {
        let target = serde_json::json!({ "a": 1 });
        assert_eq!(diff_summary(&target, &Json::Null).updates, 1);
    }
}
