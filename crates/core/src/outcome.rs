//! Per-node reconciliation outcomes and the aggregate product status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::NodeId;
use crate::spec::InstanceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOutcome {
    Created,
    Updated,
    Unchanged,
    Failed { error: String },
    /// A dependency failed or was itself blocked.
    Blocked { by: NodeId },
    /// Not attempted because the reconciliation was cancelled.
    Skipped,
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Created | NodeOutcome::Updated | NodeOutcome::Unchanged)
    }

    pub fn is_failure(&self) -> bool { matches!(self, NodeOutcome::Failed { .. } | NodeOutcome::Blocked { .. }) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub id: NodeId,
    pub outcome: NodeOutcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProductStatus {
    #[default]
    Pending,
    PartiallyReady,
    Ready,
    Failed,
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProductStatus::Pending => "Pending",
            ProductStatus::PartiallyReady => "PartiallyReady",
            ProductStatus::Ready => "Ready",
            ProductStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub instance: InstanceId,
    /// In apply order.
    pub nodes: Vec<NodeResult>,
    pub status: ProductStatus,
}

impl ReconciliationResult {
    pub fn outcome(&self, id: &NodeId) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|r| &r.id == id).map(|r| &r.outcome)
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut c = OutcomeCounts::default();
        for r in self.nodes.iter() {
            match r.outcome {
                NodeOutcome::Created => c.created += 1,
                NodeOutcome::Updated => c.updated += 1,
                NodeOutcome::Unchanged => c.unchanged += 1,
                NodeOutcome::Failed { .. } => c.failed += 1,
                NodeOutcome::Blocked { .. } => c.blocked += 1,
                NodeOutcome::Skipped => c.skipped += 1,
            }
        }
        c
    }

    pub fn has_failures(&self) -> bool { self.nodes.iter().any(|r| r.outcome.is_failure()) }

    /// First failure message, used as the status message.
    pub fn first_error(&self) -> Option<String> {
        self.nodes.iter().find_map(|r| match &r.outcome {
            NodeOutcome::Failed { error } => Some(format!("{}: {}", r.id, error)),
            _ => None,
        })
    }
}
