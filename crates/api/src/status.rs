//! Status sub-resource write-back.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use keel_core::{InstanceId, OutcomeCounts, ProductKind, ProductStatus, ReconciliationResult};
use keel_kubehub::{ClusterClient, ClusterError};

/// Attempts per report when the cluster answers 409.
pub const STATUS_CONFLICT_RETRIES: u32 = 5;

/// Body merged into `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductStatusReport {
    pub phase: ProductStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    pub counts: OutcomeCounts,
    /// RFC 3339, UTC.
    pub updated_at: String,
}

impl ProductStatusReport {
    pub fn new(phase: ProductStatus, message: Option<String>, observed_generation: Option<i64>, counts: OutcomeCounts) -> Self {
        Self {
            phase,
            message,
            observed_generation,
            counts,
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn from_result(result: &ReconciliationResult, observed_generation: Option<i64>) -> Self {
        Self::new(result.status, result.first_error(), observed_generation, result.counts())
    }
}

/// Latest-wins status publisher running in its own task.
///
/// Reports submitted while a patch is in flight collapse to the newest one.
pub struct StatusWriter {
    tx: watch::Sender<Option<ProductStatusReport>>,
    join: JoinHandle<()>,
}

impl StatusWriter {
    pub fn spawn(cluster: Arc<dyn ClusterClient>, kind: ProductKind, instance: InstanceId) -> Self {
        let (tx, mut rx) = watch::channel::<Option<ProductStatusReport>>(None);
        let join = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let report = rx.borrow_and_update().clone();
                if let Some(report) = report {
                    write_status(cluster.as_ref(), kind, &instance, &report).await;
                }
            }
            debug!(instance = %instance, "status writer stopped");
        });
        Self { tx, join }
    }

    pub fn publish(&self, report: ProductStatusReport) {
        // Only fails once the task is gone, which means shutdown.
        let _ = self.tx.send(Some(report));
    }

    /// Drop the sender and wait for the last queued report to be written.
    pub async fn close(self) {
        let Self { tx, join } = self;
        drop(tx);
        if let Err(e) = join.await {
            warn!(error = %e, "status writer task failed");
        }
    }
}

/// Merge-patch `status`, retrying on conflict. Returns whether it landed.
pub async fn write_status(cluster: &dyn ClusterClient, kind: ProductKind, instance: &InstanceId, report: &ProductStatusReport) -> bool {
    let body = match serde_json::to_value(report) {
        Ok(v) => v,
        Err(e) => {
            warn!(instance = %instance, error = %e, "status not serializable");
            return false;
        }
    };
    for attempt in 1..=STATUS_CONFLICT_RETRIES {
        match cluster.patch_status(kind, instance, &body).await {
            Ok(()) => {
                counter!("status_writes_total", 1u64);
                debug!(instance = %instance, phase = %report.phase, attempt, "status written");
                return true;
            }
            Err(ClusterError::Conflict(reason)) => {
                counter!("status_conflicts_total", 1u64);
                debug!(instance = %instance, attempt, reason = %reason, "status conflict");
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "status write failed");
                return false;
            }
        }
    }
    warn!(instance = %instance, attempts = STATUS_CONFLICT_RETRIES, "status write kept conflicting");
    false
}
