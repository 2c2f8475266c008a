//! Keel store: product status aggregation and the per-instance status poller.
//!
//! The poller reads workload health on an interval, folds it through a
//! [`StatusAggregator`] and publishes the result two ways: the status over a
//! `watch` channel and a full [`HealthSnapshot`] behind an `ArcSwap`.
//!
//! Once the workloads an instance should run are known, the poller judges
//! against that list: an expected workload the cluster does not report counts
//! as not ready, and stray workloads outside it are ignored.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::{InstanceId, ProductKind, ProductStatus};
use keel_kubehub::{ClusterClient, WorkloadHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Consecutive failed observations before `Failed`.
    pub failure_threshold: u32,
    /// Minimum time since the first failed observation before `Failed`.
    pub grace: Duration,
}

impl Default for StatusPolicy {
    fn default() -> Self { Self { failure_threshold: 3, grace: Duration::from_secs(120) } }
}

impl StatusPolicy {
    /// `KEEL_FAILURE_THRESHOLD` and `KEEL_GRACE_SECS` override the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let failure_threshold = std::env::var("KEEL_FAILURE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(d.failure_threshold)
            .max(1);
        let grace = std::env::var("KEEL_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.grace);
        Self { failure_threshold, grace }
    }
}

/// One health read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Health(Vec<WorkloadHealth>),
    ReadError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: ProductStatus,
    pub workloads: Vec<WorkloadHealth>,
    pub consecutive_failures: u32,
    pub message: Option<String>,
    /// Unix seconds of the observation.
    pub observed_at: i64,
}

/// Folds health observations into a product status.
///
/// `Failed` needs both `failure_threshold` consecutive bad observations and
/// the grace window elapsed since the first of them. Any healthy workload
/// resets the failure run.
#[derive(Debug, Clone)]
pub struct StatusAggregator {
    policy: StatusPolicy,
    status: ProductStatus,
    consecutive_failures: u32,
    first_failure: Option<Instant>,
}

impl StatusAggregator {
    pub fn new(policy: StatusPolicy) -> Self {
        Self { policy, status: ProductStatus::Pending, consecutive_failures: 0, first_failure: None }
    }

    pub fn status(&self) -> ProductStatus { self.status }
    pub fn consecutive_failures(&self) -> u32 { self.consecutive_failures }

    pub fn observe(&mut self, obs: &Observation) -> ProductStatus { self.observe_at(obs, Instant::now()) }

    pub fn observe_at(&mut self, obs: &Observation, now: Instant) -> ProductStatus {
        let (healthy, total) = match obs {
            Observation::Health(ws) => (ws.iter().filter(|w| w.is_healthy()).count(), ws.len()),
            Observation::ReadError(_) => (0, 0),
        };
        self.status = if total > 0 && healthy == total {
            self.reset();
            ProductStatus::Ready
        } else if healthy > 0 {
            self.reset();
            ProductStatus::PartiallyReady
        } else {
            self.consecutive_failures += 1;
            let first = *self.first_failure.get_or_insert(now);
            let over_threshold = self.consecutive_failures >= self.policy.failure_threshold;
            if over_threshold && now.duration_since(first) >= self.policy.grace {
                ProductStatus::Failed
            } else {
                match self.status {
                    ProductStatus::Ready | ProductStatus::PartiallyReady => ProductStatus::PartiallyReady,
                    other => other,
                }
            }
        };
        self.status
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.first_failure = None;
    }
}

/// Workload names an instance is expected to run. Empty means not yet known.
pub type ExpectedWorkloads = Arc<ArcSwap<Vec<String>>>;

/// Judge `observed` against `expected`.
///
/// Returns one entry per expected name, in order, with absent workloads
/// reported as zero ready, plus the names that were absent. An empty
/// `expected` passes `observed` through.
pub fn against_expected(observed: Vec<WorkloadHealth>, expected: &[String]) -> (Vec<WorkloadHealth>, Vec<String>) {
    if expected.is_empty() {
        return (observed, Vec::new());
    }
    let mut missing = Vec::new();
    let judged = expected
        .iter()
        .map(|name| match observed.iter().find(|w| &w.name == name) {
            Some(w) => w.clone(),
            None => {
                missing.push(name.clone());
                WorkloadHealth::new(name.clone(), 1, 0)
            }
        })
        .collect();
    (judged, missing)
}

/// Reader side of a running poller.
pub struct StatusHandle {
    snap: Arc<ArcSwap<HealthSnapshot>>,
    expected: ExpectedWorkloads,
    status_rx: watch::Receiver<ProductStatus>,
    join: JoinHandle<()>,
}

impl StatusHandle {
    pub fn current(&self) -> Arc<HealthSnapshot> { self.snap.load_full() }
    /// Shared snapshot cell, for readers that outlive this handle.
    pub fn snapshot(&self) -> Arc<ArcSwap<HealthSnapshot>> { Arc::clone(&self.snap) }
    /// Shared expected-workload cell; later polls judge against what is stored here.
    pub fn expected(&self) -> ExpectedWorkloads { Arc::clone(&self.expected) }

    pub fn set_expected(&self, mut names: Vec<String>) {
        names.sort();
        names.dedup();
        self.expected.store(Arc::new(names));
    }
    pub fn subscribe(&self) -> watch::Receiver<ProductStatus> { self.status_rx.clone() }
    pub fn is_finished(&self) -> bool { self.join.is_finished() }

    /// Wait for the poller task to exit (after cancellation).
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(error = %e, "status poller task failed");
        }
    }
}

/// Poll workload health for `kind`/`instance` every `interval` until `cancel` fires.
pub fn spawn_status_poller(
    cluster: Arc<dyn ClusterClient>,
    kind: ProductKind,
    instance: InstanceId,
    policy: StatusPolicy,
    interval: Duration,
    cancel: CancellationToken,
) -> StatusHandle {
    let snap = Arc::new(ArcSwap::from_pointee(HealthSnapshot::default()));
    let (status_tx, status_rx) = watch::channel(ProductStatus::Pending);
    let snap_clone = Arc::clone(&snap);
    let expected: ExpectedWorkloads = Arc::new(ArcSwap::from_pointee(Vec::new()));
    let expected_clone = Arc::clone(&expected);

    let join = tokio::spawn(async move {
        let mut agg = StatusAggregator::new(policy);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let (obs, workloads, message) = match cluster.workload_health(kind, &instance).await {
                Ok(observed) => {
                    let (ws, missing) = against_expected(observed, &expected_clone.load_full());
                    if !missing.is_empty() {
                        counter!("status_missing_workloads_total", missing.len() as u64);
                    }
                    let not_ready: Vec<String> = ws
                        .iter()
                        .filter(|w| !w.is_healthy())
                        .map(|w| if missing.contains(&w.name) { format!("{} (missing)", w.name) } else { w.name.clone() })
                        .collect();
                    let message = (!not_ready.is_empty()).then(|| format!("waiting for {}", not_ready.join(", ")));
                    (Observation::Health(ws.clone()), ws, message)
                }
                Err(e) => {
                    counter!("status_read_errors_total", 1u64);
                    debug!(instance = %instance, error = %e, "health read failed");
                    (Observation::ReadError(e.to_string()), Vec::new(), Some(format!("health read failed: {}", e)))
                }
            };
            let before = agg.status();
            let status = agg.observe(&obs);
            if status != before {
                info!(instance = %instance, from = %before, to = %status, "product status changed");
            }
            snap_clone.store(Arc::new(HealthSnapshot {
                status,
                workloads,
                consecutive_failures: agg.consecutive_failures(),
                message,
                observed_at: chrono::Utc::now().timestamp(),
            }));
            status_tx.send_if_modified(|cur| {
                let changed = *cur != status;
                *cur = status;
                changed
            });
        }
        debug!(instance = %instance, "status poller stopped");
    });

    StatusHandle { snap, expected, status_rx, join }
}
