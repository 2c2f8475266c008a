//! Per-instance supervisor: coalescing reconcile queue, status poller and status write-back.
//!
//! Each instance runs one task. Submissions land in a `watch` slot, so while a
//! pass is in flight any number of newer specs collapse to the latest one and
//! exactly one follow-up pass runs. A submission whose generation matches the
//! queued spec is dropped, so status write-backs echoing through the watch do
//! not start passes. Deleting the instance cancels its token: the in-flight
//! pass skips its remaining nodes and the poller stops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use keel_core::{InstanceId, ObjectKind, OutcomeCounts, ProductKind, ProductSpec, ProductStatus, ReconciliationResult};
use keel_persist::SignatureCache;
use keel_store::{spawn_status_poller, ExpectedWorkloads, HealthSnapshot, StatusHandle, StatusPolicy};

use crate::pipeline::Pipeline;
use crate::status::{ProductStatusReport, StatusWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub status_policy: StatusPolicy,
    pub status_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self { Self { status_policy: StatusPolicy::default(), status_interval: Duration::from_secs(15) } }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct PassRecord {
    /// 1-based pass number for this instance.
    pub seq: u64,
    pub generation: Option<i64>,
    pub result: Result<ReconciliationResult, String>,
}

pub struct Supervisor {
    instance: InstanceId,
    kind: ProductKind,
    queue: watch::Sender<Option<ProductSpec>>,
    passes: watch::Receiver<Option<Arc<PassRecord>>>,
    cancel: CancellationToken,
    poller: StatusHandle,
    join: JoinHandle<()>,
}

impl Supervisor {
    /// Start the instance loop and queue a first pass for `spec`.
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        cache: Box<dyn SignatureCache>,
        spec: ProductSpec,
        config: SupervisorConfig,
    ) -> Self {
        let instance = spec.id.clone();
        let kind = spec.product;
        let cancel = CancellationToken::new();
        let poller = spawn_status_poller(
            pipeline.cluster(),
            kind,
            instance.clone(),
            config.status_policy,
            config.status_interval,
            cancel.child_token(),
        );
        let (queue, queue_rx) = watch::channel(None);
        let _ = queue.send(Some(spec));
        let (passes_tx, passes) = watch::channel(None);
        let writer = StatusWriter::spawn(pipeline.cluster(), kind, instance.clone());

        let state = LoopState {
            pipeline,
            cache,
            instance: instance.clone(),
            cancel: cancel.clone(),
            writer,
            passes: passes_tx,
            health: poller.subscribe(),
            snapshot: poller.snapshot(),
            expected: poller.expected(),
            last_counts: OutcomeCounts::default(),
            last_generation: None,
            apply_failed: false,
            seq: 0,
        };
        let join = tokio::spawn(run_loop(state, queue_rx));
        info!(instance = %instance, product = %kind, "supervisor started");
        Self { instance, kind, queue, passes, cancel, poller, join }
    }

    pub fn instance(&self) -> &InstanceId { &self.instance }
    pub fn kind(&self) -> ProductKind { self.kind }

    /// Replace the desired spec. Coalesces with anything not yet started.
    ///
    /// Returns false, and queues nothing, when `spec` carries the generation
    /// already queued (or equals it outright when there is no generation).
    pub fn submit(&self, spec: ProductSpec) -> bool {
        if self.cancel.is_cancelled() {
            debug!(instance = %self.instance, "submit after delete ignored");
            return false;
        }
        let queued = self.queue.send_if_modified(|cur| {
            if cur.as_ref().is_some_and(|c| same_desired(c, &spec)) {
                return false;
            }
            *cur = Some(spec);
            true
        });
        if !queued {
            counter!("supervisor_unchanged_submits_total", 1u64);
            debug!(instance = %self.instance, "desired spec unchanged; no pass queued");
        }
        queued
    }

    /// Re-run the current spec.
    pub fn resync(&self) {
        if !self.cancel.is_cancelled() {
            self.queue.send_modify(|_| {});
        }
    }

    /// Stop reconciling: the in-flight pass skips its remaining nodes and the poller stops.
    pub fn delete(&self) {
        info!(instance = %self.instance, "instance deleted; cancelling");
        self.cancel.cancel();
    }

    pub fn is_deleted(&self) -> bool { self.cancel.is_cancelled() }

    pub fn passes(&self) -> watch::Receiver<Option<Arc<PassRecord>>> { self.passes.clone() }
    pub fn health(&self) -> Arc<HealthSnapshot> { self.poller.current() }
    pub fn status(&self) -> ProductStatus { *self.poller.subscribe().borrow() }

    /// Cancel and wait for the loop and poller to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(instance = %self.instance, error = %e, "supervisor task failed");
        }
        self.poller.join().await;
    }
}

fn same_desired(queued: &ProductSpec, next: &ProductSpec) -> bool {
    match (queued.generation, next.generation) {
        (Some(a), Some(b)) => a == b,
        _ => queued == next,
    }
}

struct LoopState {
    pipeline: Arc<Pipeline>,
    cache: Box<dyn SignatureCache>,
    instance: InstanceId,
    cancel: CancellationToken,
    writer: StatusWriter,
    passes: watch::Sender<Option<Arc<PassRecord>>>,
    health: watch::Receiver<ProductStatus>,
    snapshot: Arc<ArcSwap<HealthSnapshot>>,
    expected: ExpectedWorkloads,
    last_counts: OutcomeCounts,
    last_generation: Option<i64>,
    apply_failed: bool,
    seq: u64,
}

async fn run_loop(mut st: LoopState, mut queue: watch::Receiver<Option<ProductSpec>>) {
    let mut health_open = true;
    loop {
        tokio::select! {
            biased;
            _ = st.cancel.cancelled() => break,
            changed = queue.changed() => {
                if changed.is_err() {
                    break;
                }
                let spec = queue.borrow_and_update().clone();
                if let Some(spec) = spec {
                    st.run_pass(&spec).await;
                }
            }
            changed = st.health.changed(), if health_open => {
                if changed.is_err() {
                    // Poller gone; keep serving the queue.
                    health_open = false;
                    continue;
                }
                let status = *st.health.borrow_and_update();
                st.publish_health(status);
            }
        }
    }
    st.writer.close().await;
    debug!(instance = %st.instance, "supervisor loop stopped");
}

impl LoopState {
    async fn run_pass(&mut self, spec: &ProductSpec) {
        self.seq += 1;
        let pass_id = Uuid::new_v4();
        let started = Instant::now();
        debug!(instance = %self.instance, seq = self.seq, %pass_id, "reconcile pass starting");
        counter!("supervisor_passes_total", 1u64);

        let result = self.pipeline.reconcile(spec, self.cache.as_ref(), &self.cancel).await;
        histogram!("supervisor_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
        self.last_generation = spec.generation;

        let record = match result {
            Ok(result) => {
                self.apply_failed = result.has_failures();
                self.last_counts = result.counts();
                if !self.cancel.is_cancelled() {
                    let mut names: Vec<String> =
                        result.nodes.iter().filter(|n| n.id.kind == ObjectKind::Workload).map(|n| n.id.name.clone()).collect();
                    names.sort();
                    self.expected.store(Arc::new(names));
                    let mut report = ProductStatusReport::from_result(&result, spec.generation);
                    if !self.apply_failed {
                        // Health decides from here on; keep any status it already has.
                        let health = *self.health.borrow();
                        if health != ProductStatus::Pending {
                            report.phase = health;
                        }
                    }
                    self.writer.publish(report);
                }
                info!(instance = %self.instance, seq = self.seq, %pass_id, status = %result.status, "reconcile pass done");
                Ok(result)
            }
            Err(e) => {
                counter!("supervisor_pass_errors_total", 1u64);
                warn!(instance = %self.instance, seq = self.seq, %pass_id, error = %e, "reconcile pass failed");
                self.apply_failed = true;
                self.last_counts = OutcomeCounts::default();
                if !self.cancel.is_cancelled() {
                    self.writer.publish(ProductStatusReport::new(
                        ProductStatus::Failed,
                        Some(e.to_string()),
                        spec.generation,
                        OutcomeCounts::default(),
                    ));
                }
                Err(e.to_string())
            }
        };
        let _ = self.passes.send(Some(Arc::new(PassRecord { seq: self.seq, generation: spec.generation, result: record })));
    }

    fn publish_health(&self, status: ProductStatus) {
        if self.apply_failed || self.cancel.is_cancelled() {
            return;
        }
        let message = self.snapshot.load().message.clone();
        self.writer.publish(ProductStatusReport::new(status, message, self.last_generation, self.last_counts));
    }
}
