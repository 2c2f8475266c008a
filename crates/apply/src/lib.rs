//! Keel apply: dependency orderer, reconciler and read-only plan.

#![forbid(unsafe_code)]

mod plan;
mod reconcile;
mod retry;

pub use plan::{diff_summary, plan, DiffSummary, PlanError, PlannedAction, PlannedChange};
pub use reconcile::{order, Reconciler};
pub use retry::RetryConfig;
