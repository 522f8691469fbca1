//! Change-log reconciliation.
//!
//! A single periodic task replays the shared change log into the local
//! caches, falling back to a full reload of every dataset after repeated
//! failures.

mod coalesce;
mod planner;
mod reconciler;

pub use planner::{ReplayPlan, ReplayStep};
pub use reconciler::{
    CycleOutcome, Reconciler, ReconcilerConfig, ReconcilerHandle, ReconcilerState, ReplaySummary,
    aligned_delay,
};
