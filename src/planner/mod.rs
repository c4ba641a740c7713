//! Planning module.
//!
//! This module refreshes recorded state against the providers, compares it
//! with the desired instances, and executes the resulting plans.

mod diff;
mod executor;
mod plan;
mod refresh;

pub use diff::{DiffEngine, ValueChange, value_changes};
pub use executor::{
    ApplyCounts, ApplyExecutor, ApplyReport, CancellationHandle, CancellationSignal,
    DEFAULT_OPERATION_TIMEOUT, DEFAULT_PARALLELISM, StepOutcome, StepReport, cancellation,
};
pub use plan::{
    ActionKind, AttributeChange, Plan, PlanMode, PlanStep, PlanSummary, PlannedAction,
    StepOperation,
};
pub use refresh::{DriftEntry, DriftKind, RefreshOutcome, refresh_snapshot};
