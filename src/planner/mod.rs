//! Planning and execution.
//!
//! Planning compares the prior and desired graphs, propagates replacements
//! to dependents, and orders the resulting steps. Execution runs those steps
//! against a provider, recording each one in the snapshot.

mod cascade;
mod diff;
mod executor;
mod fingerprint;
mod plan;

pub use cascade::ReplacementCascade;
pub use diff::{DiffClassifier, DiffKind, DiffSet, PropertyChange, ResourceDiff};
pub use executor::{
    ApplyOptions, ApplyReport, CancelSignal, StepExecutor, StepOutcome, StepStatus, DEFAULT_CONCURRENCY,
};
pub use fingerprint::PlanHasher;
pub use plan::{Plan, PlanBuilder, PlanSummary, Step, StepOp};
