//! Static analysis over registered workflows.
//!
//! - `usage` -- per-step task usage and the concurrent usage registry
//! - `blast_radius` -- transitive impact of a change to one task
//! - `optimizer` -- optimization candidates, safety rating, rewriting
//! - `equivalence` -- field-by-field comparison of two runs
//! - `replay` -- historical-input replay of an original vs. candidate workflow

pub mod blast_radius;
pub mod equivalence;
pub mod optimizer;
pub mod replay;
pub mod usage;

pub use equivalence::{IgnoreSet, compare_runs, first_difference};
pub use optimizer::{
    OptimizationAnalyzer, OptimizationError, Purity, apply_optimization,
    assess_optimization_safety, purity,
};
pub use replay::{ReplayEngine, ReplayError, apply_task_map};
pub use usage::{DependencyTracker, analyze_workflow};
