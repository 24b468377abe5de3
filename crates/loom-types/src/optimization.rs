//! Optimization candidates and replay results.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizationKind {
    /// Output used by nothing downstream and not mapped to the workflow output.
    DeadTask,
    /// Run a filter ahead of the map step feeding it.
    FilterBeforeMap,
    /// Merge adjacent pure transforms into one invocation.
    TransformFusion,
    /// Drop a declared dependency that carries no data.
    ParallelPromotion,
}

impl fmt::Display for OptimizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OptimizationKind::DeadTask => "dead-task",
            OptimizationKind::FilterBeforeMap => "filter-before-map",
            OptimizationKind::TransformFusion => "transform-fusion",
            OptimizationKind::ParallelPromotion => "parallel-promotion",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    NeedsVerification,
    Unsafe,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatedImpact {
    pub invocations_saved: u32,
    /// Reduction of the critical path, in dependency levels.
    pub levels_saved: u32,
}

/// Facts gathered at detection time that the safety rules read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEvidence {
    /// Registered usages of the target step's output.
    pub external_usages: u32,
    pub touches_side_effects: bool,
    pub all_pure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationCandidate {
    pub kind: OptimizationKind,
    pub target_step: String,
    /// Other steps the rewrite touches (the map step, the fused partner, the
    /// dropped dependency).
    pub related_steps: Vec<String>,
    pub description: String,
    pub estimated_impact: EstimatedImpact,
    pub evidence: CandidateEvidence,
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOptions {
    /// Volatile fields skipped during comparison (key name or dotted path).
    #[serde(default)]
    pub ignore_fields: Vec<String>,
    /// Echo resolved inputs instead of invoking real tasks.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub execution_id: Uuid,
    /// The task whose output differed, or `$output` / `$status`.
    pub task_ref: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResult {
    /// matches / total (1.0 when nothing was replayed).
    pub confidence_score: f64,
    pub total: u32,
    pub matches: u32,
    pub mismatches: Vec<Mismatch>,
    /// Mean of (candidate - original) run duration, in milliseconds.
    pub average_time_delta_ms: f64,
    pub dry_run: bool,
}
