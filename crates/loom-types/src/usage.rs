//! Task usage and blast-radius records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowKey;

/// Whether a step references a leaf task or a nested workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Task,
    Workflow,
}

/// How one step of a workflow uses the task it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUsage {
    pub step_id: String,
    /// The referenced task name, or `namespace/name` for a workflow.
    pub task_name: String,
    pub kind: RefKind,
    /// Input keys the workflow passes to the task.
    pub used_input_fields: BTreeSet<String>,
    /// Output fields of this step read elsewhere in the workflow.
    pub used_output_fields: BTreeSet<String>,
    /// Step ids that read this step's output.
    pub consumers: BTreeSet<String>,
    /// The workflow's output mapping reads this step.
    pub in_output_mapping: bool,
    /// Steps that transitively depend on this one.
    pub downstream: BTreeSet<String>,
}

/// Recorded in `used_output_fields` when a consumer reads the whole output.
pub const WHOLE_OUTPUT: &str = "*";

impl TaskUsage {
    /// A consumer reading the whole output uses every field.
    pub fn uses_field(&self, field: &str) -> bool {
        self.used_input_fields.contains(field)
            || self.used_output_fields.contains(field)
            || self.used_output_fields.contains(WHOLE_OUTPUT)
    }
}

/// Aggregated view of how one task is used across registered workflows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub task: String,
    pub workflows: BTreeSet<WorkflowKey>,
    /// field -> workflows using it
    pub fields: BTreeMap<String, BTreeSet<WorkflowKey>>,
    /// workflow -> number of steps referencing the task
    pub usage_counts: BTreeMap<WorkflowKey, u32>,
}

// ---------------------------------------------------------------------------
// Blast radius
// ---------------------------------------------------------------------------

/// Identity of a node in the impact graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ImpactNodeId {
    Task(String),
    Workflow(WorkflowKey),
    /// A step inside an affected workflow.
    Step { workflow: WorkflowKey, step_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactNode {
    pub id: ImpactNodeId,
    pub depth: u32,
    pub is_source: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactRelation {
    /// `from` is used by the workflow `to`.
    UsedBy,
    /// The workflow `from` contains the affected step `to`.
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactEdge {
    pub from: ImpactNodeId,
    pub to: ImpactNodeId,
    pub relation: ImpactRelation,
}

/// Workflows and steps first reached at one depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub depth: u32,
    pub workflows: Vec<WorkflowKey>,
    /// Affected steps as `namespace/workflow:step`.
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastRadiusResult {
    pub source_task: String,
    pub max_depth: u32,
    pub truncated_at_depth: bool,
    pub depths: Vec<DepthLevel>,
    pub nodes: Vec<ImpactNode>,
    pub edges: Vec<ImpactEdge>,
}

impl BlastRadiusResult {
    /// Every affected workflow across all depths.
    pub fn affected_workflows(&self) -> BTreeSet<WorkflowKey> {
        self.depths
            .iter()
            .flat_map(|d| d.workflows.iter().cloned())
            .collect()
    }
}
