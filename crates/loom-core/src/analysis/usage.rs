//! Static usage analysis and the per-workflow usage registry.
//!
//! `analyze_workflow` scans a definition's templates and expressions to find
//! which inputs each step passes to its task and which of its output fields
//! are read elsewhere. `DependencyTracker` keeps the latest analysis per
//! workflow and answers "who uses this task / field" queries from it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use loom_types::usage::{RefKind, TaskUsage, UsageRecord, WHOLE_OUTPUT};
use loom_types::workflow::{StepControl, StepTarget, TaskStep, WorkflowDefinition, WorkflowKey};

use crate::workflow::context::{TemplateRef, scan_refs, scan_str};

// ---------------------------------------------------------------------------
// Static analysis
// ---------------------------------------------------------------------------

/// Every template reference a step makes, from its input and its control.
pub(crate) fn step_refs(step: &TaskStep) -> Vec<TemplateRef> {
    let mut refs = Vec::new();
    for value in step.input.values() {
        refs.extend(scan_refs(value));
    }
    match &step.control {
        Some(StepControl::When(expression)) => refs.extend(scan_str(expression)),
        Some(StepControl::Switch(switch)) => refs.extend(scan_str(&switch.on)),
        Some(StepControl::ForEach(each)) => refs.extend(scan_str(&each.items)),
        None => {}
    }
    refs
}

/// Step ids whose output `step` reads.
pub(crate) fn read_steps(step: &TaskStep) -> BTreeSet<String> {
    step_refs(step)
        .into_iter()
        .filter_map(|r| match r {
            TemplateRef::TaskOutput { step_id, .. } => Some(step_id),
            _ => None,
        })
        .collect()
}

/// Every task or workflow a step may invoke, switch cases included.
fn step_targets(step: &TaskStep, namespace: &str) -> Vec<(String, RefKind)> {
    let name = |reference: &str| match step.target {
        StepTarget::Task(_) => (reference.to_string(), RefKind::Task),
        StepTarget::Workflow(_) => (
            WorkflowKey::resolve_ref(reference, namespace).to_string(),
            RefKind::Workflow,
        ),
    };

    let mut targets = vec![name(step.target.reference())];
    if let Some(StepControl::Switch(switch)) = &step.control {
        for reference in switch.cases.values().chain(switch.default.iter()) {
            let target = name(reference);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}

/// Steps that transitively depend on `id`. Tolerates cycles.
fn downstream_of(workflow: &WorkflowDefinition, id: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut stack = vec![id.to_string()];
    while let Some(current) = stack.pop() {
        for step in &workflow.steps {
            if step.depends_on.iter().any(|d| *d == current) && found.insert(step.id.clone()) {
                stack.push(step.id.clone());
            }
        }
    }
    found.remove(id);
    found
}

/// Fields read from one step's output and the steps reading them.
type Reads = (BTreeSet<String>, BTreeSet<String>);

fn record_read<'a>(
    workflow: &'a WorkflowDefinition,
    reads: &mut HashMap<&'a str, Reads>,
    step_id: &str,
    path: &[String],
    consumer: Option<&str>,
) {
    let Some(producer) = workflow.step(step_id) else {
        return;
    };
    let entry = reads.entry(producer.id.as_str()).or_default();
    entry.0.insert(
        path.first()
            .cloned()
            .unwrap_or_else(|| WHOLE_OUTPUT.to_string()),
    );
    if let Some(consumer) = consumer {
        entry.1.insert(consumer.to_string());
    }
}

/// Usage of every task referenced by `workflow`, one entry per (step, target).
///
/// Works on definitions that do not build into a graph; unknown or cyclic
/// dependencies only make `downstream` less precise.
pub fn analyze_workflow(workflow: &WorkflowDefinition) -> Vec<TaskUsage> {
    let mut reads: HashMap<&str, Reads> = HashMap::new();
    let mut mapped: BTreeSet<String> = BTreeSet::new();

    for step in &workflow.steps {
        for r in step_refs(step) {
            if let TemplateRef::TaskOutput { step_id, path } = r {
                record_read(workflow, &mut reads, &step_id, &path, Some(&step.id));
            }
        }
    }
    for expression in workflow.output.values() {
        for r in scan_str(expression) {
            if let TemplateRef::TaskOutput { step_id, path } = r {
                record_read(workflow, &mut reads, &step_id, &path, None);
                mapped.insert(step_id);
            }
        }
    }

    let mut usages = Vec::new();
    for step in &workflow.steps {
        let (fields, consumers) = reads.get(step.id.as_str()).cloned().unwrap_or_default();
        let downstream = downstream_of(workflow, &step.id);
        for (task_name, kind) in step_targets(step, &workflow.namespace) {
            usages.push(TaskUsage {
                step_id: step.id.clone(),
                task_name,
                kind,
                used_input_fields: step.input.keys().cloned().collect(),
                used_output_fields: fields.clone(),
                consumers: consumers.clone(),
                in_output_mapping: mapped.contains(&step.id),
                downstream: downstream.clone(),
            });
        }
    }
    usages
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent registry of task usage, keyed by workflow.
///
/// Registration replaces the previous entry for the same workflow (last
/// writer wins). Cloning yields a shared view of the same registry. Reads
/// clone out of the map so no `DashMap` guard outlives a call.
#[derive(Debug, Clone, Default)]
pub struct DependencyTracker {
    usages: Arc<DashMap<WorkflowKey, Vec<TaskUsage>>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analyze_workflow(&self, workflow: &WorkflowDefinition) -> Vec<TaskUsage> {
        analyze_workflow(workflow)
    }

    pub fn register_usage(&self, workflow: WorkflowKey, usages: Vec<TaskUsage>) {
        tracing::debug!(workflow = %workflow, entries = usages.len(), "registering task usage");
        self.usages.insert(workflow, usages);
    }

    /// Analyze and register in one step.
    pub fn register_workflow(&self, workflow: &WorkflowDefinition) -> Vec<TaskUsage> {
        let usages = analyze_workflow(workflow);
        self.register_usage(workflow.key(), usages.clone());
        usages
    }

    /// Returns `true` if the workflow was registered.
    pub fn unregister(&self, workflow: &WorkflowKey) -> bool {
        self.usages.remove(workflow).is_some()
    }

    pub fn usages(&self, workflow: &WorkflowKey) -> Option<Vec<TaskUsage>> {
        self.usages.get(workflow).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.usages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usages.is_empty()
    }

    /// A consistent-enough copy of the whole registry, sorted by workflow.
    pub fn snapshot(&self) -> BTreeMap<WorkflowKey, Vec<TaskUsage>> {
        self.usages
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Workflows with at least one step referencing `task`.
    pub fn get_affected_workflows(&self, task: &str) -> BTreeSet<WorkflowKey> {
        self.workflows_matching(|u| u.kind == RefKind::Task && u.task_name == task)
    }

    /// Workflows that call `workflow` as a sub-workflow.
    pub fn get_parent_workflows(&self, workflow: &WorkflowKey) -> BTreeSet<WorkflowKey> {
        let name = workflow.to_string();
        self.workflows_matching(|u| u.kind == RefKind::Workflow && u.task_name == name)
    }

    pub fn get_workflows_using_field(&self, task: &str, field: &str) -> BTreeSet<WorkflowKey> {
        self.workflows_matching(|u| {
            u.kind == RefKind::Task && u.task_name == task && u.uses_field(field)
        })
    }

    pub fn is_field_removal_safe(&self, task: &str, field: &str) -> bool {
        self.get_workflows_using_field(task, field).is_empty()
    }

    /// Aggregated usage of `task` across every registered workflow.
    pub fn usage_record(&self, task: &str) -> UsageRecord {
        let mut record = UsageRecord {
            task: task.to_string(),
            ..UsageRecord::default()
        };
        for entry in self.usages.iter() {
            for usage in entry
                .value()
                .iter()
                .filter(|u| u.kind == RefKind::Task && u.task_name == task)
            {
                record.workflows.insert(entry.key().clone());
                *record.usage_counts.entry(entry.key().clone()).or_insert(0) += 1;
                for field in usage.used_input_fields.iter().chain(&usage.used_output_fields) {
                    record
                        .fields
                        .entry(field.clone())
                        .or_default()
                        .insert(entry.key().clone());
                }
            }
        }
        record
    }

    fn workflows_matching(&self, matches: impl Fn(&TaskUsage) -> bool) -> BTreeSet<WorkflowKey> {
        self.usages
            .iter()
            .filter(|e| e.value().iter().any(&matches))
            .map(|e| e.key().clone())
            .collect()
    }
}
