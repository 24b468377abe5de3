//! Graph optimization candidates, their static safety rating, and rewriting.
//!
//! Detection reads the built graph plus static usage analysis. Purity is a
//! heuristic over category labels (see [`purity`]), not a proof: a task named
//! `transform-*` that writes somewhere will be misjudged.

use loom_types::optimization::{
    CandidateEvidence, EstimatedImpact, OptimizationCandidate, OptimizationKind, SafetyLevel,
};
use loom_types::usage::TaskUsage;
use loom_types::workflow::{TaskStep, WorkflowDefinition};
use thiserror::Error;

use crate::workflow::graph::{ExecutionGraph, GraphErrors, build_graph};

use super::usage::{DependencyTracker, analyze_workflow, read_steps};

#[derive(Debug, Error)]
pub enum OptimizationError {
    #[error("'{kind}' on step '{step}' is rated unsafe; applying it needs an explicit override")]
    UnsafeWithoutOverride {
        kind: OptimizationKind,
        step: String,
    },

    #[error("'{0}' cannot be applied automatically; rewrite the definition by hand")]
    ManualRewriteRequired(OptimizationKind),

    #[error("step '{0}' not found in workflow")]
    UnknownStep(String),

    #[error("rewrite produced an invalid graph: {0}")]
    Graph(#[from] GraphErrors),
}

// ---------------------------------------------------------------------------
// Purity heuristic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purity {
    Pure,
    SideEffecting,
    Unknown,
}

const PURE: &[&str] = &["filter", "map", "transform", "format", "parse", "validate"];
const SIDE_EFFECTING: &[&str] = &["http", "write", "notify", "send", "delete", "publish", "email"];

/// The step's category label, else the leading word of its target reference.
pub fn category(step: &TaskStep) -> String {
    match &step.category {
        Some(label) => label.to_lowercase(),
        None => step
            .target
            .reference()
            .split(|c: char| !c.is_alphanumeric())
            .next()
            .unwrap_or_default()
            .to_lowercase(),
    }
}

/// Sub-workflows are never assumed pure.
pub fn purity(step: &TaskStep) -> Purity {
    if step.target.is_workflow() {
        return Purity::Unknown;
    }
    let category = category(step);
    if PURE.contains(&category.as_str()) {
        Purity::Pure
    } else if SIDE_EFFECTING.contains(&category.as_str()) {
        Purity::SideEffecting
    } else {
        Purity::Unknown
    }
}

fn evidence(steps: &[&TaskStep], external_usages: u32) -> CandidateEvidence {
    CandidateEvidence {
        external_usages,
        touches_side_effects: steps.iter().any(|s| purity(s) == Purity::SideEffecting),
        all_pure: steps.iter().all(|s| purity(s) == Purity::Pure),
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Finds optimization candidates in workflow graphs.
///
/// The tracker supplies cross-workflow facts: a workflow whose callers read
/// all of its step outputs has no dead steps.
#[derive(Debug, Clone, Default)]
pub struct OptimizationAnalyzer {
    tracker: DependencyTracker,
}

impl OptimizationAnalyzer {
    pub fn new(tracker: DependencyTracker) -> Self {
        Self { tracker }
    }

    pub fn analyze(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<Vec<OptimizationCandidate>, GraphErrors> {
        let graph = build_graph(workflow)?;
        let usages = analyze_workflow(workflow);

        // Callers of a workflow without an output mapping receive every step output.
        let external = if workflow.output.is_empty() {
            self.tracker.get_parent_workflows(&workflow.key()).len() as u32
        } else {
            0
        };

        let mut candidates = Vec::new();
        candidates.extend(dead_tasks(workflow, &graph, &usages, external));
        candidates.extend(filters_after_maps(workflow, &usages));
        candidates.extend(fusible_transforms(workflow, &graph));
        candidates.extend(parallel_promotions(workflow, &graph));

        tracing::debug!(workflow = %workflow.key(), candidates = candidates.len(), "optimization analysis finished");
        Ok(candidates)
    }
}

fn usage_of<'a>(usages: &'a [TaskUsage], step_id: &str) -> Option<&'a TaskUsage> {
    usages.iter().find(|u| u.step_id == step_id)
}

fn dead_tasks(
    workflow: &WorkflowDefinition,
    graph: &ExecutionGraph,
    usages: &[TaskUsage],
    external: u32,
) -> Vec<OptimizationCandidate> {
    let fallbacks = workflow.fallback_only_steps();
    workflow
        .steps
        .iter()
        .filter(|step| !fallbacks.contains(step.id.as_str()))
        .filter(|step| {
            usage_of(usages, &step.id).is_some_and(|u| u.consumers.is_empty() && !u.in_output_mapping)
        })
        .map(|step| {
            let last_level = graph.dependents(&step.id).is_empty()
                && graph.level(&step.id) == graph.parallel_groups().len().checked_sub(1)
                && graph.parallel_groups().last().is_some_and(|g| g.len() == 1);
            OptimizationCandidate {
                kind: OptimizationKind::DeadTask,
                target_step: step.id.clone(),
                related_steps: graph.dependents(&step.id).into_iter().map(str::to_string).collect(),
                description: format!(
                    "output of '{}' is read by no step and not mapped to the workflow output",
                    step.id
                ),
                estimated_impact: EstimatedImpact {
                    invocations_saved: 1,
                    levels_saved: u32::from(last_level),
                },
                evidence: evidence(&[step], external),
            }
        })
        .collect()
}

/// A filter that only narrows the output of a map step it depends on.
fn filters_after_maps(
    workflow: &WorkflowDefinition,
    usages: &[TaskUsage],
) -> Vec<OptimizationCandidate> {
    let mut found = Vec::new();
    for filter in workflow.steps.iter().filter(|s| category(s) == "filter") {
        for map in filter
            .depends_on
            .iter()
            .filter_map(|d| workflow.step(d))
            .filter(|s| category(s) == "map")
        {
            if !read_steps(filter).contains(&map.id) {
                continue;
            }
            let other_readers = usage_of(usages, &map.id)
                .map(|u| u.consumers.iter().filter(|c| **c != filter.id).count())
                .unwrap_or(0);
            found.push(OptimizationCandidate {
                kind: OptimizationKind::FilterBeforeMap,
                target_step: filter.id.clone(),
                related_steps: vec![map.id.clone()],
                description: format!(
                    "run filter '{}' ahead of map '{}' so only kept items are mapped",
                    filter.id, map.id
                ),
                estimated_impact: EstimatedImpact {
                    invocations_saved: 0,
                    levels_saved: 0,
                },
                evidence: evidence(&[filter, map], other_readers as u32),
            });
        }
    }
    found
}

/// Two pure transforms where the second is the first's only dependent and
/// depends on nothing else.
fn fusible_transforms(
    workflow: &WorkflowDefinition,
    graph: &ExecutionGraph,
) -> Vec<OptimizationCandidate> {
    let mut found = Vec::new();
    for first in workflow.steps.iter().filter(|s| category(s) == "transform" && s.control.is_none()) {
        let dependents = graph.dependents(&first.id);
        let [second_id] = dependents.as_slice() else {
            continue;
        };
        let Some(second) = workflow.step(second_id) else {
            continue;
        };
        if category(second) != "transform"
            || second.control.is_some()
            || second.depends_on.len() != 1
        {
            continue;
        }
        found.push(OptimizationCandidate {
            kind: OptimizationKind::TransformFusion,
            target_step: first.id.clone(),
            related_steps: vec![second.id.clone()],
            description: format!(
                "fuse transforms '{}' and '{}' into a single invocation",
                first.id, second.id
            ),
            estimated_impact: EstimatedImpact {
                invocations_saved: 1,
                levels_saved: 1,
            },
            evidence: evidence(&[first, second], 0),
        });
    }
    found
}

/// Declared dependencies that carry no data and whose removal keeps every
/// template reference resolvable.
fn parallel_promotions(
    workflow: &WorkflowDefinition,
    graph: &ExecutionGraph,
) -> Vec<OptimizationCandidate> {
    let mut found = Vec::new();
    for step in &workflow.steps {
        let reads = read_steps(step);
        for dependency in &step.depends_on {
            if reads.contains(dependency) {
                continue;
            }
            let Some(dep_step) = workflow.step(dependency) else {
                continue;
            };
            let Some(promoted) = without_dependency(workflow, &step.id, dependency) else {
                continue;
            };
            let Ok(promoted_graph) = build_graph(&promoted) else {
                continue;
            };
            if !references_resolvable(&promoted, &promoted_graph) {
                continue;
            }

            let before = graph.level(&step.id).unwrap_or(0);
            let after = promoted_graph.level(&step.id).unwrap_or(0);
            found.push(OptimizationCandidate {
                kind: OptimizationKind::ParallelPromotion,
                target_step: step.id.clone(),
                related_steps: vec![dependency.clone()],
                description: format!(
                    "'{}' reads nothing from '{}'; drop the dependency so they can run in parallel",
                    step.id, dependency
                ),
                estimated_impact: EstimatedImpact {
                    invocations_saved: 0,
                    levels_saved: before.saturating_sub(after) as u32,
                },
                evidence: evidence(&[step, dep_step], 0),
            });
        }
    }
    found
}

fn without_dependency(
    workflow: &WorkflowDefinition,
    step_id: &str,
    dependency: &str,
) -> Option<WorkflowDefinition> {
    let mut rewritten = workflow.clone();
    let step = rewritten.steps.iter_mut().find(|s| s.id == step_id)?;
    step.depends_on.retain(|d| d != dependency);
    Some(rewritten)
}

/// Every step output reference still points at an ancestor.
fn references_resolvable(workflow: &WorkflowDefinition, graph: &ExecutionGraph) -> bool {
    workflow.steps.iter().all(|step| {
        let ancestors = graph.ancestors(&step.id);
        read_steps(step).iter().all(|r| ancestors.contains(r.as_str()))
    })
}

// ---------------------------------------------------------------------------
// Safety and application
// ---------------------------------------------------------------------------

/// Static safety rating, a pure function of the candidate and its evidence.
pub fn assess_optimization_safety(candidate: &OptimizationCandidate) -> SafetyLevel {
    let evidence = &candidate.evidence;
    match candidate.kind {
        OptimizationKind::DeadTask => {
            if evidence.touches_side_effects {
                SafetyLevel::Unsafe
            } else if evidence.external_usages == 0 {
                SafetyLevel::Safe
            } else {
                SafetyLevel::NeedsVerification
            }
        }
        OptimizationKind::FilterBeforeMap | OptimizationKind::TransformFusion => {
            if evidence.touches_side_effects {
                SafetyLevel::Unsafe
            } else {
                SafetyLevel::NeedsVerification
            }
        }
        OptimizationKind::ParallelPromotion => {
            if evidence.touches_side_effects {
                SafetyLevel::Unsafe
            } else if evidence.all_pure {
                SafetyLevel::Safe
            } else {
                SafetyLevel::NeedsVerification
            }
        }
    }
}

/// Rewrite `workflow` according to `candidate`.
///
/// Unsafe candidates are refused unless `allow_unsafe` is set. Dead-task
/// removal hands the removed step's dependencies to its dependents.
pub fn apply_optimization(
    workflow: &WorkflowDefinition,
    candidate: &OptimizationCandidate,
    allow_unsafe: bool,
) -> Result<WorkflowDefinition, OptimizationError> {
    if assess_optimization_safety(candidate) == SafetyLevel::Unsafe && !allow_unsafe {
        return Err(OptimizationError::UnsafeWithoutOverride {
            kind: candidate.kind,
            step: candidate.target_step.clone(),
        });
    }
    let target = workflow
        .step(&candidate.target_step)
        .ok_or_else(|| OptimizationError::UnknownStep(candidate.target_step.clone()))?;

    let rewritten = match candidate.kind {
        OptimizationKind::DeadTask => {
            let inherited = target.depends_on.clone();
            let mut rewritten = workflow.clone();
            rewritten.steps.retain(|s| s.id != candidate.target_step);
            for step in &mut rewritten.steps {
                if let Some(pos) = step.depends_on.iter().position(|d| *d == candidate.target_step) {
                    step.depends_on.remove(pos);
                    for dep in &inherited {
                        if !step.depends_on.contains(dep) {
                            step.depends_on.push(dep.clone());
                        }
                    }
                }
            }
            rewritten
        }
        OptimizationKind::ParallelPromotion => {
            let dependency = candidate
                .related_steps
                .first()
                .ok_or_else(|| OptimizationError::UnknownStep(String::new()))?;
            without_dependency(workflow, &candidate.target_step, dependency)
                .ok_or_else(|| OptimizationError::UnknownStep(candidate.target_step.clone()))?
        }
        kind @ (OptimizationKind::FilterBeforeMap | OptimizationKind::TransformFusion) => {
            return Err(OptimizationError::ManualRewriteRequired(kind));
        }
    };

    build_graph(&rewritten)?;
    tracing::info!(
        workflow = %workflow.key(),
        kind = %candidate.kind,
        step = %candidate.target_step,
        "optimization applied"
    );
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::workflow::test_support::{workflow, workflow_in};

    fn categorized(id: &str, task: &str, label: &str) -> TaskStep {
        let mut step = TaskStep::task(id, task);
        step.category = Some(label.to_string());
        step
    }

    fn of_kind(candidates: &[OptimizationCandidate], kind: OptimizationKind) -> Vec<&OptimizationCandidate> {
        candidates.iter().filter(|c| c.kind == kind).collect()
    }

    #[test]
    fn test_purity_heuristic() {
        assert_eq!(purity(&TaskStep::task("a", "filter-lines")), Purity::Pure);
        assert_eq!(purity(&TaskStep::task("a", "http.get")), Purity::SideEffecting);
        assert_eq!(purity(&TaskStep::task("a", "lookup")), Purity::Unknown);
        assert_eq!(purity(&categorized("a", "lookup", "Transform")), Purity::Pure);
        assert_eq!(purity(&TaskStep::sub_workflow("a", "map-all")), Purity::Unknown);
    }

    #[test]
    fn test_dead_task_detected_and_removed() {
        let mut wf = workflow(vec![
            TaskStep::task("fetch", "fetch-order"),
            categorized("debug", "format-debug", "format").depends_on(["fetch"]),
            TaskStep::task("price", "price-order")
                .depends_on(["fetch"])
                .with_input("lines", "{{tasks.fetch.output.lines}}"),
        ]);
        wf.output.insert("total".into(), "{{tasks.price.output.total}}".into());

        let analyzer = OptimizationAnalyzer::default();
        let candidates = analyzer.analyze(&wf).unwrap();
        let dead = of_kind(&candidates, OptimizationKind::DeadTask);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].target_step, "debug");
        assert_eq!(assess_optimization_safety(dead[0]), SafetyLevel::Safe);

        let rewritten = apply_optimization(&wf, dead[0], false).unwrap();
        assert!(rewritten.step("debug").is_none());
        assert_eq!(rewritten.steps.len(), 2);
    }

    #[test]
    fn test_dead_task_dependents_inherit_dependencies() {
        let wf = workflow(vec![
            TaskStep::task("a", "source"),
            TaskStep::task("b", "unused").depends_on(["a"]),
            TaskStep::task("c", "sink").depends_on(["b"]).with_input("x", "{{input.x}}"),
        ]);
        let candidate = OptimizationAnalyzer::default()
            .analyze(&wf)
            .unwrap()
            .into_iter()
            .find(|c| c.kind == OptimizationKind::DeadTask && c.target_step == "b")
            .unwrap();

        let rewritten = apply_optimization(&wf, &candidate, false).unwrap();
        assert_eq!(rewritten.step("c").unwrap().depends_on, ["a"]);
    }

    #[test]
    fn test_side_effecting_dead_task_is_unsafe() {
        let wf = workflow(vec![TaskStep::task("notify", "send-email")]);
        let candidates = OptimizationAnalyzer::default().analyze(&wf).unwrap();
        let dead = of_kind(&candidates, OptimizationKind::DeadTask);
        assert_eq!(assess_optimization_safety(dead[0]), SafetyLevel::Unsafe);

        let err = apply_optimization(&wf, dead[0], false).unwrap_err();
        assert!(matches!(err, OptimizationError::UnsafeWithoutOverride { .. }));
        let forced = apply_optimization(&wf, dead[0], true).unwrap();
        assert!(forced.steps.is_empty());
    }

    #[test]
    fn test_callers_reading_all_outputs_need_verification() {
        let tracker = DependencyTracker::new();
        tracker.register_workflow(&workflow_in(
            "default",
            "parent",
            vec![TaskStep::sub_workflow("child", "wf")],
        ));
        let wf = workflow(vec![categorized("t", "tidy", "format")]);

        let candidates = OptimizationAnalyzer::new(tracker).analyze(&wf).unwrap();
        let dead = of_kind(&candidates, OptimizationKind::DeadTask);
        assert_eq!(dead[0].evidence.external_usages, 1);
        assert_eq!(assess_optimization_safety(dead[0]), SafetyLevel::NeedsVerification);
    }

    #[test]
    fn test_parallel_promotion() {
        let mut wf = workflow(vec![
            categorized("load", "load-a", "parse"),
            categorized("check", "validate-b", "validate")
                .depends_on(["load"])
                .with_input("x", "{{input.x}}"),
        ]);
        wf.output.insert("a".into(), "{{tasks.load.output}}".into());
        wf.output.insert("b".into(), "{{tasks.check.output}}".into());

        let candidates = OptimizationAnalyzer::default().analyze(&wf).unwrap();
        let promos = of_kind(&candidates, OptimizationKind::ParallelPromotion);
        assert_eq!(promos.len(), 1);
        assert_eq!(promos[0].target_step, "check");
        assert_eq!(promos[0].related_steps, ["load"]);
        assert_eq!(promos[0].estimated_impact.levels_saved, 1);
        assert_eq!(assess_optimization_safety(promos[0]), SafetyLevel::Safe);

        let rewritten = apply_optimization(&wf, promos[0], false).unwrap();
        assert!(rewritten.step("check").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_no_promotion_when_a_transitive_read_would_break() {
        // c reads a through b; dropping b -> a would leave a unreachable from c
        let mut wf = workflow(vec![
            TaskStep::task("a", "source"),
            TaskStep::task("b", "middle").depends_on(["a"]),
            TaskStep::task("c", "sink")
                .depends_on(["b"])
                .with_input("v", "{{tasks.a.output}}")
                .with_input("w", "{{tasks.b.output}}"),
        ]);
        wf.output.insert("c".into(), "{{tasks.c.output}}".into());

        let candidates = OptimizationAnalyzer::default().analyze(&wf).unwrap();
        let promos = of_kind(&candidates, OptimizationKind::ParallelPromotion);
        assert!(promos.iter().all(|c| c.target_step != "b"), "{promos:?}");
    }

    #[test]
    fn test_filter_before_map_and_fusion_need_manual_rewrite() {
        let mut wf = workflow(vec![
            categorized("enrich", "map-lines", "map").with_input("l", "{{input.lines}}"),
            categorized("keep", "filter-lines", "filter")
                .depends_on(["enrich"])
                .with_input("l", "{{tasks.enrich.output}}"),
            categorized("shape", "transform-a", "transform")
                .depends_on(["keep"])
                .with_input("l", "{{tasks.keep.output}}"),
            categorized("rename", "transform-b", "transform")
                .depends_on(["shape"])
                .with_input("l", "{{tasks.shape.output}}"),
        ]);
        wf.output.insert("out".into(), "{{tasks.rename.output}}".into());

        let candidates = OptimizationAnalyzer::default().analyze(&wf).unwrap();
        let fbm = of_kind(&candidates, OptimizationKind::FilterBeforeMap);
        assert_eq!(fbm.len(), 1);
        assert_eq!(fbm[0].related_steps, ["enrich"]);
        assert!(fbm[0].evidence.all_pure);
        assert_eq!(assess_optimization_safety(fbm[0]), SafetyLevel::NeedsVerification);

        let fusion = of_kind(&candidates, OptimizationKind::TransformFusion);
        assert_eq!(fusion.len(), 1);
        assert_eq!(fusion[0].target_step, "shape");

        let err = apply_optimization(&wf, fusion[0], false).unwrap_err();
        assert!(matches!(
            err,
            OptimizationError::ManualRewriteRequired(OptimizationKind::TransformFusion)
        ));
    }

    #[test]
    fn test_invalid_workflow_is_reported() {
        let wf = workflow(vec![TaskStep::task("a", "t").depends_on(["ghost"])]);
        assert!(OptimizationAnalyzer::default().analyze(&wf).is_err());
    }
}
