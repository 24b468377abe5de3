//! Blast radius: everything transitively affected by a change to one task.
//!
//! Breadth-first over the "used-by" relation: a task is used by the workflows
//! that reference it, a workflow by the workflows that call it as a
//! sub-workflow. Nodes are attributed to the depth at which they are first
//! reached, and a visited set stops sub-workflow cycles.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use loom_types::usage::{
    BlastRadiusResult, DepthLevel, ImpactEdge, ImpactNode, ImpactNodeId, ImpactRelation, RefKind,
    TaskUsage,
};
use loom_types::workflow::WorkflowKey;

use super::usage::DependencyTracker;

/// Workflow -> referencing step ids plus their downstream steps.
type UsedBy = BTreeMap<WorkflowKey, BTreeSet<String>>;

fn used_by(registry: &BTreeMap<WorkflowKey, Vec<TaskUsage>>, node: &ImpactNodeId) -> UsedBy {
    let (kind, name) = match node {
        ImpactNodeId::Task(name) => (RefKind::Task, name.clone()),
        ImpactNodeId::Workflow(key) => (RefKind::Workflow, key.to_string()),
        ImpactNodeId::Step { .. } => return UsedBy::new(),
    };

    let mut found = UsedBy::new();
    for (workflow, usages) in registry {
        for usage in usages.iter().filter(|u| u.kind == kind && u.task_name == name) {
            let steps = found.entry(workflow.clone()).or_default();
            steps.insert(usage.step_id.clone());
            steps.extend(usage.downstream.iter().cloned());
        }
    }
    found
}

impl DependencyTracker {
    /// Everything affected by a change to `task`, up to `max_depth` levels of
    /// "used-by" (0 = unbounded).
    pub fn analyze_blast_radius(&self, task: &str, max_depth: u32) -> BlastRadiusResult {
        let registry = self.snapshot();
        let source = ImpactNodeId::Task(task.to_string());

        let mut visited: HashSet<ImpactNodeId> = HashSet::from([source.clone()]);
        let mut edge_keys: HashSet<(ImpactNodeId, ImpactNodeId)> = HashSet::new();
        let mut nodes = vec![ImpactNode {
            id: source.clone(),
            depth: 0,
            is_source: true,
        }];
        let mut edges = Vec::new();
        let mut depths = Vec::new();
        let mut truncated = false;

        let mut frontier = vec![source];
        let mut depth = 0u32;

        while !frontier.is_empty() {
            let next_depth = depth + 1;
            if max_depth != 0 && next_depth > max_depth {
                truncated = frontier.iter().any(|node| {
                    used_by(&registry, node)
                        .keys()
                        .any(|wf| !visited.contains(&ImpactNodeId::Workflow(wf.clone())))
                });
                break;
            }

            let mut level = DepthLevel {
                depth: next_depth,
                workflows: Vec::new(),
                tasks: Vec::new(),
            };
            let mut next = Vec::new();

            for node in &frontier {
                for (workflow, steps) in used_by(&registry, node) {
                    let target = ImpactNodeId::Workflow(workflow.clone());
                    if edge_keys.insert((node.clone(), target.clone())) {
                        edges.push(ImpactEdge {
                            from: node.clone(),
                            to: target.clone(),
                            relation: ImpactRelation::UsedBy,
                        });
                    }
                    if !visited.insert(target.clone()) {
                        continue;
                    }

                    nodes.push(ImpactNode {
                        id: target.clone(),
                        depth: next_depth,
                        is_source: false,
                    });
                    for step_id in steps {
                        level.tasks.push(format!("{workflow}:{step_id}"));
                        let step = ImpactNodeId::Step {
                            workflow: workflow.clone(),
                            step_id,
                        };
                        visited.insert(step.clone());
                        nodes.push(ImpactNode {
                            id: step.clone(),
                            depth: next_depth,
                            is_source: false,
                        });
                        edges.push(ImpactEdge {
                            from: target.clone(),
                            to: step,
                            relation: ImpactRelation::Contains,
                        });
                    }
                    level.workflows.push(workflow);
                    next.push(target);
                }
            }

            if level.workflows.is_empty() {
                break;
            }
            level.workflows.sort();
            level.tasks.sort();
            depths.push(level);
            frontier = next;
            depth = next_depth;
        }

        tracing::debug!(
            task,
            max_depth,
            affected = depths.iter().map(|d| d.workflows.len()).sum::<usize>(),
            truncated,
            "blast radius computed"
        );

        BlastRadiusResult {
            source_task: task.to_string(),
            max_depth,
            truncated_at_depth: truncated,
            depths,
            nodes,
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::workflow::TaskStep;

    use crate::workflow::test_support::workflow_in;

    fn key(name: &str) -> WorkflowKey {
        WorkflowKey::new("default", name)
    }

    /// `A` and `B` use `shared`; `C` calls `A`; `D` calls `C`.
    fn tracker() -> DependencyTracker {
        let tracker = DependencyTracker::new();
        tracker.register_workflow(&workflow_in(
            "default",
            "A",
            vec![
                TaskStep::task("use", "shared"),
                TaskStep::task("after", "other").depends_on(["use"]),
            ],
        ));
        tracker.register_workflow(&workflow_in("default", "B", vec![TaskStep::task("s", "shared")]));
        tracker.register_workflow(&workflow_in("default", "C", vec![TaskStep::sub_workflow("call-a", "A")]));
        tracker.register_workflow(&workflow_in("default", "D", vec![TaskStep::sub_workflow("call-c", "C")]));
        tracker
    }

    #[test]
    fn test_depth_one_is_truncated() {
        let result = tracker().analyze_blast_radius("shared", 1);
        assert_eq!(result.affected_workflows(), BTreeSet::from([key("A"), key("B")]));
        assert!(result.truncated_at_depth);
        assert_eq!(result.depths.len(), 1);
        assert_eq!(
            result.depths[0].tasks,
            ["default/A:after", "default/A:use", "default/B:s"]
        );
    }

    #[test]
    fn test_unbounded_reaches_transitive_callers() {
        let result = tracker().analyze_blast_radius("shared", 0);
        assert_eq!(
            result.affected_workflows(),
            BTreeSet::from([key("A"), key("B"), key("C"), key("D")])
        );
        assert!(!result.truncated_at_depth);
        assert_eq!(result.depths[1].workflows, [key("C")]);
        assert_eq!(result.depths[2].workflows, [key("D")]);

        let source: Vec<_> = result.nodes.iter().filter(|n| n.is_source).collect();
        assert_eq!(source.len(), 1);
        assert_eq!(source[0].id, ImpactNodeId::Task("shared".into()));
        assert!(result.edges.iter().any(|e| e.from == ImpactNodeId::Workflow(key("A"))
            && e.to == ImpactNodeId::Workflow(key("C"))
            && e.relation == ImpactRelation::UsedBy));
    }

    #[test]
    fn test_depth_exactly_covering_graph_is_not_truncated() {
        let result = tracker().analyze_blast_radius("shared", 3);
        assert_eq!(result.affected_workflows().len(), 4);
        assert!(!result.truncated_at_depth);
    }

    #[test]
    fn test_sub_workflow_cycle_terminates() {
        let tracker = DependencyTracker::new();
        tracker.register_workflow(&workflow_in(
            "default",
            "X",
            vec![TaskStep::task("t", "shared"), TaskStep::sub_workflow("y", "Y")],
        ));
        tracker.register_workflow(&workflow_in("default", "Y", vec![TaskStep::sub_workflow("x", "X")]));

        let result = tracker.analyze_blast_radius("shared", 0);
        assert_eq!(result.affected_workflows(), BTreeSet::from([key("X"), key("Y")]));
        // X is reached again from Y but attributed to its first depth only
        let x_nodes: Vec<_> = result
            .nodes
            .iter()
            .filter(|n| n.id == ImpactNodeId::Workflow(key("X")))
            .collect();
        assert_eq!(x_nodes.len(), 1);
        assert_eq!(x_nodes[0].depth, 1);
    }

    #[test]
    fn test_unused_task_has_only_source() {
        let result = tracker().analyze_blast_radius("nobody-uses-me", 0);
        assert!(result.depths.is_empty());
        assert_eq!(result.nodes.len(), 1);
        assert!(!result.truncated_at_depth);
    }
}
