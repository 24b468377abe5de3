//! Execution graph builder, cycle detection, and parallel group computation.
//!
//! Steps live in a `petgraph` arena whose node indices equal declaration
//! order; edges run from a dependency to its dependent. Ordering uses Kahn's
//! algorithm with a declaration-order tie-break so repeated builds of the same
//! definition always agree.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use loom_types::workflow::WorkflowDefinition;
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' names unknown fallback step '{fallback}'")]
    UnknownFallback { step: String, fallback: String },

    #[error("duplicate step id '{0}'")]
    DuplicateId(String),

    #[error("step at position {0} has an empty id")]
    EmptyId(usize),

    #[error("cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

/// Every problem found while building a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid workflow graph: {}", render_errors(.0))]
pub struct GraphErrors(pub Vec<GraphError>);

fn render_errors(errors: &[GraphError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GraphErrors {
    pub fn errors(&self) -> &[GraphError] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Execution graph
// ---------------------------------------------------------------------------

/// A validated, acyclic execution graph with its derived orderings.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
    levels: Vec<usize>,
}

/// Dry-run view of how a workflow would be scheduled.
///
/// `groups` are same-level sets: the steps the orchestrator launches together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub order: Vec<String>,
    pub groups: Vec<Vec<String>>,
}

/// Build and validate the execution graph of a workflow.
///
/// Structural problems (empty or duplicate ids, unknown dependencies or
/// fallbacks) are all collected; cycle detection only runs when the structure
/// is sound. An empty step list yields an empty graph.
pub fn build_graph(workflow: &WorkflowDefinition) -> Result<ExecutionGraph, GraphErrors> {
    let mut errors = Vec::new();
    let mut graph = DiGraph::<String, ()>::with_capacity(workflow.steps.len(), 0);
    let mut index: HashMap<String, NodeIndex> = HashMap::new();

    for (pos, step) in workflow.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            errors.push(GraphError::EmptyId(pos));
            continue;
        }
        if index.contains_key(&step.id) {
            errors.push(GraphError::DuplicateId(step.id.clone()));
            continue;
        }
        let node = graph.add_node(step.id.clone());
        index.insert(step.id.clone(), node);
    }

    let mut seen_steps = HashSet::new();
    for step in &workflow.steps {
        // Edges of a duplicate are attributed to the first declaration only.
        if !seen_steps.insert(step.id.as_str()) {
            continue;
        }
        let Some(&to) = index.get(&step.id) else {
            continue;
        };
        for dep in &step.depends_on {
            match index.get(dep) {
                Some(&from) => {
                    graph.update_edge(from, to, ());
                }
                None => errors.push(GraphError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                }),
            }
        }
        if let Some(fallback) = &step.fallback {
            if !index.contains_key(fallback) || fallback == &step.id {
                errors.push(GraphError::UnknownFallback {
                    step: step.id.clone(),
                    fallback: fallback.clone(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return Err(GraphErrors(errors));
    }

    if let Some(path) = find_cycle(&graph) {
        return Err(GraphErrors(vec![GraphError::CycleDetected { path }]));
    }

    let order = kahn_order(&graph);
    let mut levels = vec![0usize; graph.node_count()];
    for &node in &order {
        let level = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|dep| levels[dep.index()] + 1)
            .max()
            .unwrap_or(0);
        levels[node.index()] = level;
    }

    tracing::debug!(
        workflow = %workflow.key(),
        steps = graph.node_count(),
        "execution graph built"
    );

    Ok(ExecutionGraph {
        graph,
        index,
        order,
        levels,
    })
}

/// Iterative depth-first search with an in-progress set; returns one cycle as
/// a path that starts and ends on the same step.
fn find_cycle(graph: &DiGraph<String, ()>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let successors = |node: NodeIndex| {
        let mut next: Vec<NodeIndex> = graph.neighbors(node).collect();
        next.sort();
        next
    };

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    // Current DFS path: each frame holds a node, its sorted successors and the
    // position of the next successor to look at.
    let mut frames: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();

    for root in graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }
        marks[root.index()] = Mark::InProgress;
        frames.push((root, successors(root), 0));

        while let Some((node, next, cursor)) = frames.last_mut() {
            let Some(&succ) = next.get(*cursor) else {
                marks[node.index()] = Mark::Done;
                frames.pop();
                continue;
            };
            *cursor += 1;
            match marks[succ.index()] {
                Mark::InProgress => {
                    let start = frames.iter().position(|(n, _, _)| *n == succ).unwrap_or(0);
                    let mut path: Vec<String> =
                        frames[start..].iter().map(|(n, _, _)| graph[*n].clone()).collect();
                    path.push(graph[succ].clone());
                    return Some(path);
                }
                Mark::Unvisited => {
                    marks[succ.index()] = Mark::InProgress;
                    frames.push((succ, successors(succ), 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Kahn's algorithm, always removing the earliest-declared ready node.
fn kahn_order(graph: &DiGraph<String, ()>) -> Vec<NodeIndex> {
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| indegree[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for succ in graph.neighbors(node) {
            indegree[succ.index()] -= 1;
            if indegree[succ.index()] == 0 {
                ready.push(Reverse(succ));
            }
        }
    }
    order
}

impl ExecutionGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Flat topological sequence of step ids.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order.iter().map(|&n| self.graph[n].as_str()).collect()
    }

    pub fn level(&self, id: &str) -> Option<usize> {
        self.index.get(id).map(|n| self.levels[n.index()])
    }

    /// Same-level sets in level order; members keep declaration order.
    pub fn parallel_groups(&self) -> Vec<Vec<&str>> {
        let depth = self.levels.iter().copied().max().map_or(0, |m| m + 1);
        let mut groups: Vec<Vec<&str>> = vec![Vec::new(); depth];
        for node in self.graph.node_indices() {
            groups[self.levels[node.index()]].push(self.graph[node].as_str());
        }
        groups
    }

    /// Direct dependencies of `id`, in declaration order.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, in declaration order.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, dir: Direction) -> Vec<&str> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(node, dir).collect();
        found.sort();
        found.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Every step `id` transitively depends on.
    pub fn ancestors(&self, id: &str) -> BTreeSet<&str> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                found.insert(self.graph[node].as_str());
            }
        }
        found
    }

    /// Every step that transitively depends on `id`.
    pub fn descendants(&self, id: &str) -> BTreeSet<&str> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].as_str());
            }
        }
        found
    }

    /// Whether `to` is reachable from `from` along dependency edges.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// No path in either direction. Broader than sharing a parallel group and
    /// never used for scheduling.
    pub fn can_run_concurrently(&self, a: &str, b: &str) -> bool {
        a != b
            && self.contains(a)
            && self.contains(b)
            && !self.has_path(a, b)
            && !self.has_path(b, a)
    }

    pub fn plan(&self) -> ExecutionPlan {
        ExecutionPlan {
            order: self.execution_order().into_iter().map(String::from).collect(),
            groups: self
                .parallel_groups()
                .into_iter()
                .map(|g| g.into_iter().map(String::from).collect())
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
