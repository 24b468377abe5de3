//! Workflow definition types.
//!
//! `WorkflowDefinition` is the canonical representation shared by YAML/JSON
//! files, the graph builder, the orchestrator and the analyzers. Steps are a
//! closed sum over what they invoke (`StepTarget`) and how they are gated or
//! fanned out (`StepControl`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declaratively defined workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<semver::Version>,
    /// JSON Schema the run input must satisfy (None = accept anything).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Output-mapping expressions resolved after all steps finish.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output: BTreeMap<String, String>,
    /// Per-workflow timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Ordered list of steps. Declaration order is the topological tie-break.
    pub steps: Vec<TaskStep>,
}

pub fn default_namespace() -> String {
    "default".to_string()
}

impl WorkflowDefinition {
    pub fn key(&self) -> WorkflowKey {
        WorkflowKey::new(&self.namespace, &self.name)
    }

    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Ids of steps that are only ever used as another step's fallback.
    pub fn fallback_only_steps(&self) -> BTreeSet<&str> {
        let referenced: BTreeSet<&str> = self
            .steps
            .iter()
            .filter_map(|s| s.fallback.as_deref())
            .collect();
        referenced
            .into_iter()
            .filter(|id| !self.steps.iter().any(|s| s.depends_on.iter().any(|d| d == id)))
            .collect()
    }
}

/// Identity of a workflow: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub namespace: String,
    pub name: String,
}

impl WorkflowKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Resolve a workflow reference relative to `namespace`.
    ///
    /// `"ns/name"` is absolute; a bare `"name"` lives in the caller's namespace.
    pub fn resolve_ref(reference: &str, namespace: &str) -> Self {
        match reference.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new(namespace, reference),
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Task Step
// ---------------------------------------------------------------------------

/// One node of a workflow.
///
/// Serialized with flat `task:` / `workflow:` keys; exactly one must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskStepRepr", into = "TaskStepRepr")]
pub struct TaskStep {
    pub id: String,
    pub target: StepTarget,
    pub depends_on: Vec<String>,
    /// Input passed to the task; string leaves may hold `{{ }}` templates.
    pub input: BTreeMap<String, Value>,
    pub control: Option<StepControl>,
    /// Purity/side-effect hint used by the optimizer.
    pub category: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    /// Id of the step invoked in place of this one when it fails.
    pub fallback: Option<String>,
}

impl TaskStep {
    /// Leaf task step with no dependencies.
    pub fn task(id: impl Into<String>, task_ref: impl Into<String>) -> Self {
        Self::with_target(id, StepTarget::Task(task_ref.into()))
    }

    /// Sub-workflow step with no dependencies.
    pub fn sub_workflow(id: impl Into<String>, workflow_ref: impl Into<String>) -> Self {
        Self::with_target(id, StepTarget::Workflow(workflow_ref.into()))
    }

    fn with_target(id: impl Into<String>, target: StepTarget) -> Self {
        Self {
            id: id.into(),
            target,
            depends_on: Vec::new(),
            input: BTreeMap::new(),
            control: None,
            category: None,
            timeout_secs: None,
            retry: None,
            circuit_breaker: None,
            fallback: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    /// The name the circuit breaker tracks this step under.
    pub fn service_key(&self) -> &str {
        self.service_key_for(self.target.reference())
    }

    /// Breaker key when this step calls `task_ref`, such as a selected
    /// switch case. An explicit policy `service` always wins.
    pub fn service_key_for<'a>(&'a self, task_ref: &'a str) -> &'a str {
        self.circuit_breaker
            .as_ref()
            .and_then(|p| p.service.as_deref())
            .unwrap_or(task_ref)
    }
}

/// What a step invokes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    /// A leaf task handled by the external task invoker.
    Task(String),
    /// A nested workflow, referenced as `name` or `namespace/name`.
    Workflow(String),
}

impl StepTarget {
    pub fn reference(&self) -> &str {
        match self {
            StepTarget::Task(r) | StepTarget::Workflow(r) => r,
        }
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self, StepTarget::Workflow(_))
    }
}

/// Gating and fan-out applied around a step's invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepControl {
    /// Run only when the JEXL expression is true.
    When(String),
    /// Choose the task reference from the value of `on`.
    Switch(SwitchSpec),
    /// Invoke once per element of `items`.
    ForEach(ForEachSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchSpec {
    pub on: String,
    pub cases: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachSpec {
    /// A template (`"{{input.items}}"`) or a JEXL expression yielding an array.
    pub items: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// Wire shape of [`TaskStep`]: flat optional refs, validated on conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskStepRepr {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    input: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    switch: Option<SwitchSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    for_each: Option<ForEachSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    circuit_breaker: Option<CircuitBreakerPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback: Option<String>,
}

impl TryFrom<TaskStepRepr> for TaskStep {
    type Error = String;

    fn try_from(repr: TaskStepRepr) -> Result<Self, Self::Error> {
        let target = match (repr.task, repr.workflow) {
            (Some(task), None) => StepTarget::Task(task),
            (None, Some(workflow)) => StepTarget::Workflow(workflow),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "step '{}' sets both 'task' and 'workflow'",
                    repr.id
                ));
            }
            (None, None) => {
                return Err(format!(
                    "step '{}' must set one of 'task' or 'workflow'",
                    repr.id
                ));
            }
        };

        let control = match (repr.when, repr.switch, repr.for_each) {
            (None, None, None) => None,
            (Some(expr), None, None) => Some(StepControl::When(expr)),
            (None, Some(switch), None) => Some(StepControl::Switch(switch)),
            (None, None, Some(for_each)) => Some(StepControl::ForEach(for_each)),
            _ => {
                return Err(format!(
                    "step '{}' may set at most one of 'when', 'switch', 'for_each'",
                    repr.id
                ));
            }
        };

        Ok(TaskStep {
            id: repr.id,
            target,
            depends_on: repr.depends_on,
            input: repr.input,
            control,
            category: repr.category,
            timeout_secs: repr.timeout_secs,
            retry: repr.retry,
            circuit_breaker: repr.circuit_breaker,
            fallback: repr.fallback,
        })
    }
}

impl From<TaskStep> for TaskStepRepr {
    fn from(step: TaskStep) -> Self {
        let (task, workflow) = match step.target {
            StepTarget::Task(t) => (Some(t), None),
            StepTarget::Workflow(w) => (None, Some(w)),
        };
        let (when, switch, for_each) = match step.control {
            None => (None, None, None),
            Some(StepControl::When(e)) => (Some(e), None, None),
            Some(StepControl::Switch(s)) => (None, Some(s), None),
            Some(StepControl::ForEach(f)) => (None, None, Some(f)),
        };
        Self {
            id: step.id,
            task,
            workflow,
            depends_on: step.depends_on,
            input: step.input,
            when,
            switch,
            for_each,
            category: step.category,
            timeout_secs: step.timeout_secs,
            retry: step.retry,
            circuit_breaker: step.circuit_breaker,
            fallback: step.fallback,
        }
    }
}

// ---------------------------------------------------------------------------
// Resilience policies
// ---------------------------------------------------------------------------

/// Retry policy for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = a single attempt).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Per-step circuit breaker overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// Service key shared across steps (defaults to the step's target reference).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_yaml_task_ref() {
        let yaml = r#"
id: fetch
task: fetch-order
depends_on: [start]
input:
  id: "{{input.order_id}}"
retry:
  max_retries: 2
  backoff: fixed
"#;
        let step: TaskStep = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.target, StepTarget::Task("fetch-order".into()));
        assert_eq!(step.depends_on, vec!["start"]);
        let retry = step.retry.unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.backoff, BackoffStrategy::Fixed);
        assert_eq!(retry.initial_delay_ms, 100);
    }

    #[test]
    fn test_step_rejects_both_refs() {
        let yaml = "id: x\ntask: a\nworkflow: b\n";
        let err = serde_yaml_ng::from_str::<TaskStep>(yaml).unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn test_step_rejects_missing_ref() {
        let yaml = "id: x\n";
        let err = serde_yaml_ng::from_str::<TaskStep>(yaml).unwrap_err();
        assert!(err.to_string().contains("must set one of"));
    }

    #[test]
    fn test_step_rejects_two_controls() {
        let yaml = "id: x\ntask: a\nwhen: 'true'\nfor_each:\n  items: '{{input.xs}}'\n";
        assert!(serde_yaml_ng::from_str::<TaskStep>(yaml).is_err());
    }

    #[test]
    fn test_switch_control_parses() {
        let yaml = r#"
id: route
task: default-handler
switch:
  on: "input.kind"
  cases:
    a: handle-a
    b: handle-b
"#;
        let step: TaskStep = serde_yaml_ng::from_str(yaml).unwrap();
        match step.control {
            Some(StepControl::Switch(s)) => {
                assert_eq!(s.on, "input.kind");
                assert_eq!(s.cases.len(), 2);
                assert!(s.default.is_none());
            }
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn test_workflow_missing_steps_is_error() {
        let yaml = "name: broken\n";
        assert!(serde_yaml_ng::from_str::<WorkflowDefinition>(yaml).is_err());
    }

    #[test]
    fn test_workflow_defaults_and_key() {
        let yaml = "name: empty\nsteps: []\n";
        let wf: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(wf.namespace, "default");
        assert_eq!(wf.key().to_string(), "default/empty");
        assert!(wf.steps.is_empty());
    }

    #[test]
    fn test_resolve_ref() {
        assert_eq!(
            WorkflowKey::resolve_ref("billing/charge", "shop"),
            WorkflowKey::new("billing", "charge")
        );
        assert_eq!(
            WorkflowKey::resolve_ref("charge", "shop"),
            WorkflowKey::new("shop", "charge")
        );
    }

    #[test]
    fn test_service_key_prefers_policy() {
        let mut step = TaskStep::task("a", "fetch");
        assert_eq!(step.service_key(), "fetch");
        assert_eq!(step.service_key_for("refund"), "refund");
        step.circuit_breaker = Some(CircuitBreakerPolicy {
            service: Some("orders-api".into()),
            ..Default::default()
        });
        assert_eq!(step.service_key(), "orders-api");
        assert_eq!(step.service_key_for("refund"), "orders-api");
    }

    #[test]
    fn test_fallback_only_steps() {
        let mut primary = TaskStep::task("primary", "fetch");
        primary.fallback = Some("cache".into());
        let wf = WorkflowDefinition {
            name: "wf".into(),
            namespace: default_namespace(),
            description: None,
            version: None,
            input_schema: None,
            output: BTreeMap::new(),
            timeout_secs: None,
            steps: vec![primary, TaskStep::task("cache", "read-cache")],
        };
        let only: Vec<_> = wf.fallback_only_steps().into_iter().collect();
        assert_eq!(only, vec!["cache"]);
    }

    #[test]
    fn test_step_serializes_flat() {
        let step = TaskStep::sub_workflow("price", "pricing").depends_on(["fetch"]);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["workflow"], "pricing");
        assert_eq!(json["depends_on"][0], "fetch");
        assert!(json.get("task").is_none());
    }
}
