//! Workflow engine core: definition parsing, graph building and execution.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load/save
//! - `graph` -- graph builder, cycle detection, parallel group computation
//! - `context` -- run context with step outputs and template resolution
//! - `expression` -- JEXL evaluator for `when`, `switch` and `for_each`
//! - `retry` -- retry decisions and backoff delays
//! - `invoker` -- task invoker and input validator seams
//! - `executor` -- level-by-level parallel orchestrator

pub mod context;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod invoker;
pub mod retry;

pub use executor::{ExecuteError, Orchestrator, TaskError};
pub use graph::{ExecutionGraph, GraphError, GraphErrors, build_graph};
pub use invoker::{
    AcceptAll, EchoInvoker, InputValidator, InvocationError, TaskInvoker, TaskRequest,
    TaskResponse, ValidationError,
};

#[cfg(test)]
pub mod test_support {
    use loom_types::workflow::{TaskStep, WorkflowDefinition};

    /// Workflow `default/wf` with the given steps.
    pub fn workflow(steps: Vec<TaskStep>) -> WorkflowDefinition {
        workflow_in("default", "wf", steps)
    }

    pub fn workflow_in(namespace: &str, name: &str, steps: Vec<TaskStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            namespace: namespace.to_string(),
            description: None,
            version: None,
            input_schema: None,
            output: Default::default(),
            timeout_secs: None,
            steps,
        }
    }
}
