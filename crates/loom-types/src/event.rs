//! Lifecycle events emitted by the orchestrator and circuit breaker.
//!
//! All variants are Clone + Send + Sync so they can travel over a tokio
//! broadcast channel to whatever delivers them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit::CircuitStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        steps: u32,
    },

    TaskStarted {
        run_id: Uuid,
        step_id: String,
        task_ref: String,
        attempt: u32,
    },

    TaskCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
        retry_count: u32,
    },

    TaskFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// The step's fallback is being invoked in its place.
    TaskFallback {
        run_id: Uuid,
        step_id: String,
        fallback_step: String,
    },

    TaskSkipped {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },

    TaskBlocked {
        run_id: Uuid,
        step_id: String,
        failed_dependency: String,
    },

    CircuitTransition {
        service: String,
        from: CircuitStatus,
        to: CircuitStatus,
    },

    RunCompleted {
        run_id: Uuid,
        workflow: String,
        success: bool,
        duration_ms: u64,
        failed_tasks: u32,
    },

    RunCancelled {
        run_id: Uuid,
        workflow: String,
        reason: String,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::TaskStarted { run_id, .. }
            | WorkflowEvent::TaskCompleted { run_id, .. }
            | WorkflowEvent::TaskFailed { run_id, .. }
            | WorkflowEvent::TaskFallback { run_id, .. }
            | WorkflowEvent::TaskSkipped { run_id, .. }
            | WorkflowEvent::TaskBlocked { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunCancelled { run_id, .. } => Some(*run_id),
            WorkflowEvent::CircuitTransition { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagged_serialization() {
        let event = WorkflowEvent::TaskFailed {
            run_id: Uuid::now_v7(),
            step_id: "fetch".to_string(),
            error: "timed out".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"task_failed\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_circuit_transition_has_no_run() {
        let event = WorkflowEvent::CircuitTransition {
            service: "orders".to_string(),
            from: CircuitStatus::Closed,
            to: CircuitStatus::Open,
        };
        assert!(event.run_id().is_none());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["to"], "open");
    }
}
