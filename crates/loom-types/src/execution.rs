//! Execution result types returned by the orchestrator.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Final status of one step in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    /// The step failed and its fallback produced the output.
    FellBack,
    Failed,
    Skipped,
    Blocked,
    Cancelled,
}

/// Serializable classification of a branch-local failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureKind {
    TemplateResolution,
    Expression,
    Timeout,
    NonSuccessStatus,
    ConnectionFailure,
    CircuitOpen,
    BlockedByUpstreamFailure,
    SubWorkflow,
    Cancelled,
    OutputMapping,
    /// The step's task panicked or was aborted.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub step_id: String,
    pub kind: TaskFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub status: TaskStatus,
    pub attempts: u32,
    pub retry_count: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub success: bool,
    /// Step id -> output, for every step that produced one.
    pub outputs: BTreeMap<String, Value>,
    /// Resolved output mapping (empty when the workflow declares none).
    pub output: BTreeMap<String, Value>,
    pub errors: Vec<TaskFailure>,
    pub tasks: BTreeMap<String, TaskReport>,
    #[serde(with = "duration_ms")]
    pub total_duration: Duration,
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn status_of(&self, step_id: &str) -> Option<TaskStatus> {
        self.tasks.get(step_id).map(|r| r.status)
    }

    pub fn retry_count(&self, step_id: &str) -> Option<u32> {
        self.tasks.get(step_id).map(|r| r.retry_count)
    }
}

/// Durations travel as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_durations_serialize_as_millis() {
        let result = ExecutionResult {
            run_id: Uuid::now_v7(),
            success: true,
            outputs: BTreeMap::new(),
            output: BTreeMap::new(),
            errors: vec![],
            tasks: BTreeMap::from([(
                "a".to_string(),
                TaskReport {
                    status: TaskStatus::Succeeded,
                    attempts: 1,
                    retry_count: 0,
                    duration: Duration::from_millis(42),
                },
            )]),
            total_duration: Duration::from_millis(1500),
            cancelled: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["total_duration"], json!(1500));
        assert_eq!(json["tasks"]["a"]["duration"], json!(42));
        assert_eq!(json["tasks"]["a"]["status"], json!("succeeded"));

        let back: ExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.retry_count("a"), Some(0));
    }
}
