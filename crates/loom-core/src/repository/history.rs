//! Source of historical run inputs for replay.

use loom_types::error::RepositoryError;
use loom_types::workflow::WorkflowKey;
use serde_json::Value;
use uuid::Uuid;

/// One recorded run input.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalExecution {
    pub execution_id: Uuid,
    pub input: Value,
}

/// Supplies recorded inputs of past runs, most recent first.
pub trait ExecutionHistory: Send + Sync + 'static {
    fn recent_inputs(
        &self,
        workflow: &WorkflowKey,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<HistoricalExecution>, RepositoryError>> + Send;
}

/// A fixed list of snapshots, returned for every workflow.
impl ExecutionHistory for Vec<HistoricalExecution> {
    async fn recent_inputs(
        &self,
        _workflow: &WorkflowKey,
        limit: usize,
    ) -> Result<Vec<HistoricalExecution>, RepositoryError> {
        Ok(self.iter().take(limit).cloned().collect())
    }
}
