//! SQLite execution history.
//!
//! Stores each finished run's input next to its serialized `ExecutionResult`
//! and serves the most recent inputs to the replay engine through
//! `ExecutionHistory`.

use chrono::Utc;
use loom_core::repository::{ExecutionHistory, HistoricalExecution};
use loom_types::error::RepositoryError;
use loom_types::execution::ExecutionResult;
use loom_types::workflow::WorkflowKey;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed run history.
pub struct SqliteExecutionHistory {
    pool: DatabasePool,
}

impl SqliteExecutionHistory {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Record a finished run. The run id doubles as the history id.
    pub async fn record_execution(
        &self,
        workflow: &WorkflowKey,
        input: &Value,
        result: &ExecutionResult,
    ) -> Result<(), RepositoryError> {
        let input_json = serde_json::to_string(input)
            .map_err(|e| RepositoryError::Query(format!("serialize input: {e}")))?;
        let result_json = serde_json::to_string(result)
            .map_err(|e| RepositoryError::Query(format!("serialize result: {e}")))?;

        sqlx::query(
            r#"INSERT INTO execution_history
               (id, namespace, workflow_name, input, success, cancelled, result,
                total_duration_ms, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(result.run_id.to_string())
        .bind(&workflow.namespace)
        .bind(&workflow.name)
        .bind(&input_json)
        .bind(result.success)
        .bind(result.cancelled)
        .bind(&result_json)
        .bind(result.total_duration.as_millis() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(workflow = %workflow, run_id = %result.run_id, "execution recorded");
        Ok(())
    }

    /// The stored result of one run.
    pub async fn get_result(&self, run_id: &Uuid) -> Result<Option<ExecutionResult>, RepositoryError> {
        let row = sqlx::query("SELECT result FROM execution_history WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            let json: String = row
                .try_get("result")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            serde_json::from_str(&json)
                .map_err(|e| RepositoryError::Query(format!("invalid stored result: {e}")))
        })
        .transpose()
    }
}

struct HistoryRow {
    id: String,
    input: String,
}

impl HistoryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            input: row.try_get("input")?,
        })
    }

    fn into_execution(self) -> Result<HistoricalExecution, RepositoryError> {
        let execution_id = self
            .id
            .parse::<Uuid>()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?;
        let input = serde_json::from_str(&self.input)
            .map_err(|e| RepositoryError::Query(format!("invalid stored input: {e}")))?;
        Ok(HistoricalExecution { execution_id, input })
    }
}

impl ExecutionHistory for SqliteExecutionHistory {
    async fn recent_inputs(
        &self,
        workflow: &WorkflowKey,
        limit: usize,
    ) -> Result<Vec<HistoricalExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, input FROM execution_history
               WHERE namespace = ? AND workflow_name = ?
               ORDER BY recorded_at DESC, rowid DESC
               LIMIT ?"#,
        )
        .bind(&workflow.namespace)
        .bind(&workflow.name)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = HistoryRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }
}
