//! Runtime wiring.
//!
//! `Runtime` pins the orchestrator's generics to the concrete infra adapters:
//! file-backed definitions, JSON Schema validation and SQLite circuit state.
//! The task invoker stays generic because the transport to task services is
//! supplied by the embedder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use loom_core::analysis::{DependencyTracker, ReplayEngine};
use loom_core::event::{EventBus, EventSink};
use loom_core::repository::WorkflowRepository;
use loom_core::resilience::CircuitBreaker;
use loom_core::workflow::{Orchestrator, TaskInvoker};
use loom_types::config::EngineConfig;
use loom_types::execution::ExecutionResult;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{load_engine_config, resolve_database_url};
use crate::filesystem::{FileWorkflowRepository, resolve_data_dir, workflows_dir};
use crate::sqlite::{DatabasePool, SqliteCircuitStateStore, SqliteExecutionHistory};
use crate::validation::JsonSchemaValidator;

pub type LiveOrchestrator<I> =
    Orchestrator<I, JsonSchemaValidator, FileWorkflowRepository, SqliteCircuitStateStore>;

pub type LiveReplayEngine<I> = ReplayEngine<
    I,
    JsonSchemaValidator,
    FileWorkflowRepository,
    SqliteCircuitStateStore,
    SqliteExecutionHistory,
>;

pub struct Runtime<I> {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
    pub events: EventBus,
    pub orchestrator: LiveOrchestrator<I>,
    pub history: Arc<SqliteExecutionHistory>,
    pub tracker: DependencyTracker,
}

impl<I: TaskInvoker> Runtime<I> {
    /// Load `loom.toml`, open the database and wire the engine.
    ///
    /// Every definition found on disk is registered with the dependency
    /// tracker.
    pub async fn bootstrap(data_dir: &Path, invoker: I) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let config = load_engine_config(data_dir).await;
        let db_url = resolve_database_url(&config, data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("opening database {db_url}"))?;

        let events = EventBus::new(config.event_capacity);
        let sink: Arc<dyn EventSink> = Arc::new(events.clone());
        let breaker = CircuitBreaker::new(
            Arc::new(SqliteCircuitStateStore::new(db_pool.clone())),
            config.circuit_breaker,
            Arc::clone(&sink),
        );

        let orchestrator = Orchestrator::new(
            Arc::new(invoker),
            Arc::new(JsonSchemaValidator::new()),
            Arc::new(FileWorkflowRepository::new(workflows_dir(data_dir))),
            breaker,
            sink,
            config.clone(),
        );

        let runtime = Self {
            data_dir: data_dir.to_path_buf(),
            config,
            history: Arc::new(SqliteExecutionHistory::new(db_pool.clone())),
            db_pool,
            events,
            orchestrator,
            tracker: DependencyTracker::new(),
        };
        let registered = runtime.refresh_dependencies().await?;
        tracing::info!(
            data_dir = %runtime.data_dir.display(),
            workflows = registered,
            "loom runtime ready"
        );
        Ok(runtime)
    }

    /// Bootstrap in `LOOM_DATA_DIR`, or `~/.loom` when unset.
    pub async fn bootstrap_default(invoker: I) -> anyhow::Result<Self> {
        Self::bootstrap(&resolve_data_dir(), invoker).await
    }

    /// Re-register every definition on disk with the dependency tracker.
    pub async fn refresh_dependencies(&self) -> anyhow::Result<usize> {
        let workflows = self
            .orchestrator
            .workflows()
            .list_workflows(None)
            .await
            .context("listing workflow definitions")?;
        for workflow in &workflows {
            self.tracker.register_workflow(workflow);
        }
        Ok(workflows.len())
    }

    /// Execute a stored workflow and record the run for later replay.
    ///
    /// Runs rejected before any step starts (invalid input, malformed
    /// definition) are returned as errors and not recorded.
    pub async fn run_workflow(
        &self,
        namespace: &str,
        name: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        let workflow = self
            .orchestrator
            .workflows()
            .get_workflow(namespace, name)
            .await?
            .with_context(|| format!("workflow {namespace}/{name} not found"))?;

        let result = self
            .orchestrator
            .execute(&workflow, input.clone(), cancel)
            .await?;

        self.history
            .record_execution(&workflow.key(), &input, &result)
            .await
            .context("recording execution history")?;
        Ok(result)
    }

    pub fn replay_engine(&self) -> LiveReplayEngine<I> {
        ReplayEngine::new(self.orchestrator.clone(), Arc::clone(&self.history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::repository::ExecutionHistory;
    use loom_core::workflow::EchoInvoker;
    use loom_types::optimization::ReplayOptions;
    use serde_json::json;
    use std::collections::BTreeMap;

    const ORDERS: &str = r#"
name: orders
input_schema: { type: object, required: [order_id] }
output:
  id: "{{tasks.fetch.output.id}}"
steps:
  - id: fetch
    task: fetch-order
    input: { id: "{{input.order_id}}" }
"#;

    async fn runtime() -> (tempfile::TempDir, Runtime<EchoInvoker>) {
        let dir = tempfile::tempdir().unwrap();
        let shop = dir.path().join("workflows").join("shop");
        tokio::fs::create_dir_all(&shop).await.unwrap();
        tokio::fs::write(shop.join("orders.yaml"), ORDERS).await.unwrap();
        let runtime = Runtime::bootstrap(dir.path(), EchoInvoker).await.unwrap();
        (dir, runtime)
    }

    #[tokio::test]
    async fn test_bootstrap_registers_definitions() {
        let (_dir, runtime) = runtime().await;
        assert_eq!(runtime.tracker.len(), 1);
        assert_eq!(runtime.config, EngineConfig::default());
        assert!(runtime.orchestrator.breaker().is_healthy().await);
    }

    #[tokio::test]
    async fn test_run_records_history_and_replays() {
        let (_dir, runtime) = runtime().await;
        let result = runtime
            .run_workflow("shop", "orders", json!({ "order_id": "o-7" }), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["id"], json!("o-7"));

        let workflow = runtime
            .orchestrator
            .workflows()
            .get_workflow("shop", "orders")
            .await
            .unwrap()
            .unwrap();
        let recent = runtime.history.recent_inputs(&workflow.key(), 5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].execution_id, result.run_id);

        let replay = runtime
            .replay_engine()
            .replay_workflow(&workflow, &workflow, &BTreeMap::new(), 5, &ReplayOptions::default())
            .await
            .unwrap();
        assert_eq!(replay.total, 1);
        assert_eq!(replay.confidence_score, 1.0);
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_recorded() {
        let (_dir, runtime) = runtime().await;
        let err = runtime
            .run_workflow("shop", "orders", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("input validation failed"));

        let key = loom_types::workflow::WorkflowKey::new("shop", "orders");
        assert!(runtime.history.recent_inputs(&key, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let (_dir, runtime) = runtime().await;
        let err = runtime
            .run_workflow("shop", "missing", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
