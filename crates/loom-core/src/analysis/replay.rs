//! Replay historical inputs through an original and a candidate workflow.
//!
//! Each run goes through an isolated copy of the orchestrator: a fresh
//! in-memory circuit store and no event publishing, so replay never moves
//! breaker state or emits notifications seen by live traffic. The dependency
//! tracker is never written.

use std::collections::BTreeMap;
use std::sync::Arc;

use loom_types::error::RepositoryError;
use loom_types::execution::ExecutionResult;
use loom_types::optimization::{Mismatch, ReplayOptions, ReplayResult};
use loom_types::workflow::{StepControl, StepTarget, WorkflowDefinition};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::{ExecutionHistory, WorkflowRepository};
use crate::resilience::CircuitStateStore;
use crate::workflow::executor::{ExecuteError, Orchestrator};
use crate::workflow::invoker::{EchoInvoker, InputValidator, TaskInvoker};

use super::equivalence::{IgnoreSet, STATUS_REF, compare_runs};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to load execution history: {0}")]
    History(#[from] RepositoryError),
}

/// Rename task references of `workflow` through `task_map`, switch cases
/// included. Unmapped references are kept.
pub fn apply_task_map(workflow: &WorkflowDefinition, task_map: &BTreeMap<String, String>) -> WorkflowDefinition {
    let rename = |reference: &mut String| {
        if let Some(mapped) = task_map.get(reference.as_str()) {
            *reference = mapped.clone();
        }
    };

    let mut mapped = workflow.clone();
    for step in &mut mapped.steps {
        if let StepTarget::Task(reference) = &mut step.target {
            rename(reference);
            if let Some(StepControl::Switch(switch)) = &mut step.control {
                for case in switch.cases.values_mut() {
                    rename(case);
                }
                if let Some(default) = &mut switch.default {
                    rename(default);
                }
            }
        }
    }
    mapped
}

pub struct ReplayEngine<I, V, R, S, H> {
    orchestrator: Orchestrator<I, V, R, S>,
    history: Arc<H>,
}

impl<I, V, R, S, H> ReplayEngine<I, V, R, S, H>
where
    I: TaskInvoker,
    V: InputValidator,
    R: WorkflowRepository,
    S: CircuitStateStore,
    H: ExecutionHistory,
{
    pub fn new(orchestrator: Orchestrator<I, V, R, S>, history: Arc<H>) -> Self {
        Self {
            orchestrator,
            history,
        }
    }

    /// Run the `replay_count` most recent inputs of `original` through both
    /// workflows and compare the results.
    pub async fn replay_workflow(
        &self,
        original: &WorkflowDefinition,
        candidate: &WorkflowDefinition,
        task_map: &BTreeMap<String, String>,
        replay_count: usize,
        options: &ReplayOptions,
    ) -> Result<ReplayResult, ReplayError> {
        let snapshots = self
            .history
            .recent_inputs(&original.key(), replay_count)
            .await?;
        let candidate = apply_task_map(candidate, task_map);
        let ignore = IgnoreSet::new(options.ignore_fields.iter().cloned());

        tracing::info!(
            workflow = %original.key(),
            snapshots = snapshots.len(),
            dry_run = options.dry_run,
            "replay started"
        );

        let mut total = 0u32;
        let mut matches = 0u32;
        let mut mismatches: Vec<Mismatch> = Vec::new();
        let mut deltas_ms: Vec<f64> = Vec::new();

        for snapshot in snapshots {
            let (before, after) = if options.dry_run {
                let echo = self.orchestrator.with_invoker(Arc::new(EchoInvoker));
                run_pair(&echo, original, &candidate, &snapshot.input).await
            } else {
                run_pair(&self.orchestrator, original, &candidate, &snapshot.input).await
            };

            let found = match (&before, &after) {
                (Ok(a), Ok(b)) => {
                    deltas_ms.push(b.total_duration.as_secs_f64() * 1000.0 - a.total_duration.as_secs_f64() * 1000.0);
                    compare_runs(snapshot.execution_id, original, &candidate, a, b, &ignore)
                }
                (Err(a), Err(b)) if a.to_string() == b.to_string() => Vec::new(),
                _ => vec![Mismatch {
                    execution_id: snapshot.execution_id,
                    task_ref: STATUS_REF.to_string(),
                    reason: format!("original: {}, candidate: {}", describe(&before), describe(&after)),
                }],
            };

            total += 1;
            if found.is_empty() {
                matches += 1;
            } else {
                tracing::debug!(execution_id = %snapshot.execution_id, mismatches = found.len(), "replay mismatch");
                mismatches.extend(found);
            }
        }

        let confidence_score = if total == 0 {
            1.0
        } else {
            f64::from(matches) / f64::from(total)
        };
        let average_time_delta_ms = if deltas_ms.is_empty() {
            0.0
        } else {
            deltas_ms.iter().sum::<f64>() / deltas_ms.len() as f64
        };

        tracing::info!(workflow = %original.key(), total, matches, confidence_score, "replay finished");
        Ok(ReplayResult {
            confidence_score,
            total,
            matches,
            mismatches,
            average_time_delta_ms,
            dry_run: options.dry_run,
        })
    }
}

type RunOutcome = Result<ExecutionResult, ExecuteError>;

async fn run_pair<J, V, R, S>(
    live: &Orchestrator<J, V, R, S>,
    original: &WorkflowDefinition,
    candidate: &WorkflowDefinition,
    input: &Value,
) -> (RunOutcome, RunOutcome)
where
    J: TaskInvoker,
    V: InputValidator,
    R: WorkflowRepository,
    S: CircuitStateStore,
{
    let (original_runner, candidate_runner) = (live.isolated(), live.isolated());
    tokio::join!(
        original_runner.execute(original, input.clone(), CancellationToken::new()),
        candidate_runner.execute(candidate, input.clone(), CancellationToken::new()),
    )
}

fn describe(outcome: &RunOutcome) -> String {
    match outcome {
        Ok(result) if result.success => "succeeded".to_string(),
        Ok(result) => format!("failed ({} errors)", result.errors.len()),
        Err(e) => format!("rejected ({e})"),
    }
}
