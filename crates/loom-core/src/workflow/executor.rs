//! Workflow orchestrator: level-by-level parallel execution of a workflow graph.
//!
//! The `Orchestrator` validates the run input, builds the execution graph and
//! then walks its parallel groups in level order. Steps within one group run
//! concurrently via `tokio::JoinSet`; a step starts only after every one of its
//! dependencies has finished.
//!
//! # Execution flow
//!
//! 1. Validate the input against the workflow's schema (fail fast).
//! 2. Validate the definition and build the graph (fail fast).
//! 3. For each group, spawn every runnable step; steps whose dependency failed
//!    are marked blocked without running.
//! 4. Each step: evaluate control (`when`/`switch`/`for_each`) -> resolve input
//!    templates -> check the circuit breaker -> invoke with timeout and retries
//!    -> fall back if configured.
//! 5. Resolve the output mapping and aggregate outputs, errors and reports.
//!
//! Cancelling the caller's token (or hitting the workflow timeout) cancels every
//! in-flight invocation of the run; outputs collected so far are kept.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, stream};
use loom_types::config::EngineConfig;
use loom_types::event::WorkflowEvent;
use loom_types::execution::{
    ExecutionResult, TaskFailure, TaskFailureKind, TaskReport, TaskStatus,
};
use loom_types::workflow::{StepControl, StepTarget, TaskStep, WorkflowDefinition, WorkflowKey};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{EventSink, NullSink};
use crate::repository::WorkflowRepository;
use crate::resilience::{CircuitBreaker, CircuitError, CircuitStateStore, InMemoryCircuitStore};

use super::context::{ExecutionContext, Scope, TemplateError, check_expression_scope};
use super::definition::{DefinitionError, validate_definition};
use super::expression::{ExpressionError, StepEvaluator, case_key};
use super::graph::{GraphErrors, build_graph};
use super::invoker::{
    InputValidator, InvocationError, TaskInvoker, TaskRequest, ValidationError,
};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that abort a run before any step executes.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Graph(#[from] GraphErrors),
}

/// Why one step (one branch of the run) did not produce an output.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("template resolution failed: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("blocked by failed upstream step '{0}'")]
    Blocked(String),

    #[error("sub-workflow '{workflow}' failed: {message}")]
    SubWorkflow { workflow: String, message: String },

    #[error("fallback '{fallback}' failed: {source}")]
    Fallback {
        fallback: String,
        source: Box<TaskError>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn kind(&self) -> TaskFailureKind {
        match self {
            TaskError::Template(_) => TaskFailureKind::TemplateResolution,
            TaskError::Expression(_) => TaskFailureKind::Expression,
            TaskError::Invocation(InvocationError::Timeout(_)) => TaskFailureKind::Timeout,
            TaskError::Invocation(InvocationError::NonSuccessStatus { .. }) => {
                TaskFailureKind::NonSuccessStatus
            }
            TaskError::Invocation(InvocationError::ConnectionFailure(_)) => {
                TaskFailureKind::ConnectionFailure
            }
            TaskError::CircuitOpen { .. } => TaskFailureKind::CircuitOpen,
            TaskError::Blocked(_) => TaskFailureKind::BlockedByUpstreamFailure,
            TaskError::SubWorkflow { .. } => TaskFailureKind::SubWorkflow,
            TaskError::Fallback { source, .. } => source.kind(),
            TaskError::Cancelled => TaskFailureKind::Cancelled,
        }
    }

    /// Only failures of the call itself are resolved through a fallback.
    fn allows_fallback(&self) -> bool {
        matches!(self, TaskError::Invocation(_) | TaskError::CircuitOpen { .. })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs workflows against an injected task invoker and input validator.
///
/// Cheap to clone: every collaborator sits behind an `Arc`.
pub struct Orchestrator<I, V, R, S> {
    invoker: Arc<I>,
    validator: Arc<V>,
    workflows: Arc<R>,
    breaker: CircuitBreaker<S>,
    events: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
}

impl<I, V, R, S> Clone for Orchestrator<I, V, R, S> {
    fn clone(&self) -> Self {
        Self {
            invoker: Arc::clone(&self.invoker),
            validator: Arc::clone(&self.validator),
            workflows: Arc::clone(&self.workflows),
            breaker: self.breaker.clone(),
            events: Arc::clone(&self.events),
            config: Arc::clone(&self.config),
        }
    }
}

impl<I, V, R, S> Orchestrator<I, V, R, S>
where
    I: TaskInvoker,
    V: InputValidator,
    R: WorkflowRepository,
    S: CircuitStateStore,
{
    pub fn new(
        invoker: Arc<I>,
        validator: Arc<V>,
        workflows: Arc<R>,
        breaker: CircuitBreaker<S>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            invoker,
            validator,
            workflows,
            breaker,
            events,
            config: Arc::new(config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker<S> {
        &self.breaker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workflows(&self) -> &Arc<R> {
        &self.workflows
    }

    /// A copy that records into a fresh in-memory breaker and publishes
    /// nothing, so its runs never touch state observed by live traffic.
    pub fn isolated(&self) -> Orchestrator<I, V, R, InMemoryCircuitStore> {
        let events: Arc<dyn EventSink> = Arc::new(NullSink);
        Orchestrator {
            invoker: Arc::clone(&self.invoker),
            validator: Arc::clone(&self.validator),
            workflows: Arc::clone(&self.workflows),
            breaker: CircuitBreaker::new(
                Arc::new(InMemoryCircuitStore::new()),
                *self.breaker.config(),
                Arc::clone(&events),
            ),
            events,
            config: Arc::clone(&self.config),
        }
    }

    /// The same orchestrator calling tasks through a different invoker.
    pub fn with_invoker<J: TaskInvoker>(&self, invoker: Arc<J>) -> Orchestrator<J, V, R, S> {
        Orchestrator {
            invoker,
            validator: Arc::clone(&self.validator),
            workflows: Arc::clone(&self.workflows),
            breaker: self.breaker.clone(),
            events: Arc::clone(&self.events),
            config: Arc::clone(&self.config),
        }
    }

    /// Run `workflow` to completion, partial failure or cancellation.
    ///
    /// Only input validation, a malformed definition and graph errors return
    /// `Err`; everything that happens once steps start is reported in the
    /// `ExecutionResult`.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        self.run_workflow(Arc::new(workflow.clone()), input, cancel, 0)
            .await
    }

    // Boxed so sub-workflow steps can recurse.
    fn run_workflow(
        &self,
        workflow: Arc<WorkflowDefinition>,
        input: Value,
        cancel: CancellationToken,
        depth: u32,
    ) -> BoxFuture<'static, Result<ExecutionResult, ExecuteError>> {
        let this = self.clone();
        async move { this.run(workflow, input, cancel, depth).await }.boxed()
    }

    async fn run(
        &self,
        workflow: Arc<WorkflowDefinition>,
        input: Value,
        cancel: CancellationToken,
        depth: u32,
    ) -> Result<ExecutionResult, ExecuteError> {
        let started = Instant::now();
        let key = workflow.key();

        self.validator
            .validate(workflow.input_schema.as_ref(), &input)
            .await?;
        validate_definition(&workflow)?;
        let graph = build_graph(&workflow)?;

        let run_id = Uuid::now_v7();
        tracing::info!(workflow = %key, %run_id, steps = graph.len(), depth, "workflow run started");
        self.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow: key.to_string(),
            steps: graph.len() as u32,
        });

        let token = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = workflow
            .timeout_secs
            .map(Duration::from_secs)
            .or_else(|| self.config.workflow_timeout())
            .map(|limit| {
                let token = token.clone();
                let flag = Arc::clone(&timed_out);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(limit) => {
                            flag.store(true, Ordering::SeqCst);
                            token.cancel();
                        }
                        _ = token.cancelled() => {}
                    }
                })
            });

        let mut state = RunState::new(run_id, input);
        let fallback_only = workflow.fallback_only_steps();

        for group in graph.parallel_groups() {
            if token.is_cancelled() {
                break;
            }

            let snapshot = Arc::new(state.ctx.clone());
            let limiter = self
                .config
                .concurrency_limit()
                .map(|n| Arc::new(Semaphore::new(n)));
            let mut join_set = JoinSet::new();
            let mut pending: HashSet<&str> = HashSet::new();

            for id in group {
                if fallback_only.contains(id) {
                    continue;
                }
                let Some(step) = workflow.step(id) else {
                    continue;
                };

                if let Some(dep) = step.depends_on.iter().find(|d| !state.is_satisfied(d)) {
                    tracing::warn!(%run_id, step_id = id, failed_dependency = %dep, "step blocked by upstream failure");
                    self.events.publish(WorkflowEvent::TaskBlocked {
                        run_id,
                        step_id: id.to_string(),
                        failed_dependency: dep.clone(),
                    });
                    state.record(StepOutcome::failed(
                        id,
                        TaskStatus::Blocked,
                        TaskError::Blocked(dep.clone()),
                    ));
                    continue;
                }

                pending.insert(id);
                let job = StepJob {
                    workflow: Arc::clone(&workflow),
                    step: step.clone(),
                    ctx: Arc::clone(&snapshot),
                    ancestors: graph.ancestors(id).into_iter().map(str::to_string).collect(),
                    token: token.clone(),
                    limiter: limiter.clone(),
                    depth,
                };
                join_set.spawn(self.clone().run_step(job));
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(outcome) => {
                        pending.remove(outcome.step_id.as_str());
                        state.record(outcome);
                    }
                    Err(e) => tracing::error!(%run_id, error = %e, "step task aborted"),
                }
            }

            for id in pending {
                state.errors.push(TaskFailure {
                    step_id: id.to_string(),
                    kind: TaskFailureKind::Internal,
                    message: "step task panicked".to_string(),
                });
                state.reports.insert(id.to_string(), report(TaskStatus::Failed, Tally::default(), Duration::ZERO));
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        let cancelled = token.is_cancelled();
        if cancelled {
            let reason = if timed_out.load(Ordering::SeqCst) {
                "workflow timeout exceeded"
            } else {
                "cancelled by caller"
            };
            for step in &workflow.steps {
                if !fallback_only.contains(step.id.as_str()) && !state.reports.contains_key(&step.id) {
                    state.reports.insert(
                        step.id.clone(),
                        report(TaskStatus::Cancelled, Tally::default(), Duration::ZERO),
                    );
                }
            }
            tracing::warn!(workflow = %key, %run_id, reason, "workflow run cancelled");
            self.events.publish(WorkflowEvent::RunCancelled {
                run_id,
                workflow: key.to_string(),
                reason: reason.to_string(),
            });
        } else {
            for (name, expression) in &workflow.output {
                match state.ctx.resolve_str(expression, Scope::Any) {
                    Ok(value) => {
                        state.mapped.insert(name.clone(), value);
                    }
                    Err(e) => state.errors.push(TaskFailure {
                        step_id: format!("$output.{name}"),
                        kind: TaskFailureKind::OutputMapping,
                        message: e.to_string(),
                    }),
                }
            }
        }

        let success = !cancelled && state.errors.is_empty();
        let total_duration = started.elapsed();
        tracing::info!(
            workflow = %key,
            %run_id,
            success,
            failed = state.errors.len(),
            duration_ms = total_duration.as_millis() as u64,
            "workflow run finished"
        );
        if !cancelled {
            self.events.publish(WorkflowEvent::RunCompleted {
                run_id,
                workflow: key.to_string(),
                success,
                duration_ms: total_duration.as_millis() as u64,
                failed_tasks: state.errors.len() as u32,
            });
        }

        Ok(ExecutionResult {
            run_id,
            success,
            outputs: state.outputs,
            output: state.mapped,
            errors: state.errors,
            tasks: state.reports,
            total_duration,
            cancelled,
        })
    }

    // -----------------------------------------------------------------------
    // One step
    // -----------------------------------------------------------------------

    async fn run_step(self, job: StepJob) -> StepOutcome {
        let started = Instant::now();
        let _permit = match &job.limiter {
            Some(limiter) => Arc::clone(limiter).acquire_owned().await.ok(),
            None => None,
        };

        let mut tally = Tally::default();
        let result = if job.token.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            self.step_body(&job, &mut tally).await
        };
        let duration = started.elapsed();
        let run_id = job.ctx.run_id;
        let step_id = job.step.id.clone();

        match result {
            Ok(StepResult::Skipped(reason)) => {
                tracing::debug!(%run_id, step_id = %step_id, %reason, "step skipped");
                self.events.publish(WorkflowEvent::TaskSkipped {
                    run_id,
                    step_id: step_id.clone(),
                    reason,
                });
                StepOutcome {
                    step_id,
                    status: TaskStatus::Skipped,
                    output: None,
                    error: None,
                    tally,
                    duration,
                }
            }
            Ok(StepResult::Output(output)) => {
                self.events.publish(WorkflowEvent::TaskCompleted {
                    run_id,
                    step_id: step_id.clone(),
                    duration_ms: duration.as_millis() as u64,
                    retry_count: tally.retries,
                });
                StepOutcome {
                    step_id,
                    status: if tally.fell_back {
                        TaskStatus::FellBack
                    } else {
                        TaskStatus::Succeeded
                    },
                    output: Some(output),
                    error: None,
                    tally,
                    duration,
                }
            }
            Err(TaskError::Cancelled) => StepOutcome {
                step_id,
                status: TaskStatus::Cancelled,
                output: None,
                error: Some(TaskError::Cancelled),
                tally,
                duration,
            },
            Err(error) => {
                tracing::warn!(%run_id, step_id = %step_id, error = %error, attempts = tally.attempts, "step failed");
                self.events.publish(WorkflowEvent::TaskFailed {
                    run_id,
                    step_id: step_id.clone(),
                    error: error.to_string(),
                    will_retry: false,
                });
                StepOutcome {
                    step_id,
                    status: TaskStatus::Failed,
                    output: None,
                    error: Some(error),
                    tally,
                    duration,
                }
            }
        }
    }

    async fn step_body(&self, job: &StepJob, tally: &mut Tally) -> Result<StepResult, TaskError> {
        let allowed: BTreeSet<&str> = job.ancestors.iter().map(String::as_str).collect();
        let scope = Scope::Upstream(&allowed);

        match plan_step(&job.step, &job.ctx, scope)? {
            StepPlan::Skip(reason) => Ok(StepResult::Skipped(reason)),
            StepPlan::Run(target) => {
                let input = job.ctx.resolve(&input_object(&job.step), scope)?;
                let output = self.invoke_with_fallback(job, &target, input, tally).await?;
                Ok(StepResult::Output(output))
            }
            StepPlan::Each {
                target,
                items,
                max_concurrency,
            } => {
                let template = input_object(&job.step);
                let inputs = items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| job.ctx.with_item(item, index).resolve(&template, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let width = max_concurrency.unwrap_or(inputs.len()).max(1);

                let results: Vec<(Result<Value, TaskError>, Tally)> = stream::iter(inputs)
                    .map(|input| {
                        let target = &target;
                        async move {
                            let mut item_tally = Tally::default();
                            let result = self
                                .invoke_with_fallback(job, target, input, &mut item_tally)
                                .await;
                            (result, item_tally)
                        }
                    })
                    .buffered(width)
                    .collect()
                    .await;

                let mut outputs = Vec::with_capacity(results.len());
                let mut first_error = None;
                for (result, item_tally) in results {
                    tally.absorb(item_tally);
                    match result {
                        Ok(value) => outputs.push(value),
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(StepResult::Output(Value::Array(outputs))),
                }
            }
        }
    }

    async fn invoke_with_fallback(
        &self,
        job: &StepJob,
        target: &StepTarget,
        input: Value,
        tally: &mut Tally,
    ) -> Result<Value, TaskError> {
        let error = match self
            .invoke_target(job, &job.step, target, input.clone(), tally)
            .await
        {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };

        let fallback = job
            .step
            .fallback
            .as_deref()
            .filter(|_| error.allows_fallback())
            .and_then(|id| job.workflow.step(id));
        let Some(fallback) = fallback else {
            return Err(error);
        };

        let run_id = job.ctx.run_id;
        tracing::warn!(%run_id, step_id = %job.step.id, fallback = %fallback.id, error = %error, "invoking fallback");
        self.events.publish(WorkflowEvent::TaskFallback {
            run_id,
            step_id: job.step.id.clone(),
            fallback_step: fallback.id.clone(),
        });

        // A fallback without its own input receives the failed step's input.
        let fallback_input = if fallback.input.is_empty() {
            input
        } else {
            let allowed: BTreeSet<&str> = job.ancestors.iter().map(String::as_str).collect();
            job.ctx
                .resolve(&input_object(fallback), Scope::Upstream(&allowed))?
        };

        match self
            .invoke_target(job, fallback, &fallback.target, fallback_input, tally)
            .await
        {
            Ok(output) => {
                tally.fell_back = true;
                Ok(output)
            }
            Err(e) => Err(TaskError::Fallback {
                fallback: fallback.id.clone(),
                source: Box::new(e),
            }),
        }
    }

    async fn invoke_target(
        &self,
        job: &StepJob,
        policy_step: &TaskStep,
        target: &StepTarget,
        input: Value,
        tally: &mut Tally,
    ) -> Result<Value, TaskError> {
        match target {
            StepTarget::Task(task_ref) => {
                self.invoke_task(job, policy_step, task_ref, input, tally)
                    .await
            }
            StepTarget::Workflow(reference) => {
                tally.attempts += 1;
                self.invoke_sub_workflow(job, reference, input).await
            }
        }
    }

    /// Invoke a leaf task under its timeout, retry policy and circuit breaker.
    async fn invoke_task(
        &self,
        job: &StepJob,
        policy_step: &TaskStep,
        task_ref: &str,
        input: Value,
        tally: &mut Tally,
    ) -> Result<Value, TaskError> {
        let run_id = job.ctx.run_id;
        let retry = policy_step
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let circuit = self.breaker.config_for(policy_step.circuit_breaker.as_ref());
        let service = policy_step.service_key_for(task_ref).to_string();
        let limit = policy_step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_task_timeout());

        let mut attempt = 0;
        loop {
            attempt += 1;
            if job.token.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            match self.breaker.check(&service, &circuit).await {
                Ok(()) => {}
                Err(CircuitError::Open { service }) => {
                    tracing::warn!(%run_id, step_id = %job.step.id, %service, "circuit open, call rejected");
                    return Err(TaskError::CircuitOpen { service });
                }
                Err(CircuitError::Store(e)) => {
                    tracing::warn!(%service, error = %e, "circuit store unavailable, allowing call");
                }
            }

            tally.attempts += 1;
            self.events.publish(WorkflowEvent::TaskStarted {
                run_id,
                step_id: job.step.id.clone(),
                task_ref: task_ref.to_string(),
                attempt,
            });
            tracing::debug!(%run_id, step_id = %job.step.id, task_ref, attempt, "invoking task");

            let request = TaskRequest {
                run_id,
                workflow: job.workflow.key(),
                step_id: job.step.id.clone(),
                task_ref: task_ref.to_string(),
                input: input.clone(),
                attempt,
            };
            let outcome = tokio::select! {
                biased;
                _ = job.token.cancelled() => return Err(TaskError::Cancelled),
                result = tokio::time::timeout(limit, self.invoker.invoke(request)) => match result {
                    Ok(Ok(response)) if response.is_success() => Ok(response.output),
                    Ok(Ok(response)) => Err(InvocationError::NonSuccessStatus {
                        status: response.status,
                        message: response.output.to_string(),
                    }),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(InvocationError::Timeout(limit)),
                },
            };

            match outcome {
                Ok(output) => {
                    if let Err(e) = self.breaker.record_success(&service, &circuit).await {
                        tracing::warn!(%service, error = %e, "failed to record circuit success");
                    }
                    return Ok(output);
                }
                Err(error) => {
                    if let Err(e) = self.breaker.record_failure(&service, &circuit).await {
                        tracing::warn!(%service, error = %e, "failed to record circuit failure");
                    }
                    if !RetryHandler::should_retry(&retry, attempt, &error) {
                        return Err(error.into());
                    }

                    let delay = RetryHandler::delay(&retry, attempt);
                    tracing::warn!(%run_id, step_id = %job.step.id, attempt, error = %error, delay_ms = delay.as_millis() as u64, "retrying task");
                    self.events.publish(WorkflowEvent::TaskFailed {
                        run_id,
                        step_id: job.step.id.clone(),
                        error: error.to_string(),
                        will_retry: true,
                    });
                    tally.retries += 1;
                    tokio::select! {
                        _ = job.token.cancelled() => return Err(TaskError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn invoke_sub_workflow(
        &self,
        job: &StepJob,
        reference: &str,
        input: Value,
    ) -> Result<Value, TaskError> {
        let key = WorkflowKey::resolve_ref(reference, &job.workflow.namespace);
        let failed = |message: String| TaskError::SubWorkflow {
            workflow: key.to_string(),
            message,
        };

        if job.depth + 1 > self.config.max_sub_workflow_depth {
            return Err(failed(format!(
                "nesting depth exceeds {}",
                self.config.max_sub_workflow_depth
            )));
        }

        let definition = self
            .workflows
            .get_workflow(&key.namespace, &key.name)
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| failed("definition not found".to_string()))?;

        let result = self
            .run_workflow(Arc::new(definition), input, job.token.clone(), job.depth + 1)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if result.cancelled {
            return Err(TaskError::Cancelled);
        }
        if !result.success {
            let steps: Vec<&str> = result.errors.iter().map(|e| e.step_id.as_str()).collect();
            return Err(failed(format!("failed steps: {}", steps.join(", "))));
        }
        // The mapped output when the sub-workflow declares one, else every step output.
        Ok(if result.output.is_empty() {
            json!(result.outputs)
        } else {
            json!(result.output)
        })
    }
}

// ---------------------------------------------------------------------------
// Step planning (synchronous: the JEXL evaluator never crosses an await)
// ---------------------------------------------------------------------------

enum StepPlan {
    Skip(String),
    Run(StepTarget),
    Each {
        target: StepTarget,
        items: Vec<Value>,
        max_concurrency: Option<usize>,
    },
}

fn plan_step(step: &TaskStep, ctx: &ExecutionContext, scope: Scope<'_>) -> Result<StepPlan, TaskError> {
    let Some(control) = &step.control else {
        return Ok(StepPlan::Run(step.target.clone()));
    };
    let evaluator = StepEvaluator::new();

    match control {
        StepControl::When(expression) => {
            check_expression_scope(expression, scope)?;
            if evaluator.evaluate_bool(expression, &ctx.to_expression_context(scope))? {
                Ok(StepPlan::Run(step.target.clone()))
            } else {
                Ok(StepPlan::Skip(format!("condition '{expression}' is false")))
            }
        }
        StepControl::Switch(switch) => {
            check_expression_scope(&switch.on, scope)?;
            let selected = case_key(&evaluator.evaluate_in_run(&switch.on, ctx, scope)?);
            match switch.cases.get(&selected).or(switch.default.as_ref()) {
                Some(reference) => Ok(StepPlan::Run(match step.target {
                    StepTarget::Task(_) => StepTarget::Task(reference.clone()),
                    StepTarget::Workflow(_) => StepTarget::Workflow(reference.clone()),
                })),
                None => Ok(StepPlan::Skip(format!("no switch case matches '{selected}'"))),
            }
        }
        StepControl::ForEach(each) => {
            let items = if each.items.contains("{{") {
                match ctx.resolve_str(&each.items, scope)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(ExpressionError::NotArray {
                            expression: each.items.clone(),
                            result: other,
                        }
                        .into());
                    }
                }
            } else {
                check_expression_scope(&each.items, scope)?;
                evaluator.evaluate_array(&each.items, ctx, scope)?
            };
            Ok(StepPlan::Each {
                target: step.target.clone(),
                items,
                max_concurrency: each.max_concurrency,
            })
        }
    }
}

fn input_object(step: &TaskStep) -> Value {
    Value::Object(
        step.input
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

struct StepJob {
    workflow: Arc<WorkflowDefinition>,
    step: TaskStep,
    ctx: Arc<ExecutionContext>,
    ancestors: BTreeSet<String>,
    token: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
    depth: u32,
}

enum StepResult {
    Skipped(String),
    Output(Value),
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    attempts: u32,
    retries: u32,
    fell_back: bool,
}

impl Tally {
    fn absorb(&mut self, other: Tally) {
        self.attempts += other.attempts;
        self.retries += other.retries;
        self.fell_back |= other.fell_back;
    }
}

struct StepOutcome {
    step_id: String,
    status: TaskStatus,
    output: Option<Value>,
    error: Option<TaskError>,
    tally: Tally,
    duration: Duration,
}

impl StepOutcome {
    fn failed(step_id: &str, status: TaskStatus, error: TaskError) -> Self {
        Self {
            step_id: step_id.to_string(),
            status,
            output: None,
            error: Some(error),
            tally: Tally::default(),
            duration: Duration::ZERO,
        }
    }
}

fn report(status: TaskStatus, tally: Tally, duration: Duration) -> TaskReport {
    TaskReport {
        status,
        attempts: tally.attempts,
        retry_count: tally.retries,
        duration,
    }
}

struct RunState {
    ctx: ExecutionContext,
    outputs: BTreeMap<String, Value>,
    mapped: BTreeMap<String, Value>,
    errors: Vec<TaskFailure>,
    reports: BTreeMap<String, TaskReport>,
}

impl RunState {
    fn new(run_id: Uuid, input: Value) -> Self {
        Self {
            ctx: ExecutionContext::new(run_id, input),
            outputs: BTreeMap::new(),
            mapped: BTreeMap::new(),
            errors: Vec::new(),
            reports: BTreeMap::new(),
        }
    }

    /// Skipped dependencies do not block their dependents.
    fn is_satisfied(&self, dependency: &str) -> bool {
        matches!(
            self.reports.get(dependency).map(|r| r.status),
            Some(TaskStatus::Succeeded | TaskStatus::FellBack | TaskStatus::Skipped)
        )
    }

    fn record(&mut self, outcome: StepOutcome) {
        match outcome.status {
            TaskStatus::Succeeded | TaskStatus::FellBack => {
                if let Some(output) = outcome.output {
                    self.ctx.set_output(&outcome.step_id, output.clone());
                    self.outputs.insert(outcome.step_id.clone(), output);
                }
            }
            TaskStatus::Skipped => self.ctx.mark_skipped(&outcome.step_id),
            TaskStatus::Failed | TaskStatus::Blocked => {
                if let Some(error) = &outcome.error {
                    self.errors.push(TaskFailure {
                        step_id: outcome.step_id.clone(),
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                }
            }
            TaskStatus::Cancelled => {}
        }
        self.reports.insert(
            outcome.step_id,
            report(outcome.status, outcome.tally, outcome.duration),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
