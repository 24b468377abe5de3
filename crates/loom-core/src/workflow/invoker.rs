//! Seams to the collaborators that actually run tasks and check inputs.
//!
//! The core never talks to a task's backing service or implements JSON Schema
//! itself; the infrastructure layer provides these traits.

use std::time::Duration;

use loom_types::workflow::WorkflowKey;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A fully resolved invocation of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub run_id: Uuid,
    pub workflow: WorkflowKey,
    pub step_id: String,
    pub task_ref: String,
    pub input: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResponse {
    pub output: Value,
    /// HTTP-style status; anything outside 2xx is a failure.
    pub status: u16,
    pub latency: Duration,
}

impl TaskResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            status: 200,
            latency: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("task returned status {status}: {message}")]
    NonSuccessStatus { status: u16, message: String },

    #[error("connection failure: {0}")]
    ConnectionFailure(String),
}

impl InvocationError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvocationError::Timeout(_) | InvocationError::ConnectionFailure(_) => true,
            InvocationError::NonSuccessStatus { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Executes one resolved task step.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        request: TaskRequest,
    ) -> impl std::future::Future<Output = Result<TaskResponse, InvocationError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("input validation failed: {}", .violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            violations: vec![message.into()],
        }
    }
}

/// Checks a run input against a workflow's input schema.
pub trait InputValidator: Send + Sync + 'static {
    fn validate(
        &self,
        schema: Option<&Value>,
        input: &Value,
    ) -> impl std::future::Future<Output = Result<(), ValidationError>> + Send;
}

/// Accepts every input. For workflows without schemas and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl InputValidator for AcceptAll {
    async fn validate(&self, _schema: Option<&Value>, _input: &Value) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Returns the resolved input as the output without calling anything.
///
/// Backs dry-run replays, where only data flow is compared.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoInvoker;

impl TaskInvoker for EchoInvoker {
    async fn invoke(&self, request: TaskRequest) -> Result<TaskResponse, InvocationError> {
        Ok(TaskResponse::ok(request.input))
    }
}
