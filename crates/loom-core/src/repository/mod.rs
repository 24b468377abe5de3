//! Repository trait definitions (ports).
//!
//! These traits define the lookup interfaces the orchestrator and replay
//! engine consume. The infrastructure layer (loom-infra) implements them; the
//! core crate never depends on any specific storage technology.

pub mod history;
pub mod workflow;

pub use history::{ExecutionHistory, HistoricalExecution};
pub use workflow::{InMemoryWorkflowRepository, WorkflowRepository};
