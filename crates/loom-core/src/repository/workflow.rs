//! Workflow definition lookup.
//!
//! Sub-workflow steps are resolved through this trait at run time; the
//! dependency tracker and optimizer work on definitions handed to them.

use dashmap::DashMap;
use loom_types::error::RepositoryError;
use loom_types::workflow::{WorkflowDefinition, WorkflowKey};

/// Repository trait for workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync + 'static {
    /// Get a definition by namespace and name.
    fn get_workflow(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List definitions, optionally restricted to one namespace.
    fn list_workflows(
        &self,
        namespace: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;
}

/// Definitions held in memory. Used for sub-workflow resolution in tests and
/// by embedders that register definitions programmatically.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: DashMap<WorkflowKey, WorkflowDefinition>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition under its own key.
    pub fn insert(&self, workflow: WorkflowDefinition) {
        self.workflows.insert(workflow.key(), workflow);
    }

    pub fn remove(&self, key: &WorkflowKey) -> Option<WorkflowDefinition> {
        self.workflows.remove(key).map(|(_, wf)| wf)
    }
}

impl FromIterator<WorkflowDefinition> for InMemoryWorkflowRepository {
    fn from_iter<T: IntoIterator<Item = WorkflowDefinition>>(iter: T) -> Self {
        let repo = Self::new();
        for wf in iter {
            repo.insert(wf);
        }
        repo
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get_workflow(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let key = WorkflowKey::new(namespace, name);
        Ok(self.workflows.get(&key).map(|wf| wf.value().clone()))
    }

    async fn list_workflows(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut all: Vec<WorkflowDefinition> = self
            .workflows
            .iter()
            .filter(|e| namespace.is_none_or(|ns| e.key().namespace == ns))
            .map(|e| e.value().clone())
            .collect();
        all.sort_by_key(|wf| wf.key());
        Ok(all)
    }
}
