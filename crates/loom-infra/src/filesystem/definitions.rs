//! Workflow definitions stored as files.
//!
//! Layout: `{root}/{namespace}/{anything}.yaml|yml|json`. The directory
//! names the namespace; a file that omits `namespace` inherits it. Files are
//! read on every lookup so edits on disk take effect without a restart.

use std::path::{Path, PathBuf};

use loom_core::repository::WorkflowRepository;
use loom_core::workflow::definition::{
    DefinitionError, is_definition_file, parse_workflow_json, parse_workflow_yaml,
    serialize_workflow_yaml,
};
use loom_types::error::RepositoryError;
use loom_types::workflow::{WorkflowDefinition, default_namespace};

pub struct FileWorkflowRepository {
    root: PathBuf,
}

impl FileWorkflowRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{namespace}/{name}.yaml`.
    pub fn definition_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{name}.yaml"))
    }

    /// Write a definition as YAML under its namespace directory.
    pub async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<PathBuf, DefinitionError> {
        let path = self.definition_path(&def.namespace, &def.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serialize_workflow_yaml(def)?).await?;
        tracing::debug!(workflow = %def.key(), path = %path.display(), "workflow definition saved");
        Ok(path)
    }

    /// Parse every definition in one namespace directory, sorted by path.
    ///
    /// Unparseable files and files declaring a different namespace are
    /// skipped with a warning.
    async fn load_namespace(&self, namespace: &str) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RepositoryError::Query(format!("{}: {e}", dir.display()))),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
        {
            let path = entry.path();
            if is_definition_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut defs = Vec::with_capacity(paths.len());
        for path in paths {
            match load_file(&path).await {
                Ok(mut def) => {
                    if def.namespace != namespace && def.namespace != default_namespace() {
                        tracing::warn!(
                            path = %path.display(),
                            declared = %def.namespace,
                            directory = namespace,
                            "skipping workflow declared in another namespace"
                        );
                        continue;
                    }
                    def.namespace = namespace.to_string();
                    defs.push(def);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unparseable workflow file")
                }
            }
        }
        Ok(defs)
    }

    async fn namespaces(&self) -> Result<Vec<String>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RepositoryError::Query(format!("{}: {e}", self.root.display()))),
        };

        let mut namespaces = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                namespaces.push(name.to_string());
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }
}

async fn load_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = tokio::fs::read_to_string(path).await?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

impl WorkflowRepository for FileWorkflowRepository {
    async fn get_workflow(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .load_namespace(namespace)
            .await?
            .into_iter()
            .find(|def| def.name == name))
    }

    async fn list_workflows(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let namespaces = match namespace {
            Some(ns) => vec![ns.to_string()],
            None => self.namespaces().await?,
        };

        let mut all = Vec::new();
        for ns in namespaces {
            all.extend(self.load_namespace(&ns).await?);
        }
        all.sort_by_key(|def| def.key());
        Ok(all)
    }
}
