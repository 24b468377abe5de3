//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON files and `WorkflowDefinition`, validates the
//! constraints that do not need the graph (names, step shape, timeouts), and
//! discovers definition files on disk. Graph-level checks (dependencies,
//! duplicates, cycles) belong to `graph::build_graph`.

use std::path::{Path, PathBuf};

use loom_types::workflow::{StepControl, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure, including a step setting both or neither of
    /// `task` and `workflow`.
    #[error("parse error: {0}")]
    Parse(String),

    /// Parsed but structurally unusable.
    #[error("malformed definition: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate constraints that hold independently of the dependency graph.
///
/// Checks:
/// - name and namespace are non-empty and use only alphanumerics, `-` and `_`
/// - timeouts are > 0 when set
/// - `switch` has at least one case or a default
/// - `for_each.max_concurrency` is >= 1 when set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    check_identifier("workflow name", &def.name)?;
    check_identifier("namespace", &def.namespace)?;

    if def.timeout_secs == Some(0) {
        return Err(DefinitionError::Malformed(
            "workflow timeout must be > 0".to_string(),
        ));
    }

    for step in &def.steps {
        if step.timeout_secs == Some(0) {
            return Err(DefinitionError::Malformed(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
        match &step.control {
            Some(StepControl::Switch(switch)) if switch.cases.is_empty() && switch.default.is_none() => {
                return Err(DefinitionError::Malformed(format!(
                    "switch on step '{}' has no cases and no default",
                    step.id
                )));
            }
            Some(StepControl::ForEach(each)) if each.max_concurrency == Some(0) => {
                return Err(DefinitionError::Malformed(format!(
                    "for_each on step '{}' needs max_concurrency >= 1",
                    step.id
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

fn check_identifier(what: &str, value: &str) -> Result<(), DefinitionError> {
    if value.is_empty() {
        return Err(DefinitionError::Malformed(format!("{what} must not be empty")));
    }
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Malformed(format!(
            "{what} '{value}' contains invalid characters (only alphanumerics, '-' and '_' allowed)"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a definition, choosing the format from the file extension.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Save a definition as YAML, creating parent directories as needed.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

pub fn is_definition_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Discover all definition files directly under `dir` (not recursive).
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_workflows(
    dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_definition_file(p))
        .collect();
    paths.sort();

    for path in paths {
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
        }
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
