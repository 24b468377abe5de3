//! Run context with task output tracking and template resolution.
//!
//! Templates are `{{ ... }}` placeholders inside string values of a step's
//! input or the workflow output mapping:
//!
//! - `{{input.<path>}}` -- a field of the run input
//! - `{{tasks.<id>.output.<path>}}` -- a field of a completed task's output
//! - `{{item.<path>}}` / `{{index}}` -- the current element inside `for_each`
//!
//! A string that is exactly one placeholder resolves to the referenced JSON
//! value with its type intact; placeholders embedded in longer text are
//! interpolated as strings.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("unsupported reference '{0}'")]
    UnsupportedReference(String),

    #[error("task '{0}' is not an upstream dependency")]
    NotAncestor(String),

    #[error("task '{0}' has not completed")]
    NotCompleted(String),

    #[error("task '{0}' was skipped and has no output")]
    Skipped(String),

    #[error("'{reference}' has no field '{field}'")]
    MissingField { reference: String, field: String },

    #[error("'{0}' is only available inside for_each")]
    NoCurrentItem(String),
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateRef {
    Input(Vec<String>),
    TaskOutput { step_id: String, path: Vec<String> },
    Item(Vec<String>),
    Index,
}

impl TemplateRef {
    pub fn parse(expr: &str) -> Result<Self, TemplateError> {
        let expr = expr.trim();
        let mut parts = expr.split('.').map(str::trim);
        match parts.next() {
            Some("input") => Ok(TemplateRef::Input(parts.map(String::from).collect())),
            Some("item") => Ok(TemplateRef::Item(parts.map(String::from).collect())),
            Some("index") if parts.next().is_none() => Ok(TemplateRef::Index),
            Some("tasks") => {
                let step_id = parts.next().filter(|s| !s.is_empty());
                let output = parts.next();
                match (step_id, output) {
                    (Some(step_id), Some("output")) => Ok(TemplateRef::TaskOutput {
                        step_id: step_id.to_string(),
                        path: parts.map(String::from).collect(),
                    }),
                    _ => Err(TemplateError::UnsupportedReference(expr.to_string())),
                }
            }
            _ => Err(TemplateError::UnsupportedReference(expr.to_string())),
        }
    }
}

/// Split a string into literal text and placeholder bodies.
fn segments(text: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            out.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(text.to_string()))?;
        out.push(Segment::Placeholder(after[..end].trim()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}

enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Every reference appearing in string leaves of `value`.
///
/// Malformed placeholders are ignored here; resolution reports them.
pub fn scan_refs(value: &Value) -> Vec<TemplateRef> {
    let mut found = Vec::new();
    collect_refs(value, &mut found);
    found
}

/// References in an expression string: placeholders plus bare JEXL paths
/// such as `tasks.fetch.output.status == 'open'`.
pub fn scan_str(text: &str) -> Vec<TemplateRef> {
    let mut found = Vec::new();
    collect_placeholders(text, &mut found);
    if found.is_empty() {
        for token in
            text.split(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            if token.starts_with("tasks.") || token.starts_with("input.") {
                if let Ok(r) = TemplateRef::parse(token) {
                    found.push(r);
                }
            }
        }
    }
    found
}

fn collect_refs(value: &Value, found: &mut Vec<TemplateRef>) {
    match value {
        Value::String(s) => collect_placeholders(s, found),
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, found)),
        _ => {}
    }
}

fn collect_placeholders(text: &str, found: &mut Vec<TemplateRef>) {
    let Ok(segs) = segments(text) else {
        return;
    };
    for seg in segs {
        if let Segment::Placeholder(expr) = seg {
            if let Ok(r) = TemplateRef::parse(expr) {
                found.push(r);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// State that flows through one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub input: Value,
    task_outputs: HashMap<String, Value>,
    skipped: HashSet<String>,
    item: Option<(Value, usize)>,
}

/// Which tasks a resolution may read.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Only these upstream steps (a step's ancestors).
    Upstream(&'a BTreeSet<&'a str>),
    /// Any completed step (output mapping).
    Any,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, input: Value) -> Self {
        Self {
            run_id,
            input,
            task_outputs: HashMap::new(),
            skipped: HashSet::new(),
            item: None,
        }
    }

    pub fn set_output(&mut self, step_id: &str, output: Value) {
        self.task_outputs.insert(step_id.to_string(), output);
    }

    pub fn mark_skipped(&mut self, step_id: &str) {
        self.skipped.insert(step_id.to_string());
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.task_outputs.get(step_id)
    }

    /// A copy scoped to one `for_each` element.
    pub fn with_item(&self, item: Value, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.item = Some((item, index));
        ctx
    }

    /// Resolve every placeholder in `value`, recursing through arrays and objects.
    pub fn resolve(&self, value: &Value, scope: Scope<'_>) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.resolve_str(s, scope),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v, scope)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn resolve_str(&self, text: &str, scope: Scope<'_>) -> Result<Value, TemplateError> {
        let segs = segments(text)?;
        if let [Segment::Placeholder(expr)] = segs.as_slice() {
            return self.lookup(&TemplateRef::parse(expr)?, scope);
        }

        let mut out = String::with_capacity(text.len());
        for seg in segs {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Placeholder(expr) => {
                    let value = self.lookup(&TemplateRef::parse(expr)?, scope)?;
                    out.push_str(&value_to_string(&value));
                }
            }
        }
        Ok(Value::String(out))
    }

    fn lookup(&self, reference: &TemplateRef, scope: Scope<'_>) -> Result<Value, TemplateError> {
        match reference {
            TemplateRef::Input(path) => walk(&self.input, path, "input"),
            TemplateRef::TaskOutput { step_id, path } => {
                if let Scope::Upstream(allowed) = scope {
                    if !allowed.contains(step_id.as_str()) {
                        return Err(TemplateError::NotAncestor(step_id.clone()));
                    }
                }
                if self.skipped.contains(step_id) {
                    return Err(TemplateError::Skipped(step_id.clone()));
                }
                let output = self
                    .task_outputs
                    .get(step_id)
                    .ok_or_else(|| TemplateError::NotCompleted(step_id.clone()))?;
                walk(output, path, &format!("tasks.{step_id}.output"))
            }
            TemplateRef::Item(path) => {
                let (item, _) = self
                    .item
                    .as_ref()
                    .ok_or_else(|| TemplateError::NoCurrentItem("item".into()))?;
                walk(item, path, "item")
            }
            TemplateRef::Index => self
                .item
                .as_ref()
                .map(|(_, i)| json!(i))
                .ok_or_else(|| TemplateError::NoCurrentItem("index".into())),
        }
    }

    /// JSON object for JEXL expression evaluation.
    ///
    /// Shape: `{ "input": .., "tasks": { "<id>": { "output": .. } }, "item": .., "index": .. }`
    /// with only the outputs `scope` admits under `tasks`.
    pub fn to_expression_context(&self, scope: Scope<'_>) -> Value {
        let mut tasks = Map::new();
        for (id, output) in &self.task_outputs {
            if let Scope::Upstream(allowed) = scope {
                if !allowed.contains(id.as_str()) {
                    continue;
                }
            }
            tasks.insert(id.clone(), json!({ "output": output }));
        }
        let mut ctx = json!({
            "input": self.input,
            "tasks": tasks,
        });
        if let Some((item, index)) = &self.item {
            ctx["item"] = item.clone();
            ctx["index"] = json!(index);
        }
        ctx
    }
}

/// Reject an expression that reads a step outside `scope`.
pub fn check_expression_scope(expression: &str, scope: Scope<'_>) -> Result<(), TemplateError> {
    let Scope::Upstream(allowed) = scope else {
        return Ok(());
    };
    for reference in scan_str(expression) {
        if let TemplateRef::TaskOutput { step_id, .. } = reference {
            if !allowed.contains(step_id.as_str()) {
                return Err(TemplateError::NotAncestor(step_id));
            }
        }
    }
    Ok(())
}

fn walk(root: &Value, path: &[String], label: &str) -> Result<Value, TemplateError> {
    let mut current = root;
    let mut reference = label.to_string();
    for field in path {
        let next = match current {
            Value::Object(map) => map.get(field),
            Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| TemplateError::MissingField {
            reference: reference.clone(),
            field: field.clone(),
        })?;
        reference.push('.');
        reference.push_str(field);
    }
    Ok(current.clone())
}

/// Convert a JSON value to a display string for interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            Uuid::now_v7(),
            json!({ "order_id": "ORD-1", "items": [{ "sku": "a" }, { "sku": "b" }] }),
        );
        ctx.set_output("fetch", json!({ "x": 1, "status": "open" }));
        ctx
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let ctx = ctx();
        let value = ctx
            .resolve_str("{{tasks.fetch.output.x}}", Scope::Any)
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[test]
    fn test_embedded_placeholders_interpolate() {
        let ctx = ctx();
        let value = ctx
            .resolve_str("order {{ input.order_id }} is {{tasks.fetch.output.status}}", Scope::Any)
            .unwrap();
        assert_eq!(value, json!("order ORD-1 is open"));
    }

    #[test]
    fn test_resolve_nested_value_and_array_index() {
        let ctx = ctx();
        let input = json!({ "first": "{{input.items.0.sku}}", "list": ["{{input.order_id}}", 3] });
        let resolved = ctx.resolve(&input, Scope::Any).unwrap();
        assert_eq!(resolved, json!({ "first": "a", "list": ["ORD-1", 3] }));
    }

    #[test]
    fn test_non_ancestor_is_rejected() {
        let ctx = ctx();
        let allowed = BTreeSet::new();
        let err = ctx
            .resolve_str("{{tasks.fetch.output.x}}", Scope::Upstream(&allowed))
            .unwrap_err();
        assert_eq!(err, TemplateError::NotAncestor("fetch".into()));
    }

    #[test]
    fn test_incomplete_and_skipped_tasks() {
        let mut ctx = ctx();
        let err = ctx.resolve_str("{{tasks.price.output}}", Scope::Any).unwrap_err();
        assert_eq!(err, TemplateError::NotCompleted("price".into()));

        ctx.mark_skipped("price");
        let err = ctx.resolve_str("{{tasks.price.output}}", Scope::Any).unwrap_err();
        assert_eq!(err, TemplateError::Skipped("price".into()));
    }

    #[test]
    fn test_missing_field() {
        let ctx = ctx();
        let err = ctx
            .resolve_str("{{tasks.fetch.output.total}}", Scope::Any)
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingField {
                reference: "tasks.fetch.output".into(),
                field: "total".into()
            }
        );
    }

    #[test]
    fn test_unterminated_and_unsupported() {
        let ctx = ctx();
        assert!(matches!(
            ctx.resolve_str("{{input.order_id", Scope::Any),
            Err(TemplateError::Unterminated(_))
        ));
        assert!(matches!(
            ctx.resolve_str("{{env.HOME}}", Scope::Any),
            Err(TemplateError::UnsupportedReference(_))
        ));
    }

    #[test]
    fn test_item_scope() {
        let ctx = ctx().with_item(json!({ "sku": "z" }), 4);
        assert_eq!(ctx.resolve_str("{{item.sku}}", Scope::Any).unwrap(), json!("z"));
        assert_eq!(ctx.resolve_str("{{index}}", Scope::Any).unwrap(), json!(4));
        assert!(matches!(
            self::ctx().resolve_str("{{item}}", Scope::Any),
            Err(TemplateError::NoCurrentItem(_))
        ));
    }

    #[test]
    fn test_scan_refs_finds_templates_and_bare_expressions() {
        let refs = scan_refs(&json!({ "a": "{{tasks.fetch.output.x}}", "b": ["{{input.id}}"] }));
        assert!(refs.contains(&TemplateRef::TaskOutput {
            step_id: "fetch".into(),
            path: vec!["x".into()]
        }));
        assert!(refs.contains(&TemplateRef::Input(vec!["id".into()])));

        let refs = scan_str("tasks.fetch.output.status == 'open'");
        assert_eq!(
            refs,
            vec![TemplateRef::TaskOutput {
                step_id: "fetch".into(),
                path: vec!["status".into()]
            }]
        );
    }

    #[test]
    fn test_expression_context_shape() {
        let ctx = ctx();
        let expr = ctx.to_expression_context(Scope::Any);
        assert_eq!(expr["tasks"]["fetch"]["output"]["x"], json!(1));
        assert_eq!(expr["input"]["order_id"], json!("ORD-1"));
        assert!(expr.get("item").is_none());
    }

    #[test]
    fn test_expression_context_is_scoped() {
        let allowed = BTreeSet::new();
        let expr = ctx().to_expression_context(Scope::Upstream(&allowed));
        assert!(expr["tasks"].get("fetch").is_none());
        assert_eq!(expr["input"]["order_id"], json!("ORD-1"));

        assert_eq!(
            check_expression_scope("tasks.fetch.output.x > 0", Scope::Upstream(&allowed)),
            Err(TemplateError::NotAncestor("fetch".into()))
        );
        assert!(check_expression_scope("input.order_id == 'ORD-1'", Scope::Upstream(&allowed)).is_ok());
        assert!(check_expression_scope("tasks.fetch.output.x > 0", Scope::Any).is_ok());
    }
}
