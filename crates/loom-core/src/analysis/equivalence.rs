//! Output equivalence between an original run and a candidate run.

use std::collections::BTreeSet;

use loom_types::execution::ExecutionResult;
use loom_types::optimization::Mismatch;
use loom_types::workflow::WorkflowDefinition;
use serde_json::Value;
use uuid::Uuid;

/// Marker `task_ref` for a differing success flag.
pub const STATUS_REF: &str = "$status";
/// Marker `task_ref` for a differing mapped workflow output.
pub const OUTPUT_REF: &str = "$output";

/// Fields skipped during comparison, by key name anywhere or by dotted path.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    fields: BTreeSet<String>,
}

impl IgnoreSet {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    fn skips(&self, key: &str, path: &str) -> bool {
        self.fields.contains(key) || self.fields.contains(path)
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Dotted path of the first difference between `a` and `b`, if any.
///
/// Numbers compare by value, so `1` and `1.0` are equal.
pub fn first_difference(a: &Value, b: &Value, ignore: &IgnoreSet) -> Option<String> {
    diff_at(a, b, "", ignore)
}

fn diff_at(a: &Value, b: &Value, path: &str, ignore: &IgnoreSet) -> Option<String> {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
            for key in keys {
                let here = join(path, key);
                if ignore.skips(key, &here) {
                    continue;
                }
                match (left.get(key.as_str()), right.get(key.as_str())) {
                    (Some(l), Some(r)) => {
                        if let Some(found) = diff_at(l, r, &here, ignore) {
                            return Some(found);
                        }
                    }
                    _ => return Some(here),
                }
            }
            None
        }
        (Value::Array(left), Value::Array(right)) => {
            if left.len() != right.len() {
                return Some(join(path, "length"));
            }
            left.iter()
                .zip(right)
                .enumerate()
                .find_map(|(i, (l, r))| diff_at(l, r, &join(path, &i.to_string()), ignore))
        }
        (Value::Number(l), Value::Number(r)) => (!numbers_equal(l, r)).then(|| display_path(path)),
        _ => (a != b).then(|| display_path(path)),
    }
}

/// Integers compare exactly; `f64` only when either side is a float.
fn numbers_equal(l: &serde_json::Number, r: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (l.as_u64(), r.as_u64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (l.as_i64(), r.as_i64()) {
        return x == y;
    }
    if (l.is_u64() || l.is_i64()) && (r.is_u64() || r.is_i64()) {
        // One side is negative, the other exceeds i64::MAX.
        return false;
    }
    l.as_f64() == r.as_f64()
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}

/// Every observable difference between two runs of the same inputs.
///
/// Per-step outputs are compared only for steps declared in both workflows;
/// the mapped output and the success flag are always compared. An empty
/// result means the runs are equivalent.
pub fn compare_runs(
    execution_id: Uuid,
    original_workflow: &WorkflowDefinition,
    candidate_workflow: &WorkflowDefinition,
    original: &ExecutionResult,
    candidate: &ExecutionResult,
    ignore: &IgnoreSet,
) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    let mut mismatch = |task_ref: &str, reason: String| {
        mismatches.push(Mismatch {
            execution_id,
            task_ref: task_ref.to_string(),
            reason,
        });
    };

    if original.success != candidate.success {
        mismatch(
            STATUS_REF,
            format!(
                "original success={}, candidate success={}",
                original.success, candidate.success
            ),
        );
    }

    for step in &original_workflow.steps {
        if candidate_workflow.step(&step.id).is_none() {
            continue;
        }
        let task_ref = step.target.reference();
        match (original.outputs.get(&step.id), candidate.outputs.get(&step.id)) {
            (Some(a), Some(b)) => {
                if let Some(path) = first_difference(a, b, ignore) {
                    mismatch(task_ref, format!("step '{}' output differs at {path}", step.id));
                }
            }
            (Some(_), None) => mismatch(
                task_ref,
                format!("step '{}' produced no output in the candidate", step.id),
            ),
            (None, Some(_)) => mismatch(
                task_ref,
                format!("step '{}' produced output only in the candidate", step.id),
            ),
            (None, None) => {}
        }
    }

    let mapped_a = Value::Object(original.output.clone().into_iter().collect());
    let mapped_b = Value::Object(candidate.output.clone().into_iter().collect());
    if let Some(path) = first_difference(&mapped_a, &mapped_b, ignore) {
        mismatch(OUTPUT_REF, format!("workflow output differs at {path}"));
    }

    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_values() {
        let ignore = IgnoreSet::default();
        assert_eq!(first_difference(&json!({ "a": [1, 2] }), &json!({ "a": [1, 2] }), &ignore), None);
        assert_eq!(first_difference(&json!(1), &json!(1.0), &ignore), None);
    }

    #[test]
    fn test_difference_paths() {
        let ignore = IgnoreSet::default();
        assert_eq!(
            first_difference(&json!({ "a": { "b": 1 } }), &json!({ "a": { "b": 2 } }), &ignore),
            Some("a.b".to_string())
        );
        assert_eq!(
            first_difference(&json!({ "a": [1, 2] }), &json!({ "a": [1] }), &ignore),
            Some("a.length".to_string())
        );
        assert_eq!(
            first_difference(&json!({ "a": 1 }), &json!({}), &ignore),
            Some("a".to_string())
        );
        assert_eq!(first_difference(&json!("x"), &json!("y"), &ignore), Some("<root>".to_string()));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let ignore = IgnoreSet::default();
        assert_eq!(
            first_difference(
                &json!({ "id": 9007199254740993u64 }),
                &json!({ "id": 9007199254740992u64 }),
                &ignore
            ),
            Some("id".to_string())
        );
        assert_eq!(
            first_difference(&json!(-9007199254740993i64), &json!(-9007199254740992i64), &ignore),
            Some("<root>".to_string())
        );
        assert_eq!(first_difference(&json!(u64::MAX), &json!(u64::MAX), &ignore), None);
        assert_eq!(first_difference(&json!(2.5), &json!(2.5), &ignore), None);
    }

    #[test]
    fn test_ignored_fields_at_any_depth_or_by_path() {
        let a = json!({ "ts": 1, "order": { "ts": 5, "id": "o", "meta": { "trace": "x" } } });
        let b = json!({ "ts": 2, "order": { "ts": 6, "id": "o", "meta": { "trace": "y" } } });
        assert_eq!(first_difference(&a, &b, &IgnoreSet::new(["ts"])), Some("order.meta.trace".to_string()));
        assert_eq!(first_difference(&a, &b, &IgnoreSet::new(["ts", "order.meta.trace"])), None);
    }
}
