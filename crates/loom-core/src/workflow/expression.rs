//! JEXL evaluation for step `when`, `switch` and `for_each` clauses.
//!
//! Run data is always passed as the evaluation context, never spliced into
//! expression text.

use serde_json::{Value, json};

use super::context::{ExecutionContext, Scope};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("expected an array from '{expression}', got {result}")]
    NotArray { expression: String, result: Value },
}

/// JEXL evaluator with a small set of transforms registered.
pub struct StepEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl StepEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }

    pub fn evaluate_in_run(
        &self,
        expression: &str,
        ctx: &ExecutionContext,
        scope: Scope<'_>,
    ) -> Result<Value, ExpressionError> {
        self.evaluate_value(expression, &ctx.to_expression_context(scope))
    }

    pub fn evaluate_array(
        &self,
        expression: &str,
        ctx: &ExecutionContext,
        scope: Scope<'_>,
    ) -> Result<Vec<Value>, ExpressionError> {
        match self.evaluate_in_run(expression, ctx, scope)? {
            Value::Array(items) => Ok(items),
            other => Err(ExpressionError::NotArray {
                expression: expression.to_string(),
                result: other,
            }),
        }
    }
}

impl Default for StepEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a switch selector as a case key (`"a"`, `"3"`, `"true"`).
pub fn case_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn run_ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(Uuid::now_v7(), json!({ "kind": "Refund", "count": 10.0 }));
        ctx.set_output("fetch", json!({ "status": "open", "lines": [1, 2, 3] }));
        ctx
    }

    #[test]
    fn test_condition_on_task_output() {
        let eval = StepEvaluator::new();
        let ctx = run_ctx().to_expression_context(Scope::Any);
        assert!(eval.evaluate_bool("tasks.fetch.output.status == 'open'", &ctx).unwrap());
        assert!(!eval.evaluate_bool("tasks.fetch.output.status == 'closed'", &ctx).unwrap());
    }

    #[test]
    fn test_transforms() {
        let eval = StepEvaluator::new();
        let ctx = run_ctx().to_expression_context(Scope::Any);
        assert_eq!(eval.evaluate_value("input.kind|lower", &ctx).unwrap(), json!("refund"));
        assert!(eval.evaluate_bool("tasks.fetch.output.lines|length > 2", &ctx).unwrap());
        assert!(eval.evaluate_bool("(input.count > 50)|not", &ctx).unwrap());
    }

    #[test]
    fn test_missing_property_is_falsy() {
        let eval = StepEvaluator::new();
        let ctx = run_ctx().to_expression_context(Scope::Any);
        assert!(!eval.evaluate_bool("input.absent", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_array() {
        let eval = StepEvaluator::new();
        let items = eval.evaluate_array("tasks.fetch.output.lines", &run_ctx(), Scope::Any).unwrap();
        assert_eq!(items.len(), 3);
        assert!(matches!(
            eval.evaluate_array("input.kind", &run_ctx(), Scope::Any),
            Err(ExpressionError::NotArray { .. })
        ));
    }

    #[test]
    fn test_invalid_context_not_object() {
        let eval = StepEvaluator::new();
        assert!(matches!(
            eval.evaluate_bool("true", &json!([1])),
            Err(ExpressionError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_case_key() {
        assert_eq!(case_key(&json!("a")), "a");
        assert_eq!(case_key(&json!(3.0)), "3");
        assert_eq!(case_key(&json!(true)), "true");
    }
}
