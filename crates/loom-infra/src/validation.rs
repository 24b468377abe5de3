//! JSON Schema validation of workflow run inputs.
//!
//! Implements `InputValidator` from `loom-core` with the `jsonschema` crate.
//! A workflow without `input_schema` accepts any input.

use jsonschema::validator_for;
use loom_core::workflow::{InputValidator, ValidationError};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaValidator;

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate synchronously, collecting every violation.
    pub fn check(&self, schema: Option<&Value>, input: &Value) -> Result<(), ValidationError> {
        let Some(schema) = schema else {
            return Ok(());
        };
        let validator = validator_for(schema)
            .map_err(|e| ValidationError::single(format!("invalid input schema: {e}")))?;

        let violations: Vec<String> = validator
            .iter_errors(input)
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() || path == "/" {
                    error.to_string()
                } else {
                    format!("at '{path}': {error}")
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }
}

impl InputValidator for JsonSchemaValidator {
    async fn validate(&self, schema: Option<&Value>, input: &Value) -> Result<(), ValidationError> {
        self.check(schema, input)
    }
}
