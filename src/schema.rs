use std::fmt;
use std::sync::Arc;

use jsonschema::{validator_for, Validator};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Input schema must be a JSON object with \"type\": \"object\"")]
    NotAnObjectSchema,
    #[error("Schema compile error: {0}")]
    Compile(String),
    #[error("{0}")]
    Invalid(String),
}

/// A tool's input schema: the JSON Schema document advertised to clients
/// together with its compiled validator.
#[derive(Clone)]
pub struct InputSchema {
    document: Value,
    validator: Arc<Validator>,
}

impl InputSchema {
    /// Compile a JSON Schema (draft 2020-12) describing a tool's arguments.
    ///
    /// MCP requires tool arguments to be an object, so the root must declare
    /// `"type": "object"`.
    pub fn new(document: Value) -> Result<Self, SchemaError> {
        let is_object_schema = document
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| t == "object");
        if !is_object_schema {
            return Err(SchemaError::NotAnObjectSchema);
        }

        let validator =
            validator_for(&document).map_err(|e| SchemaError::Compile(e.to_string()))?;

        Ok(Self {
            document,
            validator: Arc::new(validator),
        })
    }

    pub fn as_value(&self) -> &Value {
        &self.document
    }

    /// Validate `instance` against the schema, joining every violation
    /// into one message.
    pub fn validate(&self, instance: &Value) -> Result<(), SchemaError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Invalid(errors.join("; ")))
        }
    }
}

impl fmt::Debug for InputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSchema")
            .field("document", &self.document)
            .finish_non_exhaustive()
    }
}
