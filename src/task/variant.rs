use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashing::{canonical_json, sha256_hex};

/// Immutable shape of a task: its input and output JSON schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskVariant {
    /// Content hash of both schemas.
    #[serde(default)]
    pub id: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

impl TaskVariant {
    pub fn new(input_schema: Value, output_schema: Value) -> Self {
        let id = Self::compute_id(&input_schema, &output_schema);
        Self {
            id,
            input_schema,
            output_schema,
        }
    }

    pub fn compute_id(input_schema: &Value, output_schema: &Value) -> String {
        sha256_hex(&[&canonical_json(input_schema), &canonical_json(output_schema)])
    }

    /// Fill in the id when it was not supplied (e.g. deserialized without one).
    pub fn with_computed_id(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Self::compute_id(&self.input_schema, &self.output_schema);
        }
        self
    }
}
