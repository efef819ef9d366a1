//! Events yielded by a streaming run.

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ErrorPayload;
use crate::task::{ReasoningStep, RunOutput};

/// Output received so far. Every snapshot is a complete, parsed object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialOutput {
    pub id: Uuid,
    pub task_output: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasoning_steps: Vec<ReasoningStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Partial(PartialOutput),
    /// Validated output. Always the last event of a successful run.
    Final(RunOutput),
    /// The run failed. Always the last event of a failed run.
    Error(ErrorPayload),
}

impl StreamEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Partial(partial) => {
                let mut value = serde_json::to_value(partial).unwrap_or_default();
                value["final"] = Value::Bool(false);
                value
            }
            Self::Final(output) => {
                let mut value = serde_json::to_value(output).unwrap_or_default();
                value["final"] = Value::Bool(true);
                value
            }
            Self::Error(payload) => json!({ "error": payload }),
        }
    }

    /// Server-sent event framing: `data: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}
