//! Errors surfaced by a run.
//!
//! Every variant maps to a stable machine readable code through [`RunError::code`].
//! Transient provider failures only show up here once failover has run out of
//! candidates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::llm::{Provider, ProviderError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Model {model} does not support {mode}")]
    ModelDoesNotSupportMode { model: String, mode: String },

    #[error("Provider {provider} does not support model {model}")]
    ProviderDoesNotSupportModel { provider: Provider, model: String },

    #[error("Unknown model {0}")]
    UnknownModel(String),

    #[error("Deprecated model {0} has no replacement model")]
    ModelIsMissingReplacementModel(String),

    #[error("No configured provider can serve model {0}")]
    NoProviderAvailable(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Tool calls did not settle after {0} iterations")]
    MaxToolCallIteration(usize),

    #[error("The model requested the same tool calls again: {0}")]
    ToolCallRecursion(String),

    #[error("Output did not match schema: {message}")]
    JsonSchemaValidation {
        message: String,
        /// Best effort output, when something could be parsed.
        output: Option<Value>,
    },

    #[error("Agent run failed: {message}")]
    AgentRunFailed {
        message: String,
        error_code: Option<String>,
        /// Output built before the model declared the failure.
        output: Value,
    },

    #[error("Invalid run properties: {0}")]
    InvalidRunProperties(String),
}

impl RunError {
    pub fn schema_validation(message: impl Into<String>) -> Self {
        RunError::JsonSchemaValidation {
            message: message.into(),
            output: None,
        }
    }

    /// Stable machine readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelDoesNotSupportMode { .. } => "model_does_not_support_mode",
            Self::ProviderDoesNotSupportModel { .. } => "provider_does_not_support_model",
            Self::UnknownModel(_) => "unknown_model",
            Self::ModelIsMissingReplacementModel(_) => "model_is_missing_replacement_model",
            Self::NoProviderAvailable(_) => "no_provider_available",
            Self::Provider(e) => e.code(),
            Self::MaxToolCallIteration(_) => "max_tool_call_iteration",
            Self::ToolCallRecursion(_) => "tool_call_recursion",
            Self::JsonSchemaValidation { .. } => "json_schema_validation_error",
            Self::AgentRunFailed { .. } => "agent_run_failed",
            Self::InvalidRunProperties(_) => "invalid_run_properties",
        }
    }

    /// Serializable form used in error stream events and by the binary.
    pub fn to_payload(&self) -> ErrorPayload {
        let details = match self {
            Self::AgentRunFailed { output, .. } => Some(output.clone()),
            Self::JsonSchemaValidation { output, .. } => output.clone(),
            Self::Provider(e) => e.provider.map(|p| serde_json::json!({ "provider": p })),
            _ => None,
        };
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

/// `{code, message}` object describing a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub type RunResult<T> = Result<T, RunError>;
