//! Provider client module for talking to upstream LLM APIs.
//!
//! This module provides a trait-based abstraction over LLM providers. The engine only
//! ever sees provider-agnostic [`Message`]s; each [`ProviderClient`] converts them to
//! its own wire format.
//!
//! Supports multimodal content (files attached to user messages) and tool calling.

mod error;
mod files;
mod openai_compatible;
mod provider;
mod registry;

pub use error::{classify_error_body, classify_http_status, ProviderError, ProviderErrorKind};
pub use files::{key_path_pointer, set_at_key_path, File, FileKind, FileWithKeyPath, KeyPathSegment};
pub use openai_compatible::OpenAiCompatibleClient;
pub use provider::Provider;
pub use registry::{ProviderRegistry, SharedProviderRegistry};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashing::{canonical_json, sha256_hex};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A tool call requested by the model.
///
/// The id is derived from the tool name and input, so two requests for the same tool
/// with the same arguments share an identity regardless of when they were made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequestWithId {
    pub id: String,
    pub tool_name: String,
    pub tool_input_dict: Value,
}

impl ToolCallRequestWithId {
    pub fn new(tool_name: impl Into<String>, tool_input_dict: Value) -> Self {
        let tool_name = tool_name.into();
        let id = tool_call_id(&tool_name, &tool_input_dict);
        Self {
            id,
            tool_name,
            tool_input_dict,
        }
    }
}

/// Deterministic identity of a tool call.
pub fn tool_call_id(tool_name: &str, tool_input_dict: &Value) -> String {
    let hash = sha256_hex(&[tool_name, &canonical_json(tool_input_dict)]);
    format!("{}_{}", tool_name, &hash[..16])
}

/// Outcome of running a tool call. Exactly one of `result` and `error` is set once the
/// call has been executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(flatten)]
    pub request: ToolCallRequestWithId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn success(request: ToolCallRequestWithId, result: impl Into<String>) -> Self {
        Self {
            request,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failure(request: ToolCallRequestWithId, error: impl Into<String>) -> Self {
        Self {
            request,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text sent back to the model.
    pub fn content(&self) -> String {
        match (&self.result, &self.error) {
            (_, Some(error)) => format!("Error: {}", error),
            (Some(result), None) => result.clone(),
            (None, None) => String::new(),
        }
    }
}

/// A provider-agnostic chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileWithKeyPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_requests: Vec<ToolCallRequestWithId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_results: Vec<ToolCallResult>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            files: Vec::new(),
            tool_call_requests: Vec::new(),
            tool_call_results: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn with_files(mut self, files: Vec<FileWithKeyPath>) -> Self {
        self.files = files;
        self
    }

    /// Assistant message carrying every tool call of one round.
    pub fn tool_requests(content: impl Into<String>, requests: Vec<ToolCallRequestWithId>) -> Self {
        Self {
            tool_call_requests: requests,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// User message carrying every tool result of one round.
    pub fn tool_results(results: Vec<ToolCallResult>) -> Self {
        Self {
            tool_call_results: results,
            ..Self::new(Role::User, "")
        }
    }
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Token and media usage reported for one provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count_cached: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_image_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_audio_duration_seconds: Option<f64>,
}

impl LlmUsage {
    pub fn tokens(prompt: u64, completion: u64) -> Self {
        Self {
            prompt_token_count: Some(prompt),
            completion_token_count: Some(completion),
            ..Default::default()
        }
    }

    /// Fill fields missing here from `other`. Used when usage arrives across stream chunks.
    pub fn merge(&mut self, other: &LlmUsage) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(prompt_token_count);
        take!(prompt_token_count_cached);
        take!(completion_token_count);
        take!(reasoning_token_count);
        take!(prompt_image_count);
        take!(prompt_audio_duration_seconds);
    }
}

/// Prompt layout a provider accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplate {
    /// A system message followed by a user message.
    #[default]
    SystemAndUser,
    /// A single user message with the system content prepended.
    UserOnly,
}

/// Options for one provider call.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u64>,
    /// Output schema including reserved fields.
    pub output_schema: Value,
    /// Ask the provider to constrain generation to `output_schema`.
    pub structured_generation: bool,
    /// Ask for a JSON object without a schema, when the model supports it.
    pub json_mode: bool,
    /// Native tools. Empty when the model uses the `internal_tool_calls` output field.
    pub tools: Vec<ToolDefinition>,
}

/// Completed response of a provider call.
#[derive(Debug, Clone, Default)]
pub struct ProviderOutput {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequestWithId>,
    pub usage: LlmUsage,
    pub finish_reason: Option<String>,
}

/// Increment yielded by a provider stream.
#[derive(Debug, Clone, Default)]
pub struct ProviderDelta {
    /// Text appended to the completion.
    pub content: String,
    /// Tool calls that are fully received.
    pub tool_calls: Vec<ToolCallRequestWithId>,
    pub usage: Option<LlmUsage>,
    pub finish_reason: Option<String>,
}

/// Lazy, finite, non-restartable sequence of provider deltas.
pub type ProviderStream = BoxStream<'static, Result<ProviderDelta, ProviderError>>;

/// Trait implemented once per upstream API.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Send the messages and wait for the full completion.
    async fn complete(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<ProviderOutput, ProviderError>;

    /// Send the messages and stream the completion.
    async fn stream(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<ProviderStream, ProviderError>;

    /// Whether a URL-only file must be downloaded and sent inline.
    fn requires_downloading_file(&self, file: &File, model: &str) -> bool {
        let _ = model;
        file.kind() != FileKind::Image
    }

    fn is_streamable(&self, model: &str) -> bool {
        let _ = model;
        true
    }

    /// Prompt layout to use; providers may force a different one.
    fn sanitize_template(&self, template: PromptTemplate) -> PromptTemplate {
        template
    }
}
