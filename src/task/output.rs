use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::budget::CostBreakdown;
use crate::llm::{LlmUsage, Provider, ToolCallResult};

/// One reasoning step produced when chain-of-thought is enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRunStatus {
    Success,
    Failure,
}

/// Status the model reports for the run as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub status: AgentRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentRunResult {
    pub fn success() -> Self {
        Self {
            status: AgentRunStatus::Success,
            error_code: None,
            error_message: None,
        }
    }
}

/// A provider call that succeeded, with its usage and cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCompletion {
    pub provider: Provider,
    pub model: String,
    pub usage: LlmUsage,
    pub cost: CostBreakdown,
}

/// One entry of the providers-tried audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: Provider,
    pub structured_generation: bool,
    /// Error code when the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub id: Uuid,
    pub task_output: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning_steps: Vec<ReasoningStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_run_result: Option<AgentRunResult>,
    /// Concrete model that served the run.
    pub model: String,
    /// Provider that served the last call.
    pub provider: Option<Provider>,
    pub llm_completions: Vec<LlmCompletion>,
    pub providers_tried: Vec<ProviderAttempt>,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

impl RunOutput {
    /// Sum of prompt and completion tokens over all completions.
    pub fn total_tokens(&self) -> u64 {
        self.llm_completions
            .iter()
            .map(|c| c.usage.prompt_token_count.unwrap_or(0) + c.usage.completion_token_count.unwrap_or(0))
            .sum()
    }
}
