//! Reserved field extraction and schema validation.

use jsonschema::{Draft, JSONSchema};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::repair::parse_json_object;
use crate::error::RunError;
use crate::llm::ToolCallRequestWithId;
use crate::task::{AgentRunResult, AgentRunStatus, ReasoningStep};

pub const REASONING_STEPS_KEY: &str = "internal_reasoning_steps";
pub const AGENT_RUN_RESULT_KEY: &str = "internal_agent_run_result";
pub const TOOL_CALLS_KEY: &str = "internal_tool_calls";

/// Output with the reserved fields taken out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedOutput {
    pub task_output: Value,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub agent_run_result: Option<AgentRunResult>,
    /// Tool calls requested through the output instead of native tool calling.
    pub tool_calls: Vec<ToolCallRequestWithId>,
}

#[derive(Deserialize)]
struct RawReasoningStep {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "explaination")]
    explanation: Option<String>,
}

#[derive(Deserialize)]
struct RawToolCall {
    tool_name: String,
    #[serde(default)]
    tool_input_dict: Option<Value>,
}

/// Validates model output against a task's output schema.
pub struct OutputValidator {
    compiled: JSONSchema,
}

impl std::fmt::Debug for OutputValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputValidator").finish_non_exhaustive()
    }
}

impl OutputValidator {
    pub fn new(output_schema: &Value) -> Result<Self, RunError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(output_schema)
            .map_err(|err| RunError::schema_validation(format!("Invalid output schema: {}", err)))?;
        Ok(Self { compiled })
    }

    /// Check a value against the schema, joining every violation into one message.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if let Err(errors) = self.compiled.validate(value) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{} at {}", e, path)
                    }
                })
                .collect();
            return Err(messages.join("; "));
        }
        Ok(())
    }

    /// Parse raw model text and extract the task output.
    ///
    /// With `partial`, the text is a stream prefix: a declared failure is ignored and
    /// validation errors are swallowed.
    pub fn extract(&self, raw: &str, partial: bool) -> Result<ExtractedOutput, RunError> {
        let value = parse_json_object(raw, partial).map_err(RunError::schema_validation)?;
        self.extract_value(value, partial)
    }

    pub fn extract_value(&self, value: Value, partial: bool) -> Result<ExtractedOutput, RunError> {
        let mut object = match value {
            Value::Object(map) => map,
            other => {
                return Err(RunError::JsonSchemaValidation {
                    message: "Output is not a JSON object".to_string(),
                    output: Some(other),
                })
            }
        };

        let reasoning_steps = pop_reasoning_steps(&mut object);
        let agent_run_result = pop_agent_run_result(&mut object);
        let tool_calls = pop_tool_calls(&mut object);
        let task_output = Value::Object(object);

        if let Some(result) = &agent_run_result {
            if result.status == AgentRunStatus::Failure && !partial {
                return Err(RunError::AgentRunFailed {
                    message: result
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "The agent reported a failure".to_string()),
                    error_code: result.error_code.clone(),
                    output: task_output,
                });
            }
        }

        // An output requesting tools is not the final answer yet
        if !partial && tool_calls.is_empty() {
            if let Err(message) = self.validate(&task_output) {
                return Err(RunError::JsonSchemaValidation {
                    message,
                    output: Some(task_output),
                });
            }
        }

        Ok(ExtractedOutput {
            task_output,
            reasoning_steps,
            agent_run_result,
            tool_calls,
        })
    }
}

fn pop_reasoning_steps(object: &mut Map<String, Value>) -> Vec<ReasoningStep> {
    let Some(Value::Array(items)) = object.remove(REASONING_STEPS_KEY) else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter(|v| !v.is_null())
        .filter_map(|v| serde_json::from_value::<RawReasoningStep>(v).ok())
        .map(|s| ReasoningStep {
            title: s.title,
            explanation: s.explanation,
        })
        .collect()
}

fn pop_agent_run_result(object: &mut Map<String, Value>) -> Option<AgentRunResult> {
    let value = object.remove(AGENT_RUN_RESULT_KEY)?;
    let status = match value.get("status").and_then(Value::as_str) {
        Some("failure") => AgentRunStatus::Failure,
        Some("success") => AgentRunStatus::Success,
        _ => return None,
    };
    // Accept both the flat form and a nested `error` object
    let error = value.get("error");
    let field = |name: &str| {
        value
            .get(name)
            .or_else(|| error.and_then(|e| e.get(name)))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Some(AgentRunResult {
        status,
        error_code: field("error_code"),
        error_message: field("error_message"),
    })
}

fn pop_tool_calls(object: &mut Map<String, Value>) -> Vec<ToolCallRequestWithId> {
    let Some(Value::Array(items)) = object.remove(TOOL_CALLS_KEY) else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|v| serde_json::from_value::<RawToolCall>(v).ok())
        .filter(|c| !c.tool_name.is_empty())
        .map(|c| {
            let input = match c.tool_input_dict {
                Some(v @ Value::Object(_)) => v,
                _ => Value::Object(Map::new()),
            };
            ToolCallRequestWithId::new(c.tool_name, input)
        })
        .collect()
}
