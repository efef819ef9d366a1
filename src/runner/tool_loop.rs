//! Tool call rounds.
//!
//! A run alternates between waiting for the model and executing the tools it asked
//! for. Each executed round appends two messages to the conversation: the assistant
//! message with every request and a user message with every result.

use std::collections::BTreeSet;

use futures::future::join_all;

use crate::error::RunError;
use crate::llm::{Message, Role, ToolCallRequestWithId, ToolCallResult};
use crate::output::{ExtractedOutput, TOOL_CALLS_KEY};
use crate::tools::{ToolCallCache, ToolRegistry};

pub const MAX_TOOL_CALL_ITERATIONS: usize = 10;

/// Where a run stands.
#[derive(Debug)]
pub(crate) enum LoopState {
    AwaitingModel,
    ExecutingTools {
        content: String,
        requests: Vec<ToolCallRequestWithId>,
    },
    Done(ExtractedOutput),
    Failed(RunError),
}

/// Executes tool rounds for one run and keeps the resulting conversation.
pub(crate) struct ToolLoop<'a> {
    tools: &'a ToolRegistry,
    cache: &'a ToolCallCache,
    max_iterations: usize,
    iterations: usize,
    previous_ids: Option<BTreeSet<String>>,
    history: Vec<Message>,
    results: Vec<ToolCallResult>,
}

impl<'a> ToolLoop<'a> {
    pub fn new(tools: &'a ToolRegistry, cache: &'a ToolCallCache, max_iterations: usize) -> Self {
        Self {
            tools,
            cache,
            max_iterations,
            iterations: 0,
            previous_ids: None,
            history: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Messages appended by executed rounds.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn into_results(self) -> Vec<ToolCallResult> {
        self.results
    }

    /// Run the requested calls and append the round to the history.
    pub async fn execute_round(
        &mut self,
        content: String,
        requests: Vec<ToolCallRequestWithId>,
    ) -> Result<(), RunError> {
        if self.iterations >= self.max_iterations {
            return Err(RunError::MaxToolCallIteration(self.max_iterations));
        }

        let mut seen = BTreeSet::new();
        let requests: Vec<ToolCallRequestWithId> = requests
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .collect();

        if let Some(previous) = &self.previous_ids {
            if seen.is_subset(previous) {
                let ids: Vec<&str> = seen.iter().map(String::as_str).collect();
                return Err(RunError::ToolCallRecursion(ids.join(", ")));
            }
        }

        self.iterations += 1;
        tracing::debug!(
            "Tool round {}: {}",
            self.iterations,
            requests.iter().map(|r| r.tool_name.as_str()).collect::<Vec<_>>().join(", ")
        );

        let results = join_all(requests.iter().cloned().map(|r| self.resolve(r))).await;

        self.history.push(Message::tool_requests(content, requests));
        self.history.push(Message::tool_results(results.clone()));
        self.results.extend(results);
        self.previous_ids = Some(seen);
        Ok(())
    }

    async fn resolve(&self, request: ToolCallRequestWithId) -> ToolCallResult {
        if let Some(cached) = self.cache.get(&request.id).await {
            tracing::debug!("Tool call {} served from cache", request.id);
            return cached;
        }

        let Some(tool) = self.tools.get(&request.tool_name) else {
            let message = format!(
                "Tool '{}' does not exist. Available tools: {}",
                request.tool_name,
                self.tools.names().join(", ")
            );
            return ToolCallResult::failure(request, message);
        };

        let result = match tool.execute(request.tool_input_dict.clone()).await {
            Ok(output) => ToolCallResult::success(request, output),
            Err(e) => {
                tracing::warn!("Tool {} failed: {:#}", request.tool_name, e);
                ToolCallResult::failure(request, format!("{:#}", e))
            }
        };
        self.cache.insert(&result).await;
        result
    }
}

/// Rewrite tool messages as plain text for models without native tool calling.
pub(crate) fn flatten_tool_messages(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .map(|message| {
            if !message.tool_call_requests.is_empty() {
                let content = if message.content.trim().is_empty() {
                    let calls: Vec<serde_json::Value> = message
                        .tool_call_requests
                        .iter()
                        .map(|r| serde_json::json!({"tool_name": r.tool_name, "tool_input_dict": r.tool_input_dict}))
                        .collect();
                    let mut object = serde_json::Map::new();
                    object.insert(TOOL_CALLS_KEY.to_string(), serde_json::Value::Array(calls));
                    serde_json::Value::Object(object).to_string()
                } else {
                    message.content.clone()
                };
                Message::new(Role::Assistant, content)
            } else if !message.tool_call_results.is_empty() {
                let lines: Vec<String> = message
                    .tool_call_results
                    .iter()
                    .map(|r| {
                        format!(
                            "- {} with input {}:\n{}",
                            r.request.tool_name,
                            r.request.tool_input_dict,
                            r.content()
                        )
                    })
                    .collect();
                Message::user(format!("Tool call results:\n{}", lines.join("\n")))
            } else {
                message.clone()
            }
        })
        .collect()
}
