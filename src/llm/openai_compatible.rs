//! Client for OpenAI-compatible chat completion APIs.
//!
//! OpenAI, Groq, Fireworks, Mistral and the Gemini API all expose the same
//! `/chat/completions` shape, so one client covers them. Retries are not done here: a
//! failed call is classified and handed back to the failover driver.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{classify_error_body, ProviderError, ProviderErrorKind};
use super::{
    File, FileKind, LlmUsage, Message, Provider, ProviderClient, ProviderDelta, ProviderOptions,
    ProviderOutput, ProviderStream, Role, ToolCallRequestWithId,
};

/// Chat completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleClient {
    client: Client,
    provider: Provider,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleClient {
    pub fn new(provider: Provider, base_url: String, api_key: String) -> Self {
        let mut base_url = base_url;
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: Client::new(),
            provider,
            base_url,
            api_key,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    /// Create a ProviderError from HTTP response status and body.
    fn create_error(&self, status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
        let kind = classify_error_body(status, body);
        ProviderError::new(kind, truncate(body, 2000))
            .with_status(status)
            .with_retry_after(retry_after)
            .with_provider(self.provider)
    }

    fn network_error(&self, e: reqwest::Error) -> ProviderError {
        let err = if e.is_timeout() {
            ProviderError::new(ProviderErrorKind::Timeout, format!("Request timeout: {}", e))
        } else if e.is_connect() {
            ProviderError::unavailable(format!("Connection failed: {}", e))
        } else {
            ProviderError::internal(format!("Request failed: {}", e))
        };
        err.with_provider(self.provider)
    }

    fn build_request(&self, messages: &[Message], options: &ProviderOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": options.model,
            "messages": convert_messages(messages),
            "temperature": options.temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if options.structured_generation {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "output",
                    "schema": options.output_schema,
                    "strict": false,
                }
            });
        } else if options.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if !options.tools.is_empty() {
            body["tools"] = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tool_choice"] = json!("auto");
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<ProviderOutput, ProviderError> {
        let request = self.build_request(messages, options, false);
        tracing::debug!(
            "Sending request to {}: model={}, structured={}",
            self.provider,
            options.model,
            options.structured_generation
        );

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(self.create_error(status.as_u16(), &body, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::internal(format!(
                "Failed to parse response: {}, body: {}",
                e,
                truncate(&body, 500)
            ))
            .with_provider(self.provider)
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            ProviderError::internal("No choices in response").with_provider(self.provider)
        })?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(ProviderError::new(
                ProviderErrorKind::ContentModeration,
                "Completion was blocked by the provider's content filter",
            )
            .with_provider(self.provider));
        }

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| parse_tool_call(&c.function.name, &c.function.arguments))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.with_provider(self.provider))?;

        Ok(ProviderOutput {
            content: choice.message.content,
            tool_calls,
            usage: parsed.usage.map(UsagePayload::into_usage).unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<ProviderStream, ProviderError> {
        let request = self.build_request(messages, options, true);
        let provider = self.provider;
        tracing::debug!("Opening stream to {}: model={}", provider, options.model);

        let mut source = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .eventsource()
            .map_err(|e| ProviderError::internal(format!("Cannot open stream: {}", e)).with_provider(provider))?;

        let stream = async_stream::stream! {
            // Tool call fragments keyed by their index in the choice
            let mut pending_calls: BTreeMap<u64, (String, String)> = BTreeMap::new();

            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        if message.data.trim() == "[DONE]" {
                            break;
                        }
                        let chunk: StreamChunk = match serde_json::from_str(&message.data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                yield Err(ProviderError::internal(format!("Invalid stream chunk: {}", e)).with_provider(provider));
                                break;
                            }
                        };

                        let mut delta = ProviderDelta {
                            usage: chunk.usage.map(UsagePayload::into_usage),
                            ..Default::default()
                        };
                        if let Some(choice) = chunk.choices.into_iter().next() {
                            if let Some(content) = choice.delta.content {
                                delta.content = content;
                            }
                            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                                let entry = pending_calls.entry(fragment.index).or_default();
                                if let Some(function) = fragment.function {
                                    if let Some(name) = function.name {
                                        entry.0.push_str(&name);
                                    }
                                    if let Some(arguments) = function.arguments {
                                        entry.1.push_str(&arguments);
                                    }
                                }
                            }
                            if let Some(reason) = choice.finish_reason {
                                if reason == "content_filter" {
                                    yield Err(ProviderError::new(
                                        ProviderErrorKind::ContentModeration,
                                        "Completion was blocked by the provider's content filter",
                                    ).with_provider(provider));
                                    break;
                                }
                                for (_, (name, arguments)) in std::mem::take(&mut pending_calls) {
                                    match parse_tool_call(&name, &arguments) {
                                        Ok(call) => delta.tool_calls.push(call),
                                        Err(e) => {
                                            yield Err(e.with_provider(provider));
                                            return;
                                        }
                                    }
                                }
                                delta.finish_reason = Some(reason);
                            }
                        }
                        yield Ok(delta);
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let body = response.text().await.unwrap_or_default();
                        let kind = classify_error_body(status.as_u16(), &body);
                        yield Err(ProviderError::new(kind, truncate(&body, 2000))
                            .with_status(status.as_u16())
                            .with_provider(provider));
                        break;
                    }
                    Err(e) => {
                        yield Err(ProviderError::internal(format!("Stream error: {}", e)).with_provider(provider));
                        break;
                    }
                }
            }
            source.close();
        };

        Ok(Box::pin(stream))
    }

    fn requires_downloading_file(&self, file: &File, _model: &str) -> bool {
        // Only image URLs are fetched by these APIs themselves.
        file.kind() != FileKind::Image
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

fn parse_tool_call(name: &str, arguments: &str) -> Result<ToolCallRequestWithId, ProviderError> {
    let input = if arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(arguments).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::FailedGeneration,
                format!("Tool call '{}' has invalid arguments: {}", name, e),
            )
        })?
    };
    Ok(ToolCallRequestWithId::new(name, input))
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => out.push(json!({"role": "system", "content": message.content})),
            Role::Assistant => {
                let mut m = json!({"role": "assistant", "content": message.content});
                if !message.tool_call_requests.is_empty() {
                    m["tool_calls"] = message
                        .tool_call_requests
                        .iter()
                        .map(|r| {
                            json!({
                                "id": r.id,
                                "type": "function",
                                "function": {
                                    "name": r.tool_name,
                                    "arguments": r.tool_input_dict.to_string(),
                                }
                            })
                        })
                        .collect();
                }
                out.push(m);
            }
            Role::User => {
                for result in &message.tool_call_results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": result.request.id,
                        "content": result.content(),
                    }));
                }
                if message.files.is_empty() {
                    if !message.content.is_empty() || message.tool_call_results.is_empty() {
                        out.push(json!({"role": "user", "content": message.content}));
                    }
                    continue;
                }
                let mut parts = vec![json!({"type": "text", "text": message.content})];
                for f in &message.files {
                    if let Some(part) = file_part(&f.file) {
                        parts.push(part);
                    }
                }
                out.push(json!({"role": "user", "content": parts}));
            }
        }
    }
    out
}

fn file_part(file: &File) -> Option<Value> {
    let url = file.to_url()?;
    match file.kind() {
        FileKind::Image => Some(json!({"type": "image_url", "image_url": {"url": url}})),
        FileKind::Audio => {
            let format = file
                .resolved_content_type()
                .and_then(|ct| ct.strip_prefix("audio/").map(str::to_string))
                .map(|f| if f == "mpeg" { "mp3".to_string() } else { f })
                .unwrap_or_else(|| "wav".to_string());
            Some(json!({
                "type": "input_audio",
                "input_audio": {"data": file.data.clone().unwrap_or_default(), "format": format}
            }))
        }
        _ => Some(json!({"type": "file", "file": {"file_data": url}})),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallPayload>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    function: FunctionPayload,
}

#[derive(Debug, Deserialize)]
struct FunctionPayload {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: u64,
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

/// Usage data (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct UsagePayload {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

impl UsagePayload {
    fn into_usage(self) -> LlmUsage {
        LlmUsage {
            prompt_token_count: Some(self.prompt_tokens),
            completion_token_count: Some(self.completion_tokens),
            prompt_token_count_cached: self.prompt_tokens_details.and_then(|d| d.cached_tokens),
            reasoning_token_count: self.completion_tokens_details.and_then(|d| d.reasoning_tokens),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FileWithKeyPath, KeyPathSegment, ToolCallResult, ToolDefinition};

    fn client() -> OpenAiCompatibleClient {
        OpenAiCompatibleClient::new(Provider::OpenAi, "https://api.example.com/v1/".into(), "k".into())
    }

    #[test]
    fn test_build_request_structured() {
        let options = ProviderOptions {
            model: "gpt-4o".into(),
            output_schema: json!({"type": "object"}),
            structured_generation: true,
            tools: vec![ToolDefinition {
                name: "search".into(),
                description: "Search".into(),
                parameters: json!({"type": "object"}),
            }],
            ..Default::default()
        };
        let body = client().build_request(&[Message::user("hi")], &options, false);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert!(body.get("stream").is_none());
        assert_eq!(client().completions_url(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn test_convert_tool_round() {
        let request = ToolCallRequestWithId::new("search", json!({"q": "x"}));
        let messages = vec![
            Message::tool_requests("", vec![request.clone()]),
            Message::tool_results(vec![ToolCallResult::success(request.clone(), "found")]),
        ];
        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0]["tool_calls"][0]["id"], request.id.as_str());
        assert_eq!(converted[1]["role"], "tool");
        assert_eq!(converted[1]["content"], "found");
    }

    #[test]
    fn test_convert_files_to_parts() {
        let message = Message::user("Input is a single file").with_files(vec![FileWithKeyPath {
            file: File::from_url("https://x.com/cat.png"),
            key_path: vec![KeyPathSegment::Key("image".into())],
        }]);
        let converted = convert_messages(&[message]);
        assert_eq!(converted[0]["content"][1]["type"], "image_url");
        assert_eq!(converted[0]["content"][1]["image_url"]["url"], "https://x.com/cat.png");
    }

    #[test]
    fn test_parse_tool_call_arguments() {
        assert!(parse_tool_call("t", "").unwrap().tool_input_dict.is_object());
        assert_eq!(
            parse_tool_call("t", "{oops").unwrap_err().kind,
            ProviderErrorKind::FailedGeneration
        );
    }
}
