//! Agent runner: drives a run from resolved model to validated output.
//!
//! ```text
//! resolve model ─► build messages ─► failover driver ─► provider client
//!                                          ▲                  │
//!                                          │ tool results     ▼ tool calls
//!                                      tool loop ◄──────── answer?
//!                                                             │ final
//!                                                             ▼
//!                                         extract + validate ─► cost ─► RunOutput
//! ```
//!
//! [`AgentRunner::run`] returns the final output. [`AgentRunner::run_stream`] yields
//! validated partial snapshots while the model answers, then the final output.

mod failover;
mod stream;
mod tool_loop;

pub use stream::{PartialOutput, StreamEvent};
pub use tool_loop::MAX_TOOL_CALL_ITERATIONS;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::budget::compute_cost;
use crate::config::{ConfigError, EngineConfig};
use crate::error::RunError;
use crate::events::{EngineEvent, EventSink, NoopEventSink};
use crate::llm::{
    LlmUsage, Message, PromptTemplate, Provider, ProviderError, ProviderOptions, SharedProviderRegistry,
    ToolCallRequestWithId, ToolCallResult, ToolDefinition,
};
use crate::models::SharedModelRegistry;
use crate::output::{ExtractedOutput, OutputValidator};
use crate::prompt::{with_reserved_fields, FileDownloader, MessageBuilder, PromptOptions, ReservedFields};
use crate::task::{LlmCompletion, ProviderAttempt, RunOutput, RunProperties, TaskVariant};
use crate::tools::{ToolCallCache, ToolRegistry};

use failover::{CandidateClient, FailoverDriver, OpenedStream};
use tool_loop::{flatten_tool_messages, LoopState, ToolLoop};

/// Runs tasks against the configured models, providers and tools.
#[derive(Clone)]
pub struct AgentRunner {
    models: SharedModelRegistry,
    providers: SharedProviderRegistry,
    tools: Arc<ToolRegistry>,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
    downloader: FileDownloader,
}

impl AgentRunner {
    pub fn new(models: SharedModelRegistry, providers: SharedProviderRegistry, tools: Arc<ToolRegistry>) -> Self {
        Self {
            models,
            providers,
            tools,
            config: EngineConfig::default(),
            events: Arc::new(NoopEventSink),
            downloader: FileDownloader::new(),
        }
    }

    /// Runner with the configured model registry, the providers that have API keys and
    /// the caller's tools.
    pub fn from_config(config: EngineConfig, tools: ToolRegistry) -> Result<Self, ConfigError> {
        let models = Arc::new(config.load_model_registry()?);
        let providers = Arc::new(config.build_provider_registry());
        Ok(Self::new(models, providers, Arc::new(tools)).with_config(config))
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a task to completion.
    ///
    /// `cache` holds tool results of this run; pass the same cache when retrying it.
    pub async fn run(
        &self,
        task: &TaskVariant,
        input: &Value,
        properties: &RunProperties,
        cache: &ToolCallCache,
    ) -> Result<RunOutput, RunError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut trace = RunTrace::new(properties.model());

        let result = self
            .run_inner(run_id, started, task, input, properties, cache, &mut trace)
            .await;
        self.report(run_id, started, &trace, result.as_ref().err());
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        run_id: Uuid,
        started: Instant,
        task: &TaskVariant,
        input: &Value,
        properties: &RunProperties,
        cache: &ToolCallCache,
        trace: &mut RunTrace,
    ) -> Result<RunOutput, RunError> {
        let prepared = self.prepare(run_id, started, task, input, properties).await?;
        trace.model = prepared.model.clone();

        let driver = prepared.driver(self.events.as_ref(), self.config.provider_timeout());
        let mut tool_loop = ToolLoop::new(&prepared.tools, cache, self.config.max_tool_call_iterations);
        let mut state = LoopState::AwaitingModel;

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    let build = |index: usize, structured: bool| prepared.request(index, structured, tool_loop.history());
                    let served = driver.complete(&build, &mut trace.providers_tried).await?;
                    let output = served.value;
                    trace.record(&prepared, served.index, output.usage);
                    prepared.next_state(output.content.unwrap_or_default(), output.tool_calls)
                }
                LoopState::ExecutingTools { content, requests } => {
                    match tool_loop.execute_round(content, requests).await {
                        Ok(()) => LoopState::AwaitingModel,
                        Err(e) => LoopState::Failed(e),
                    }
                }
                LoopState::Done(extracted) => {
                    return Ok(prepared.output(extracted, tool_loop.into_results(), trace));
                }
                LoopState::Failed(e) => return Err(e),
            };
        }
    }

    /// Run a task, yielding partial snapshots and then a final or error event.
    ///
    /// Provider failover only happens before a provider yields its first chunk. Dropping
    /// the stream cancels in-flight provider and tool calls.
    pub fn run_stream(
        &self,
        task: TaskVariant,
        input: Value,
        properties: RunProperties,
        cache: ToolCallCache,
    ) -> BoxStream<'static, StreamEvent> {
        let runner = self.clone();
        let stream = async_stream::stream! {
            let run_id = Uuid::new_v4();
            let started = Instant::now();
            let mut trace = RunTrace::new(properties.model());

            let error: RunError = 'run: {
                let prepared = match runner.prepare(run_id, started, &task, &input, &properties).await {
                    Ok(prepared) => prepared,
                    Err(e) => break 'run e,
                };
                trace.model = prepared.model.clone();

                let timeout = runner.config.provider_timeout();
                let driver = prepared.driver(runner.events.as_ref(), timeout);
                let mut tool_loop = ToolLoop::new(&prepared.tools, &cache, runner.config.max_tool_call_iterations);
                let mut last_partial: Option<PartialOutput> = None;

                loop {
                    let build = |index: usize, structured: bool| prepared.request(index, structured, tool_loop.history());
                    let served = match driver.open_stream(&build, &mut trace.providers_tried).await {
                        Ok(served) => served,
                        Err(e) => break 'run e.into(),
                    };
                    let index = served.index;
                    let provider = prepared.candidates[index].candidate.provider;
                    let OpenedStream { first, mut rest } = served.value;

                    let mut pending = first.into_iter();
                    let mut content = String::new();
                    let mut tool_calls: Vec<ToolCallRequestWithId> = Vec::new();
                    let mut usage = LlmUsage::default();

                    loop {
                        let item = match pending.next() {
                            Some(delta) => Ok(delta),
                            None => match tokio::time::timeout(timeout, rest.next()).await {
                                Ok(Some(item)) => item,
                                Ok(None) => break,
                                Err(_) => Err(ProviderError::timeout(timeout)),
                            },
                        };
                        let delta = match item {
                            Ok(delta) => delta,
                            Err(e) => break 'run RunError::Provider(e.with_provider(provider)),
                        };

                        content.push_str(&delta.content);
                        tool_calls.extend(delta.tool_calls);
                        if let Some(u) = &delta.usage {
                            usage.merge(u);
                        }
                        if !delta.content.is_empty() {
                            if let Some(partial) = prepared.partial(&content, last_partial.as_ref()) {
                                last_partial = Some(partial.clone());
                                yield StreamEvent::Partial(partial);
                            }
                        }
                    }

                    trace.record(&prepared, index, usage);
                    match prepared.next_state(content, tool_calls) {
                        LoopState::ExecutingTools { content, requests } => {
                            if let Err(e) = tool_loop.execute_round(content, requests).await {
                                break 'run e;
                            }
                        }
                        LoopState::Done(extracted) => {
                            let output = prepared.output(extracted, tool_loop.into_results(), &trace);
                            runner.report(run_id, started, &trace, None);
                            yield StreamEvent::Final(output);
                            return;
                        }
                        LoopState::Failed(e) => break 'run e,
                        LoopState::AwaitingModel => {}
                    }
                }
            };

            runner.report(run_id, started, &trace, Some(&error));
            yield StreamEvent::Error(error.to_payload());
        };
        stream.boxed()
    }

    /// Resolve the model, check capabilities, fetch files and render the prompts.
    async fn prepare(
        &self,
        run_id: Uuid,
        started: Instant,
        task: &TaskVariant,
        input: &Value,
        properties: &RunProperties,
    ) -> Result<PreparedRun, RunError> {
        properties.validate()?;
        let resolved = self.models.resolve(properties.model(), properties.provider())?;
        let mut builder = MessageBuilder::new(task, properties.instructions(), input);

        let mut candidates = Vec::new();
        let mut capability_error = None;
        for candidate in resolved.candidates {
            if let Err(e) = builder.check_capabilities(&candidate.capabilities, &resolved.model) {
                tracing::warn!("Skipping {} for {}: {}", candidate.provider, resolved.model, e);
                capability_error.get_or_insert(e);
                continue;
            }
            let Some(client) = self.providers.get(candidate.provider) else {
                tracing::warn!("No client registered for {}, skipping", candidate.provider);
                continue;
            };
            candidates.push(CandidateClient { candidate, client });
        }
        if candidates.is_empty() {
            return Err(capability_error.unwrap_or_else(|| RunError::NoProviderAvailable(resolved.model.clone())));
        }

        builder
            .download_files(&self.downloader, |file| {
                candidates
                    .iter()
                    .any(|c| c.client.requires_downloading_file(file, &c.candidate.provider_model_id))
            })
            .await?;

        // A download can reveal the kind of a file whose URL did not
        let mut download_error = None;
        candidates.retain(|c| match builder.check_capabilities(&c.candidate.capabilities, &resolved.model) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Skipping {} for {} after download: {}", c.candidate.provider, resolved.model, e);
                download_error.get_or_insert(e);
                false
            }
        });
        if candidates.is_empty() {
            return Err(download_error.unwrap_or_else(|| RunError::NoProviderAvailable(resolved.model.clone())));
        }

        let tools = self.tools.subset(properties.enabled_tools());
        let tool_definitions = tools.definitions();
        let tools_enabled = !tools.is_empty();
        let chain_of_thought = properties.is_chain_of_thought_enabled();

        // Candidates sharing a template and tool calling style share a prompt
        let mut prompts: Vec<RenderedPrompt> = Vec::new();
        let mut prompt_index = Vec::with_capacity(candidates.len());
        for c in &candidates {
            let template = c.client.sanitize_template(PromptTemplate::default());
            let native_tools = c.candidate.capabilities.supports_tool_calling;
            if let Some(pos) = prompts
                .iter()
                .position(|p| p.template == template && p.native_tools == native_tools)
            {
                prompt_index.push(pos);
                continue;
            }

            let output_tools = tools_enabled && !native_tools;
            let output_schema = with_reserved_fields(
                &task.output_schema,
                ReservedFields {
                    reasoning_steps: chain_of_thought,
                    agent_run_result: tools_enabled,
                    tool_calls: output_tools,
                },
            );
            let messages = builder.build(&PromptOptions {
                template,
                output_schema: &output_schema,
                few_shot_examples: properties.few_shot_examples(),
                chain_of_thought,
                agent_run_result: tools_enabled,
                output_tools: if output_tools { &tool_definitions[..] } else { &[] },
            });
            prompt_index.push(prompts.len());
            prompts.push(RenderedPrompt {
                template,
                native_tools,
                output_schema,
                messages,
            });
        }

        tracing::debug!(
            "Run {} uses {} with providers {:?}",
            run_id,
            resolved.model,
            candidates.iter().map(|c| c.candidate.provider).collect::<Vec<_>>()
        );

        Ok(PreparedRun {
            run_id,
            started,
            model: resolved.model,
            candidates,
            prompts,
            prompt_index,
            validator: OutputValidator::new(&task.output_schema)?,
            tools,
            tool_definitions,
            properties: properties.clone(),
        })
    }

    fn report(&self, run_id: Uuid, started: Instant, trace: &RunTrace, error: Option<&RunError>) {
        let duration_seconds = started.elapsed().as_secs_f64();
        let cost_usd = trace.cost_usd();
        match error {
            None => tracing::info!(
                "Run {} completed with {} in {:.2}s, cost ${:.6}",
                run_id,
                trace.model,
                duration_seconds,
                cost_usd
            ),
            Some(e) => tracing::error!("Run {} with {} failed: {} ({})", run_id, trace.model, e, e.code()),
        }
        self.events.emit(EngineEvent::InferenceCompleted {
            run_id,
            model: trace.model.clone(),
            provider: trace.provider,
            cost_usd,
            duration_seconds,
            error_code: error.map(|e| e.code().to_string()),
            at: Utc::now(),
        });
    }
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("providers", &self.providers)
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Completions and attempts of a run, kept even when the run fails.
#[derive(Debug, Default)]
struct RunTrace {
    model: String,
    provider: Option<Provider>,
    completions: Vec<LlmCompletion>,
    providers_tried: Vec<ProviderAttempt>,
}

impl RunTrace {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, prepared: &PreparedRun, index: usize, usage: LlmUsage) {
        let candidate = &prepared.candidates[index].candidate;
        let cost = compute_cost(&usage, &candidate.pricing);
        self.provider = Some(candidate.provider);
        self.completions.push(LlmCompletion {
            provider: candidate.provider,
            model: prepared.model.clone(),
            usage,
            cost,
        });
    }

    fn cost_usd(&self) -> f64 {
        self.completions.iter().map(|c| c.cost.total_usd()).sum()
    }
}

#[derive(Debug)]
struct RenderedPrompt {
    template: PromptTemplate,
    native_tools: bool,
    output_schema: Value,
    messages: Vec<Message>,
}

/// Everything a run needs once the model is resolved.
struct PreparedRun {
    run_id: Uuid,
    started: Instant,
    model: String,
    candidates: Vec<CandidateClient>,
    prompts: Vec<RenderedPrompt>,
    /// Prompt of each candidate.
    prompt_index: Vec<usize>,
    validator: OutputValidator,
    tools: ToolRegistry,
    tool_definitions: Vec<ToolDefinition>,
    properties: RunProperties,
}

impl PreparedRun {
    fn driver<'a>(&'a self, events: &'a dyn EventSink, timeout: Duration) -> FailoverDriver<'a> {
        FailoverDriver {
            run_id: self.run_id,
            model: &self.model,
            candidates: &self.candidates,
            mode: self.properties.structured_generation(),
            timeout,
            events,
        }
    }

    fn request(&self, index: usize, structured: bool, history: &[Message]) -> (Vec<Message>, ProviderOptions) {
        let candidate = &self.candidates[index].candidate;
        let prompt = &self.prompts[self.prompt_index[index]];
        let capabilities = &candidate.capabilities;

        let mut messages = prompt.messages.clone();
        if prompt.native_tools {
            messages.extend_from_slice(history);
        } else {
            messages.extend(flatten_tool_messages(history));
        }

        let options = ProviderOptions {
            model: candidate.provider_model_id.clone(),
            temperature: self.properties.temperature(),
            max_tokens: self
                .properties
                .max_tokens()
                .map(|m| m.min(capabilities.max_output_tokens)),
            output_schema: prompt.output_schema.clone(),
            structured_generation: structured,
            json_mode: !structured && capabilities.supports_json_mode,
            tools: if prompt.native_tools {
                self.tool_definitions.clone()
            } else {
                Vec::new()
            },
        };
        (messages, options)
    }

    /// Decide what to do with a model answer.
    fn next_state(&self, content: String, native_calls: Vec<ToolCallRequestWithId>) -> LoopState {
        if !native_calls.is_empty() {
            return LoopState::ExecutingTools {
                content,
                requests: native_calls,
            };
        }
        let extracted = match self.validator.extract(&content, false) {
            Ok(extracted) => extracted,
            Err(e) => return LoopState::Failed(e),
        };
        if extracted.tool_calls.is_empty() {
            return LoopState::Done(extracted);
        }
        if self.tools.is_empty() {
            // Tool calls nobody offered: treat the answer as final
            return match self.validator.validate(&extracted.task_output) {
                Ok(()) => LoopState::Done(ExtractedOutput {
                    tool_calls: Vec::new(),
                    ..extracted
                }),
                Err(message) => LoopState::Failed(RunError::JsonSchemaValidation {
                    message,
                    output: Some(extracted.task_output),
                }),
            };
        }
        LoopState::ExecutingTools {
            content,
            requests: extracted.tool_calls,
        }
    }

    /// Snapshot of a partial answer, if it differs from the previous one.
    fn partial(&self, content: &str, previous: Option<&PartialOutput>) -> Option<PartialOutput> {
        let extracted = self.validator.extract(content, true).ok()?;
        let empty = extracted.task_output.as_object().map_or(true, |o| o.is_empty());
        if empty && extracted.reasoning_steps.is_empty() {
            return None;
        }
        let partial = PartialOutput {
            id: self.run_id,
            task_output: extracted.task_output,
            reasoning_steps: extracted.reasoning_steps,
        };
        if previous == Some(&partial) {
            return None;
        }
        Some(partial)
    }

    fn output(&self, extracted: ExtractedOutput, tool_calls: Vec<ToolCallResult>, trace: &RunTrace) -> RunOutput {
        RunOutput {
            id: self.run_id,
            task_output: extracted.task_output,
            tool_calls,
            reasoning_steps: extracted.reasoning_steps,
            agent_run_result: extracted.agent_run_result,
            model: self.model.clone(),
            provider: trace.provider,
            llm_completions: trace.completions.clone(),
            providers_tried: trace.providers_tried.clone(),
            cost_usd: trace.cost_usd(),
            duration_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventSink;
    use crate::llm::{ProviderDelta, ProviderOutput, ProviderRegistry};
    use crate::models::{ModelCapabilities, ModelData, ModelRegistry, ProviderModelData};
    use crate::budget::ModelPricing;
    use crate::test_support::ScriptedProvider;
    use crate::tools::FnTool;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task() -> TaskVariant {
        TaskVariant::new(
            json!({"type": "object", "properties": {"question": {"type": "string"}}}),
            json!({
                "type": "object",
                "properties": {"output": {"type": "string"}},
                "required": ["output"]
            }),
        )
    }

    fn runner(clients: Vec<Arc<ScriptedProvider>>, tools: ToolRegistry) -> AgentRunner {
        let mut providers = ProviderRegistry::new();
        for client in clients {
            providers.register(client);
        }
        AgentRunner::new(
            Arc::new(ModelRegistry::builtin().unwrap()),
            Arc::new(providers),
            Arc::new(tools),
        )
    }

    fn counting_tool(counter: Arc<AtomicUsize>) -> ToolRegistry {
        ToolRegistry::new().with(Arc::new(FnTool::new(
            "search",
            "Search the web",
            json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            move |args| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(format!("results for {}", args["q"]))
                })
            },
        )))
    }

    fn tool_call_output(q: &str) -> Result<ProviderOutput, ProviderError> {
        Ok(ProviderOutput {
            content: None,
            tool_calls: vec![ToolCallRequestWithId::new("search", json!({"q": q}))],
            usage: LlmUsage::tokens(50, 10),
            finish_reason: Some("tool_calls".into()),
        })
    }

    #[tokio::test]
    async fn test_gemini_fails_over_to_gemini_api() {
        let google = ScriptedProvider::new(Provider::Google);
        google.push_complete(Err(ProviderError::internal("vertex is down")));
        let gemini = ScriptedProvider::new(Provider::GoogleGemini);
        gemini.push_content(r#"{"output":"final"}"#);
        let runner = runner(vec![google.clone(), gemini.clone()], ToolRegistry::new());

        let props = RunProperties::builder("gemini-1.5-flash-002").build().unwrap();
        let output = runner
            .run(&task(), &json!({"question": "q"}), &props, &ToolCallCache::new())
            .await
            .unwrap();

        assert_eq!(output.task_output, json!({"output": "final"}));
        assert_eq!(output.provider, Some(Provider::GoogleGemini));
        let tried: Vec<Provider> = output.providers_tried.iter().map(|t| t.provider).collect();
        assert_eq!(tried, vec![Provider::Google, Provider::GoogleGemini]);
        assert_eq!(google.calls().len(), 1);
        assert_eq!(output.llm_completions.len(), 1);
        assert!(output.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn test_unsupported_image_makes_no_calls() {
        let groq = ScriptedProvider::new(Provider::Groq);
        let fireworks = ScriptedProvider::new(Provider::Fireworks);
        let runner = runner(vec![groq.clone(), fireworks.clone()], ToolRegistry::new());

        let task = TaskVariant::new(
            json!({"type": "object", "properties": {"file": {"$ref": "#/$defs/File"}}}),
            json!({"type": "object"}),
        );
        let props = RunProperties::builder("llama-3.3-70b").build().unwrap();
        let err = runner
            .run(
                &task,
                &json!({"file": {"url": "https://example.com/cat.png"}}),
                &props,
                &ToolCallCache::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "model_does_not_support_mode");
        assert!(groq.calls().is_empty());
        assert!(fireworks.calls().is_empty());
    }

    #[tokio::test]
    async fn test_native_tool_round() {
        let counter = Arc::new(AtomicUsize::new(0));
        let openai = ScriptedProvider::new(Provider::OpenAi);
        openai.push_complete(tool_call_output("rust"));
        openai.push_content(r#"{"output":"done"}"#);
        let runner = runner(vec![openai.clone()], counting_tool(counter.clone()));

        let props = RunProperties::builder("gpt-4o-latest")
            .provider(Provider::OpenAi)
            .tool("search")
            .build()
            .unwrap();
        let output = runner
            .run(&task(), &json!({"question": "q"}), &props, &ToolCallCache::new())
            .await
            .unwrap();

        assert_eq!(output.task_output, json!({"output": "done"}));
        assert_eq!(output.model, "gpt-4o-2024-11-20");
        assert_eq!(output.tool_calls.len(), 1);
        assert_eq!(output.tool_calls[0].result.as_deref(), Some("results for \"rust\""));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(output.llm_completions.len(), 2);

        let calls = openai.calls();
        assert_eq!(calls[0].options.tools.len(), 1);
        assert_eq!(calls[0].messages.len(), 2);
        // system, user, assistant requests, user results
        assert_eq!(calls[1].messages.len(), 4);
        assert_eq!(calls[1].messages[3].tool_call_results.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_tool_calls_are_recursion() {
        let openai = ScriptedProvider::new(Provider::OpenAi);
        openai.push_complete(tool_call_output("rust"));
        openai.push_complete(tool_call_output("rust"));
        let runner = runner(vec![openai], counting_tool(Arc::new(AtomicUsize::new(0))));

        let props = RunProperties::builder("gpt-4o-2024-11-20")
            .provider(Provider::OpenAi)
            .tool("search")
            .build()
            .unwrap();
        let err = runner
            .run(&task(), &json!({}), &props, &ToolCallCache::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tool_call_recursion");
    }

    #[tokio::test]
    async fn test_retried_run_reuses_cache() {
        let counter = Arc::new(AtomicUsize::new(0));
        let openai = ScriptedProvider::new(Provider::OpenAi);
        openai.push_complete(tool_call_output("rust"));
        openai.push_complete(Err(ProviderError::new(
            crate::llm::ProviderErrorKind::BadRequest,
            "context too long",
        )));
        openai.push_complete(tool_call_output("rust"));
        openai.push_content(r#"{"output":"done"}"#);
        let runner = runner(vec![openai], counting_tool(counter.clone()));
        let props = RunProperties::builder("gpt-4o-2024-11-20")
            .provider(Provider::OpenAi)
            .tool("search")
            .build()
            .unwrap();

        let cache = ToolCallCache::new();
        assert!(runner.run(&task(), &json!({}), &props, &cache).await.is_err());
        let output = runner.run(&task(), &json!({}), &props, &cache).await.unwrap();

        assert_eq!(output.task_output, json!({"output": "done"}));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tool_calls_through_output_field() {
        let capabilities = ModelCapabilities::text_only(32_000, 4_000);
        let models = ModelRegistry::new(
            vec![ModelData {
                id: "plain-model".into(),
                display_name: "Plain".into(),
                capabilities,
                providers: vec![ProviderModelData {
                    provider: Provider::MistralAi,
                    provider_model_id: None,
                    overrides: Default::default(),
                    pricing: Some(ModelPricing::per_million(1.0, 1.0)),
                }],
                deprecation: None,
            }],
            HashMap::new(),
        )
        .unwrap();
        let mistral = ScriptedProvider::new(Provider::MistralAi);
        mistral.push_content(r#"{"internal_tool_calls":[{"tool_name":"search","tool_input_dict":{"q":"x"}}]}"#);
        mistral.push_content(r#"{"output":"found","internal_agent_run_result":{"status":"success"}}"#);
        let runner = AgentRunner::new(
            Arc::new(models),
            Arc::new(ProviderRegistry::new().with(mistral.clone())),
            Arc::new(counting_tool(Arc::new(AtomicUsize::new(0)))),
        );

        let props = RunProperties::builder("plain-model").tool("search").build().unwrap();
        let output = runner
            .run(&task(), &json!({"question": "q"}), &props, &ToolCallCache::new())
            .await
            .unwrap();

        assert_eq!(output.task_output, json!({"output": "found"}));
        assert_eq!(output.tool_calls.len(), 1);
        let calls = mistral.calls();
        assert!(calls[0].options.tools.is_empty());
        assert!(calls[0].messages[0].content.contains("internal_tool_calls"));
        assert!(calls[1].messages[3].content.starts_with("Tool call results:"));
    }

    #[tokio::test]
    async fn test_declared_failure_and_events() {
        let openai = ScriptedProvider::new(Provider::OpenAi);
        openai.push_content(
            r#"{"output":"half","internal_agent_run_result":{"status":"failure","error_message":"no access"}}"#,
        );
        let (sink, mut rx) = ChannelEventSink::new();
        let runner = runner(vec![openai], counting_tool(Arc::new(AtomicUsize::new(0))))
            .with_event_sink(Arc::new(sink));
        let props = RunProperties::builder("gpt-4o-2024-11-20")
            .provider(Provider::OpenAi)
            .tool("search")
            .build()
            .unwrap();

        let err = runner
            .run(&task(), &json!({}), &props, &ToolCallCache::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "agent_run_failed");

        assert_eq!(rx.recv().await.unwrap().kind(), "provider_used");
        match rx.recv().await.unwrap() {
            EngineEvent::InferenceCompleted { error_code, cost_usd, .. } => {
                assert_eq!(error_code.as_deref(), Some("agent_run_failed"));
                assert!(cost_usd > 0.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_yields_partials_then_final() {
        let openai = ScriptedProvider::new(Provider::OpenAi);
        openai.push_stream(vec![
            Ok(ProviderDelta {
                content: r#"{"output": "fi"#.into(),
                ..Default::default()
            }),
            Ok(ProviderDelta {
                content: r#"nal"}"#.into(),
                usage: Some(LlmUsage::tokens(100, 5)),
                ..Default::default()
            }),
        ]);
        let runner = runner(vec![openai], ToolRegistry::new());
        let props = RunProperties::builder("gpt-4o-2024-11-20")
            .provider(Provider::OpenAi)
            .build()
            .unwrap();

        let events: Vec<StreamEvent> = runner
            .run_stream(task(), json!({}), props, ToolCallCache::new())
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        match &events[0] {
            StreamEvent::Partial(p) => assert_eq!(p.task_output, json!({"output": "fi"})),
            other => panic!("unexpected event {other:?}"),
        }
        match &events[2] {
            StreamEvent::Final(output) => {
                assert_eq!(output.task_output, json!({"output": "final"}));
                assert_eq!(output.llm_completions[0].usage.prompt_token_count, Some(100));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events[2].to_sse().contains("\"final\":true"));
    }

    #[tokio::test]
    async fn test_stream_error_after_first_chunk_is_fatal() {
        let google = ScriptedProvider::new(Provider::Google);
        google.push_stream(vec![
            Ok(ProviderDelta {
                content: r#"{"output": "pa"#.into(),
                ..Default::default()
            }),
            Err(ProviderError::internal("connection reset")),
        ]);
        let gemini = ScriptedProvider::new(Provider::GoogleGemini);
        let runner = runner(vec![google, gemini.clone()], ToolRegistry::new());
        let props = RunProperties::builder("gemini-1.5-flash-002").build().unwrap();

        let events: Vec<StreamEvent> = runner
            .run_stream(task(), json!({}), props, ToolCallCache::new())
            .collect()
            .await;

        assert!(matches!(events[0], StreamEvent::Partial(_)));
        match events.last().unwrap() {
            StreamEvent::Error(payload) => assert_eq!(payload.code, "provider_internal_error"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(gemini.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_streamable_provider_in_stream_mode() {
        let openai = ScriptedProvider::not_streamable(Provider::OpenAi);
        openai.push_content(r#"{"output":"whole"}"#);
        let runner = runner(vec![openai], ToolRegistry::new());
        let props = RunProperties::builder("gpt-4o-2024-11-20")
            .provider(Provider::OpenAi)
            .build()
            .unwrap();

        let events: Vec<StreamEvent> = runner
            .run_stream(task(), json!({}), props, ToolCallCache::new())
            .collect()
            .await;
        assert!(events.last().unwrap().is_final());
    }

    #[tokio::test]
    async fn test_user_only_template() {
        let openai = ScriptedProvider::with_template(Provider::OpenAi, PromptTemplate::UserOnly);
        openai.push_content(r#"{"output":"ok"}"#);
        let runner = runner(vec![openai.clone()], ToolRegistry::new());
        let props = RunProperties::builder("gpt-4o-2024-11-20")
            .provider(Provider::OpenAi)
            .instructions("Answer briefly")
            .build()
            .unwrap();

        runner
            .run(&task(), &json!({"question": "q"}), &props, &ToolCallCache::new())
            .await
            .unwrap();
        let calls = openai.calls();
        assert_eq!(calls[0].messages.len(), 1);
        assert!(calls[0].messages[0].content.starts_with("Answer briefly"));
        assert!(calls[0].options.structured_generation);
    }

    #[tokio::test]
    async fn test_pinned_provider_without_client() {
        let runner = runner(vec![], ToolRegistry::new());
        let props = RunProperties::builder("gpt-4o-2024-11-20")
            .provider(Provider::AzureOpenAi)
            .build()
            .unwrap();
        let err = runner
            .run(&task(), &json!({}), &props, &ToolCallCache::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no_provider_available");

        let props = RunProperties::builder("mistral-large-2411")
            .provider(Provider::OpenAi)
            .build()
            .unwrap();
        let err = runner
            .run(&task(), &json!({}), &props, &ToolCallCache::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider_does_not_support_model");
    }

    /// Serve one HTTP response on a local port and return its URL.
    async fn serve_once(content_type: &'static str, body: &'static [u8]) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                content_type,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        format!("http://{}/blob", addr)
    }

    #[tokio::test]
    async fn test_downloaded_image_is_checked_against_capabilities() {
        let url = serve_once("image/png", b"\x89PNG").await;
        let groq = ScriptedProvider::downloading_files(Provider::Groq);
        let fireworks = ScriptedProvider::new(Provider::Fireworks);
        let runner = runner(vec![groq.clone(), fireworks.clone()], ToolRegistry::new());

        let task = TaskVariant::new(
            json!({"type": "object", "properties": {"file": {"$ref": "#/$defs/File"}}}),
            json!({"type": "object"}),
        );
        let props = RunProperties::builder("llama-3.3-70b").build().unwrap();
        let err = runner
            .run(&task, &json!({"file": {"url": url}}), &props, &ToolCallCache::new())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "model_does_not_support_mode");
        assert!(groq.calls().is_empty());
        assert!(fireworks.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stream_fails_over_when_only_role_chunk_was_received() {
        let google = ScriptedProvider::new(Provider::Google);
        google.push_stream(vec![
            Ok(ProviderDelta::default()),
            Err(ProviderError::internal("upstream 500")),
        ]);
        let gemini = ScriptedProvider::new(Provider::GoogleGemini);
        gemini.push_stream(vec![
            Ok(ProviderDelta::default()),
            Ok(ProviderDelta {
                content: r#"{"output":"from gemini"}"#.into(),
                ..Default::default()
            }),
        ]);
        let runner = runner(vec![google, gemini.clone()], ToolRegistry::new());
        let props = RunProperties::builder("gemini-1.5-flash-002").build().unwrap();

        let events: Vec<StreamEvent> = runner
            .run_stream(task(), json!({}), props, ToolCallCache::new())
            .collect()
            .await;

        assert_eq!(gemini.calls().len(), 1);
        match events.last().unwrap() {
            StreamEvent::Final(output) => {
                assert_eq!(output.task_output, json!({"output": "from gemini"}));
                assert_eq!(output.provider, Some(Provider::GoogleGemini));
                assert_eq!(output.providers_tried.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_stalling_after_content_times_out() {
        let google = ScriptedProvider::new(Provider::Google);
        google.push_stream_then_stall(vec![Ok(ProviderDelta {
            content: r#"{"output": "pa"#.into(),
            ..Default::default()
        })]);
        let gemini = ScriptedProvider::new(Provider::GoogleGemini);
        let config = EngineConfig {
            provider_timeout_secs: 5,
            ..Default::default()
        };
        let runner = runner(vec![google, gemini.clone()], ToolRegistry::new()).with_config(config);
        let props = RunProperties::builder("gemini-1.5-flash-002").build().unwrap();

        let events: Vec<StreamEvent> = runner
            .run_stream(task(), json!({}), props, ToolCallCache::new())
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Partial(_)));
        match &events[1] {
            StreamEvent::Error(payload) => assert_eq!(payload.code, "provider_internal_error"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(gemini.calls().is_empty());
    }
}
