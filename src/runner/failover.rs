//! Provider failover.
//!
//! Candidates are tried in order. Each attempt ends in an [`AttemptOutcome`]:
//! a structured-generation rejection in `Auto` mode retries the same candidate once
//! without it, retryable errors move to the next candidate, anything else stops the
//! run. When every candidate failed, the first retryable error is returned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use crate::events::{EngineEvent, EventSink};
use crate::llm::{
    Message, ProviderClient, ProviderDelta, ProviderError, ProviderErrorKind, ProviderOptions,
    ProviderOutput, ProviderStream,
};
use crate::models::ProviderCandidate;
use crate::task::{ProviderAttempt, StructuredGenerationMode};

/// A candidate together with the client that serves it.
#[derive(Clone)]
pub(crate) struct CandidateClient {
    pub candidate: ProviderCandidate,
    pub client: Arc<dyn ProviderClient>,
}

/// Result of one provider call, as seen by the failover loop.
#[derive(Debug)]
pub(crate) enum AttemptOutcome<T> {
    Success(T),
    /// Same candidate again, structured generation disabled.
    RetryWithoutStructured(ProviderError),
    NextCandidate(ProviderError),
    Fatal(ProviderError),
}

impl<T> AttemptOutcome<T> {
    pub fn classify(result: Result<T, ProviderError>, structured: bool, mode: StructuredGenerationMode) -> Self {
        let error = match result {
            Ok(value) => return Self::Success(value),
            Err(error) => error,
        };
        if error.kind == ProviderErrorKind::StructuredGeneration {
            return if structured && mode == StructuredGenerationMode::Auto {
                Self::RetryWithoutStructured(error)
            } else {
                Self::Fatal(error)
            };
        }
        if error.is_retryable() {
            Self::NextCandidate(error)
        } else {
            Self::Fatal(error)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Attempt {
    pub index: usize,
    pub structured: bool,
}

/// Attempt order and error bookkeeping, shared by the complete and stream paths.
#[derive(Debug)]
pub(crate) struct FailoverPlan {
    queue: VecDeque<Attempt>,
    first_error: Option<ProviderError>,
}

impl FailoverPlan {
    pub fn new(candidates: &[CandidateClient], mode: StructuredGenerationMode) -> Self {
        let queue = candidates
            .iter()
            .enumerate()
            .map(|(index, c)| Attempt {
                index,
                structured: structured_for(mode, c.candidate.capabilities.supports_structured_output),
            })
            .collect();
        Self {
            queue,
            first_error: None,
        }
    }

    pub fn next(&mut self) -> Option<Attempt> {
        self.queue.pop_front()
    }

    /// Apply an outcome to the plan. Returns the value on success, the error when the
    /// run must stop, and `None` when another attempt should be made.
    pub fn settle<T>(&mut self, attempt: Attempt, outcome: AttemptOutcome<T>) -> Option<Result<T, ProviderError>> {
        match outcome {
            AttemptOutcome::Success(value) => Some(Ok(value)),
            AttemptOutcome::RetryWithoutStructured(_) => {
                self.queue.push_front(Attempt {
                    index: attempt.index,
                    structured: false,
                });
                None
            }
            AttemptOutcome::NextCandidate(error) => {
                self.first_error.get_or_insert(error);
                None
            }
            AttemptOutcome::Fatal(error) => Some(Err(error)),
        }
    }

    pub fn exhausted(self, model: &str) -> ProviderError {
        self.first_error
            .unwrap_or_else(|| ProviderError::unavailable(format!("No provider could serve model {}", model)))
    }
}

/// Effective structured generation flag for a candidate.
pub(crate) fn structured_for(mode: StructuredGenerationMode, supported: bool) -> bool {
    match mode {
        StructuredGenerationMode::ForceOn => true,
        StructuredGenerationMode::ForceOff => false,
        StructuredGenerationMode::Auto => supported,
    }
}

/// A value produced by a candidate.
#[derive(Debug)]
pub(crate) struct Served<T> {
    pub value: T,
    pub index: usize,
    pub structured: bool,
}

/// A stream whose leading deltas were read ahead.
///
/// `first` ends with the first delta carrying content or tool calls, unless the stream
/// ended before one arrived.
pub(crate) struct OpenedStream {
    pub first: Vec<ProviderDelta>,
    pub rest: ProviderStream,
}

/// Builds the messages and options for a candidate index and structured flag.
pub(crate) type RequestBuilder<'a> = dyn Fn(usize, bool) -> (Vec<Message>, ProviderOptions) + Send + Sync + 'a;

pub(crate) struct FailoverDriver<'a> {
    pub run_id: Uuid,
    pub model: &'a str,
    pub candidates: &'a [CandidateClient],
    pub mode: StructuredGenerationMode,
    pub timeout: Duration,
    pub events: &'a dyn EventSink,
}

impl<'a> FailoverDriver<'a> {
    pub async fn complete(
        &self,
        build: &RequestBuilder<'_>,
        tried: &mut Vec<ProviderAttempt>,
    ) -> Result<Served<ProviderOutput>, ProviderError> {
        let mut plan = FailoverPlan::new(self.candidates, self.mode);
        while let Some(attempt) = plan.next() {
            let entry = &self.candidates[attempt.index];
            let (messages, options) = build(attempt.index, attempt.structured);
            tracing::debug!(
                "Calling {} for {} (structured generation: {})",
                entry.candidate.provider,
                options.model,
                attempt.structured
            );
            let result = self.call_complete(entry, &messages, &options).await;
            let outcome = AttemptOutcome::classify(result, attempt.structured, self.mode);
            self.record(attempt, &outcome, tried);
            if let Some(result) = plan.settle(attempt, outcome) {
                return result.map(|value| Served {
                    value,
                    index: attempt.index,
                    structured: attempt.structured,
                });
            }
        }
        Err(plan.exhausted(self.model))
    }

    /// Open a stream, failing over until a candidate yields its first chunk.
    pub async fn open_stream(
        &self,
        build: &RequestBuilder<'_>,
        tried: &mut Vec<ProviderAttempt>,
    ) -> Result<Served<OpenedStream>, ProviderError> {
        let mut plan = FailoverPlan::new(self.candidates, self.mode);
        while let Some(attempt) = plan.next() {
            let entry = &self.candidates[attempt.index];
            let (messages, options) = build(attempt.index, attempt.structured);
            tracing::debug!(
                "Streaming from {} for {} (structured generation: {})",
                entry.candidate.provider,
                options.model,
                attempt.structured
            );
            let result = self.call_stream(entry, &messages, &options).await;
            let outcome = AttemptOutcome::classify(result, attempt.structured, self.mode);
            self.record(attempt, &outcome, tried);
            if let Some(result) = plan.settle(attempt, outcome) {
                return result.map(|value| Served {
                    value,
                    index: attempt.index,
                    structured: attempt.structured,
                });
            }
        }
        Err(plan.exhausted(self.model))
    }

    async fn call_complete(
        &self,
        entry: &CandidateClient,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<ProviderOutput, ProviderError> {
        let provider = entry.candidate.provider;
        tokio::time::timeout(self.timeout, entry.client.complete(messages, options))
            .await
            .map_err(|_| ProviderError::timeout(self.timeout))
            .and_then(|r| r)
            .map_err(|e| e.with_provider(provider))
    }

    async fn call_stream(
        &self,
        entry: &CandidateClient,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<OpenedStream, ProviderError> {
        let provider = entry.candidate.provider;

        if !entry.client.is_streamable(&options.model) {
            let output = self.call_complete(entry, messages, options).await?;
            return Ok(OpenedStream {
                first: vec![ProviderDelta {
                    content: output.content.unwrap_or_default(),
                    tool_calls: output.tool_calls,
                    usage: Some(output.usage),
                    finish_reason: output.finish_reason,
                }],
                rest: futures::stream::empty().boxed(),
            });
        }

        let mut stream = tokio::time::timeout(self.timeout, entry.client.stream(messages, options))
            .await
            .map_err(|_| ProviderError::timeout(self.timeout))
            .and_then(|r| r)
            .map_err(|e| e.with_provider(provider))?;

        // Read ahead past role-only and usage-only deltas
        let mut first = Vec::new();
        loop {
            match tokio::time::timeout(self.timeout, stream.next()).await {
                Err(_) => return Err(ProviderError::timeout(self.timeout).with_provider(provider)),
                Ok(Some(Err(e))) => return Err(e.with_provider(provider)),
                Ok(Some(Ok(delta))) => {
                    let visible = !delta.content.is_empty() || !delta.tool_calls.is_empty();
                    first.push(delta);
                    if visible {
                        break;
                    }
                }
                Ok(None) => break,
            }
        }
        Ok(OpenedStream { first, rest: stream })
    }

    fn record<T>(&self, attempt: Attempt, outcome: &AttemptOutcome<T>, tried: &mut Vec<ProviderAttempt>) {
        let provider = self.candidates[attempt.index].candidate.provider;
        let error = match outcome {
            AttemptOutcome::Success(_) => None,
            AttemptOutcome::RetryWithoutStructured(e)
            | AttemptOutcome::NextCandidate(e)
            | AttemptOutcome::Fatal(e) => Some(e),
        };

        tried.push(ProviderAttempt {
            provider,
            structured_generation: attempt.structured,
            error: error.map(|e| e.code().to_string()),
        });

        match (error, outcome) {
            (None, _) => self.events.emit(EngineEvent::ProviderUsed {
                run_id: self.run_id,
                provider,
                model: self.model.to_string(),
                structured_generation: attempt.structured,
                at: Utc::now(),
            }),
            (Some(e), outcome) => {
                match outcome {
                    AttemptOutcome::RetryWithoutStructured(_) => tracing::info!(
                        "{} rejected structured generation for {}, retrying without it: {}",
                        provider,
                        self.model,
                        e
                    ),
                    AttemptOutcome::NextCandidate(_) => {
                        tracing::warn!("{} failed for {}, trying next provider: {}", provider, self.model, e)
                    }
                    _ => tracing::warn!("{} failed for {}: {}", provider, self.model, e),
                }
                self.events.emit(EngineEvent::ProviderAttemptFailed {
                    run_id: self.run_id,
                    provider,
                    model: self.model.to_string(),
                    structured_generation: attempt.structured,
                    error_code: e.code().to_string(),
                    at: Utc::now(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventSink;
    use crate::llm::{LlmUsage, Provider};
    use crate::models::ModelCapabilities;
    use crate::budget::ModelPricing;
    use crate::test_support::ScriptedProvider;

    fn candidate(provider: Provider, client: Arc<ScriptedProvider>, structured: bool) -> CandidateClient {
        let mut capabilities = ModelCapabilities::text_only(100_000, 1_000);
        capabilities.supports_structured_output = structured;
        CandidateClient {
            candidate: ProviderCandidate {
                provider,
                provider_model_id: "model-x".into(),
                capabilities,
                pricing: ModelPricing::per_million(1.0, 2.0),
            },
            client,
        }
    }

    fn ok(content: &str) -> Result<ProviderOutput, ProviderError> {
        Ok(ProviderOutput {
            content: Some(content.to_string()),
            usage: LlmUsage::tokens(10, 5),
            ..Default::default()
        })
    }

    fn build(_: usize, structured: bool) -> (Vec<Message>, ProviderOptions) {
        (
            vec![Message::user("hi")],
            ProviderOptions {
                model: "model-x".into(),
                structured_generation: structured,
                ..Default::default()
            },
        )
    }

    fn driver<'a>(candidates: &'a [CandidateClient], mode: StructuredGenerationMode) -> FailoverDriver<'a> {
        FailoverDriver {
            run_id: Uuid::nil(),
            model: "model-x",
            candidates,
            mode,
            timeout: Duration::from_secs(5),
            events: &NoopEventSink,
        }
    }

    #[test]
    fn test_classify() {
        use StructuredGenerationMode::*;
        let sg = || Err::<(), _>(ProviderError::structured_generation("bad schema"));
        assert!(matches!(AttemptOutcome::classify(sg(), true, Auto), AttemptOutcome::RetryWithoutStructured(_)));
        assert!(matches!(AttemptOutcome::classify(sg(), true, ForceOn), AttemptOutcome::Fatal(_)));
        assert!(matches!(
            AttemptOutcome::classify(Err::<(), _>(ProviderError::internal("x")), false, Auto),
            AttemptOutcome::NextCandidate(_)
        ));
        assert!(matches!(
            AttemptOutcome::classify(Err::<(), _>(ProviderError::invalid_file("x")), false, Auto),
            AttemptOutcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_fails_over_in_order() {
        let a = ScriptedProvider::new(Provider::Google);
        a.push_complete(Err(ProviderError::internal("boom")));
        let b = ScriptedProvider::new(Provider::GoogleGemini);
        b.push_complete(ok("{}"));
        let candidates = vec![
            candidate(Provider::Google, a.clone(), false),
            candidate(Provider::GoogleGemini, b.clone(), false),
        ];

        let mut tried = Vec::new();
        let served = driver(&candidates, StructuredGenerationMode::Auto)
            .complete(&build, &mut tried)
            .await
            .unwrap();

        assert_eq!(served.index, 1);
        assert_eq!(a.calls().len(), 1);
        assert_eq!(b.calls().len(), 1);
        let providers: Vec<Provider> = tried.iter().map(|t| t.provider).collect();
        assert_eq!(providers, vec![Provider::Google, Provider::GoogleGemini]);
        assert_eq!(tried[0].error.as_deref(), Some("provider_internal_error"));
    }

    #[tokio::test]
    async fn test_structured_retry_makes_two_calls() {
        let a = ScriptedProvider::new(Provider::OpenAi);
        a.push_complete(Err(ProviderError::structured_generation("schema rejected")));
        a.push_complete(ok("{}"));
        let b = ScriptedProvider::new(Provider::AzureOpenAi);
        b.push_complete(ok("{}"));
        let candidates = vec![
            candidate(Provider::OpenAi, a.clone(), true),
            candidate(Provider::AzureOpenAi, b.clone(), true),
        ];

        let mut tried = Vec::new();
        let served = driver(&candidates, StructuredGenerationMode::Auto)
            .complete(&build, &mut tried)
            .await
            .unwrap();

        assert_eq!(served.index, 0);
        assert!(!served.structured);
        let flags: Vec<bool> = a.calls().iter().map(|c| c.options.structured_generation).collect();
        assert_eq!(flags, vec![true, false]);
        assert!(b.calls().is_empty());
        assert_eq!(tried.len(), 2);
    }

    #[tokio::test]
    async fn test_forced_structured_failure_is_fatal() {
        let a = ScriptedProvider::new(Provider::OpenAi);
        a.push_complete(Err(ProviderError::structured_generation("schema rejected")));
        let b = ScriptedProvider::new(Provider::AzureOpenAi);
        let candidates = vec![
            candidate(Provider::OpenAi, a.clone(), false),
            candidate(Provider::AzureOpenAi, b.clone(), false),
        ];

        let mut tried = Vec::new();
        let err = driver(&candidates, StructuredGenerationMode::ForceOn)
            .complete(&build, &mut tried)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "structured_generation_error");
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let a = ScriptedProvider::new(Provider::Groq);
        a.push_complete(Err(ProviderError::unavailable("a down")));
        let b = ScriptedProvider::new(Provider::Fireworks);
        b.push_complete(Err(ProviderError::internal("b broke")));
        let candidates = vec![
            candidate(Provider::Groq, a, false),
            candidate(Provider::Fireworks, b, false),
        ];

        let mut tried = Vec::new();
        let err = driver(&candidates, StructuredGenerationMode::Auto)
            .complete(&build, &mut tried)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");
        assert_eq!(err.provider, Some(Provider::Groq));
        assert_eq!(tried.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_fails_over_before_first_chunk() {
        let a = ScriptedProvider::new(Provider::Google);
        a.push_stream(vec![Err(ProviderError::internal("boom"))]);
        let b = ScriptedProvider::new(Provider::GoogleGemini);
        b.push_stream(vec![
            Ok(ProviderDelta {
                content: "{\"output\":".into(),
                ..Default::default()
            }),
            Ok(ProviderDelta {
                content: "\"final\"}".into(),
                ..Default::default()
            }),
        ]);
        let candidates = vec![
            candidate(Provider::Google, a, false),
            candidate(Provider::GoogleGemini, b, false),
        ];

        let mut tried = Vec::new();
        let served = driver(&candidates, StructuredGenerationMode::Auto)
            .open_stream(&build, &mut tried)
            .await
            .unwrap();
        assert_eq!(served.index, 1);
        assert_eq!(served.value.first.len(), 1);
        assert_eq!(served.value.first[0].content, "{\"output\":");
        let rest: Vec<_> = served.value.rest.collect().await;
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_fails_over_after_role_only_chunk() {
        let a = ScriptedProvider::new(Provider::Google);
        a.push_stream(vec![
            Ok(ProviderDelta::default()),
            Err(ProviderError::internal("upstream 500")),
        ]);
        let b = ScriptedProvider::new(Provider::GoogleGemini);
        b.push_stream(vec![
            Ok(ProviderDelta::default()),
            Ok(ProviderDelta {
                content: "{}".into(),
                ..Default::default()
            }),
        ]);
        let candidates = vec![
            candidate(Provider::Google, a, false),
            candidate(Provider::GoogleGemini, b.clone(), false),
        ];

        let mut tried = Vec::new();
        let served = driver(&candidates, StructuredGenerationMode::Auto)
            .open_stream(&build, &mut tried)
            .await
            .unwrap();

        assert_eq!(served.index, 1);
        assert_eq!(b.calls().len(), 1);
        assert_eq!(tried[0].error.as_deref(), Some("provider_internal_error"));
        // Leading empty chunks are kept
        let first: Vec<&str> = served.value.first.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(first, vec!["", "{}"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_moves_to_next_candidate() {
        let a = ScriptedProvider::new(Provider::Groq);
        a.push_stall();
        let b = ScriptedProvider::new(Provider::Fireworks);
        b.push_complete(ok("{}"));
        let candidates = vec![
            candidate(Provider::Groq, a, false),
            candidate(Provider::Fireworks, b, false),
        ];

        let mut tried = Vec::new();
        let served = driver(&candidates, StructuredGenerationMode::Auto)
            .complete(&build, &mut tried)
            .await
            .unwrap();

        assert_eq!(served.index, 1);
        assert_eq!(tried[0].provider, Provider::Groq);
        assert_eq!(tried[0].error.as_deref(), Some("provider_internal_error"));
        assert_eq!(tried[1].error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_stalled_before_content_moves_to_next_candidate() {
        let a = ScriptedProvider::new(Provider::Groq);
        a.push_stream_then_stall(vec![Ok(ProviderDelta::default())]);
        let b = ScriptedProvider::new(Provider::Fireworks);
        b.push_stream(vec![Ok(ProviderDelta {
            content: "{}".into(),
            ..Default::default()
        })]);
        let candidates = vec![
            candidate(Provider::Groq, a, false),
            candidate(Provider::Fireworks, b, false),
        ];

        let mut tried = Vec::new();
        let served = driver(&candidates, StructuredGenerationMode::Auto)
            .open_stream(&build, &mut tried)
            .await
            .unwrap();

        assert_eq!(served.index, 1);
        assert_eq!(tried[0].error.as_deref(), Some("provider_internal_error"));
    }
}
