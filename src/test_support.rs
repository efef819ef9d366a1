//! Scripted provider client for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use crate::llm::{
    File, Message, PromptTemplate, Provider, ProviderClient, ProviderDelta, ProviderError,
    ProviderOptions, ProviderOutput, ProviderStream,
};

/// One recorded request.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub messages: Vec<Message>,
    pub options: ProviderOptions,
}

/// A queued response, or a call that never returns.
enum Reply<T> {
    Ready(T),
    Stall,
}

/// Replays queued responses and records every request it receives.
pub(crate) struct ScriptedProvider {
    provider: Provider,
    completions: Mutex<VecDeque<Reply<Result<ProviderOutput, ProviderError>>>>,
    /// Chunks of each stream, and whether the stream stalls after them.
    streams: Mutex<VecDeque<(Vec<Result<ProviderDelta, ProviderError>>, bool)>>,
    calls: Mutex<Vec<RecordedCall>>,
    template: PromptTemplate,
    streamable: bool,
    downloads_files: bool,
}

impl ScriptedProvider {
    pub fn new(provider: Provider) -> Arc<Self> {
        Arc::new(Self::build(provider, PromptTemplate::SystemAndUser, true))
    }

    pub fn with_template(provider: Provider, template: PromptTemplate) -> Arc<Self> {
        Arc::new(Self::build(provider, template, true))
    }

    pub fn not_streamable(provider: Provider) -> Arc<Self> {
        Arc::new(Self::build(provider, PromptTemplate::SystemAndUser, false))
    }

    /// A provider that wants every URL-only file sent inline.
    pub fn downloading_files(provider: Provider) -> Arc<Self> {
        let mut scripted = Self::build(provider, PromptTemplate::SystemAndUser, true);
        scripted.downloads_files = true;
        Arc::new(scripted)
    }

    fn build(provider: Provider, template: PromptTemplate, streamable: bool) -> Self {
        Self {
            provider,
            completions: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            template,
            streamable,
            downloads_files: false,
        }
    }

    pub fn push_complete(&self, response: Result<ProviderOutput, ProviderError>) {
        self.completions.lock().unwrap().push_back(Reply::Ready(response));
    }

    /// Queue a completion that never resolves.
    pub fn push_stall(&self) {
        self.completions.lock().unwrap().push_back(Reply::Stall);
    }

    /// Queue a successful completion with the given content.
    pub fn push_content(&self, content: &str) {
        self.push_complete(Ok(ProviderOutput {
            content: Some(content.to_string()),
            usage: crate::llm::LlmUsage::tokens(100, 20),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }));
    }

    pub fn push_stream(&self, chunks: Vec<Result<ProviderDelta, ProviderError>>) {
        self.streams.lock().unwrap().push_back((chunks, false));
    }

    /// Queue a stream that yields `chunks` and then never yields again.
    pub fn push_stream_then_stall(&self, chunks: Vec<Result<ProviderDelta, ProviderError>>) {
        self.streams.lock().unwrap().push_back((chunks, true));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, messages: &[Message], options: &ProviderOptions) {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: messages.to_vec(),
            options: options.clone(),
        });
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<ProviderOutput, ProviderError> {
        self.record(messages, options);
        let reply = self.completions.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Ready(response)) => response,
            Some(Reply::Stall) => futures::future::pending().await,
            None => Err(ProviderError::internal("no scripted completion left")),
        }
    }

    async fn stream(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<ProviderStream, ProviderError> {
        self.record(messages, options);
        let (chunks, stall) = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::internal("no scripted stream left"))?;
        let chunks = futures::stream::iter(chunks);
        if stall {
            Ok(chunks.chain(futures::stream::pending()).boxed())
        } else {
            Ok(chunks.boxed())
        }
    }

    fn requires_downloading_file(&self, _file: &File, _model: &str) -> bool {
        self.downloads_files
    }

    fn is_streamable(&self, _model: &str) -> bool {
        self.streamable
    }

    fn sanitize_template(&self, _template: PromptTemplate) -> PromptTemplate {
        self.template
    }
}
