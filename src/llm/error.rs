//! Provider error classification.
//!
//! Every failure coming out of a provider client is mapped to a [`ProviderErrorKind`].
//! The kind decides whether the failover driver moves to the next candidate, retries the
//! same candidate without structured generation, or gives up.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Provider;

/// Category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// 5xx, malformed upstream responses, connection resets
    Internal,
    /// Provider or model temporarily unavailable (503, overloaded)
    Unavailable,
    /// 429
    RateLimited,
    /// No answer within the per-call timeout
    Timeout,
    /// The provider rejected the structured output schema
    StructuredGeneration,
    /// A file in the request could not be fetched or was rejected
    InvalidFile,
    /// Other 4xx
    BadRequest,
    ContentModeration,
    MaxTokensExceeded,
    /// The model produced something unusable (e.g. empty completion)
    FailedGeneration,
}

impl ProviderErrorKind {
    /// Stable machine readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Internal | Self::Timeout => "provider_internal_error",
            Self::Unavailable => "provider_unavailable",
            Self::RateLimited => "rate_limit",
            Self::StructuredGeneration => "structured_generation_error",
            Self::InvalidFile => "invalid_file",
            Self::BadRequest => "bad_request",
            Self::ContentModeration => "content_moderation",
            Self::MaxTokensExceeded => "max_tokens_exceeded",
            Self::FailedGeneration => "failed_generation",
        }
    }

    /// Whether failover should move on to the next candidate provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Internal | Self::Unavailable | Self::RateLimited | Self::Timeout
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Error returned by a provider client.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Provider that raised the error, filled in by the failover driver when missing.
    pub provider: Option<Provider>,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            status_code: None,
            retry_after: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("Provider did not answer within {:?}", after),
        )
    }

    pub fn structured_generation(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::StructuredGeneration, message)
    }

    pub fn invalid_file(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidFile, message)
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider.get_or_insert(provider);
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

/// Classify an HTTP status code into an error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        503 | 529 => ProviderErrorKind::Unavailable,
        408 | 504 => ProviderErrorKind::Timeout,
        413 => ProviderErrorKind::MaxTokensExceeded,
        500..=599 => ProviderErrorKind::Internal,
        400..=499 => ProviderErrorKind::BadRequest,
        _ => ProviderErrorKind::Internal,
    }
}

/// Refine a 4xx classification by looking at the error body.
///
/// Providers report schema rejections, moderation and context overflows as plain 400s.
pub fn classify_error_body(status: u16, body: &str) -> ProviderErrorKind {
    let kind = classify_http_status(status);
    if kind != ProviderErrorKind::BadRequest {
        return kind;
    }
    let lower = body.to_ascii_lowercase();
    if lower.contains("response_format") || lower.contains("json_schema") || lower.contains("invalid schema") {
        ProviderErrorKind::StructuredGeneration
    } else if lower.contains("content_policy") || lower.contains("content management policy") || lower.contains("safety") {
        ProviderErrorKind::ContentModeration
    } else if lower.contains("context_length_exceeded") || lower.contains("maximum context length") {
        ProviderErrorKind::MaxTokensExceeded
    } else if lower.contains("image_url") || lower.contains("invalid image") || lower.contains("failed to download") {
        ProviderErrorKind::InvalidFile
    } else {
        ProviderErrorKind::BadRequest
    }
}
