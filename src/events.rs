//! Fire-and-forget engine notifications.
//!
//! The engine reports which providers it used and how each run ended. Sinks must not
//! block: a sink that cannot accept an event drops it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::llm::Provider;

/// Event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A provider call failed and the run may move on to another provider.
    ProviderAttemptFailed {
        run_id: Uuid,
        provider: Provider,
        model: String,
        structured_generation: bool,
        error_code: String,
        at: DateTime<Utc>,
    },
    /// A provider call succeeded.
    ProviderUsed {
        run_id: Uuid,
        provider: Provider,
        model: String,
        structured_generation: bool,
        at: DateTime<Utc>,
    },
    /// A run finished, successfully or not.
    InferenceCompleted {
        run_id: Uuid,
        model: String,
        provider: Option<Provider>,
        cost_usd: f64,
        duration_seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderAttemptFailed { .. } => "provider_attempt_failed",
            Self::ProviderUsed { .. } => "provider_used",
            Self::InferenceCompleted { .. } => "inference_completed",
        }
    }
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Receiver of engine events.
pub trait EventSink: Send + Sync {
    /// Must return immediately.
    fn emit(&self, event: EngineEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped, discarding event");
        }
    }
}
