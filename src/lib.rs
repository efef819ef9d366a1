//! # agentrun
//!
//! Engine for running structured-output agent tasks against LLM providers.
//!
//! A run takes a task (input and output JSON schemas), an input document and run
//! properties, and returns an output that validates against the task's output schema.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//!   │ models       │──►│ prompt         │──►│ runner::failover │──► llm::ProviderClient
//!   │ (resolver)   │   │ (messages)     │   └────────┬─────────┘
//!   └──────────────┘   └────────────────┘            │ tool calls
//!                                                    ▼
//!                                          ┌──────────────────┐
//!                                          │ runner::tool_loop│◄─► tools
//!                                          └────────┬─────────┘
//!                                                   │ final answer
//!                                                   ▼
//!                                   output (extract, validate) ──► budget (cost)
//! ```
//!
//! ## Run Flow
//! 1. Resolve the requested model to a live model and its provider candidates
//! 2. Build the prompt, checking the model supports the attached files
//! 3. Call providers in order until one answers
//! 4. Execute requested tools and call the model again with the results
//! 5. Extract reserved fields, validate the output and compute the cost
//!
//! ## Modules
//! - `models`: model registry, capabilities and resolution
//! - `prompt`: message building and file handling
//! - `llm`: provider client trait and the OpenAI-compatible client
//! - `runner`: the [`AgentRunner`] facade, failover and tool loop
//! - `tools`: tool trait, registry and call cache
//! - `output`: JSON repair, reserved field extraction and validation
//! - `budget`: pricing and cost computation

pub mod budget;
pub mod config;
pub mod error;
pub mod events;
pub mod hashing;
pub mod llm;
pub mod models;
pub mod output;
pub mod prompt;
pub mod runner;
pub mod task;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use error::{ErrorPayload, RunError};
pub use runner::{AgentRunner, PartialOutput, StreamEvent};
pub use task::{RunOutput, RunProperties, TaskVariant};
pub use tools::{ToolCallCache, ToolRegistry};
