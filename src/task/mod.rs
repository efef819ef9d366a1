//! Task module - task shapes, run configuration and run results.
//!
//! - `TaskVariant`: the input/output schemas of a task, borrowed read-only per run
//! - `RunProperties`: per-run configuration, built once and never mutated
//! - `RunOutput`: the validated result of a run with usage and cost

mod output;
mod properties;
mod variant;

pub use output::{
    AgentRunResult, AgentRunStatus, LlmCompletion, ProviderAttempt, ReasoningStep, RunOutput,
};
pub use properties::{FewShotExample, RunProperties, RunPropertiesBuilder, StructuredGenerationMode};
pub use variant::TaskVariant;
