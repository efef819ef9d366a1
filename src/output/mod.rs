//! Output extraction and validation.
//!
//! Raw model text goes through tolerant parsing ([`parse_json_object`]), then the
//! reserved `internal_*` fields are taken out and the rest is validated against the
//! task's output schema ([`OutputValidator`]).

mod extract;
mod repair;

pub use extract::{
    ExtractedOutput, OutputValidator, AGENT_RUN_RESULT_KEY, REASONING_STEPS_KEY, TOOL_CALLS_KEY,
};
pub use repair::parse_json_object;
