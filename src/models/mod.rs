//! Model/provider capability registry.
//!
//! # Key Concepts
//! - Capabilities: what a model supports, with per-provider overrides
//! - Registry: static table of models, aliases, deprecations and pricing
//! - Resolver: turn a requested id into a live model and ordered provider candidates

mod builtin;
mod capabilities;
mod registry;
mod resolver;

pub use capabilities::{CapabilityOverrides, ModelCapabilities};
pub use registry::{
    Deprecation, ModelData, ModelRegistry, ProviderModelData, RegistryError, SharedModelRegistry,
};
pub use resolver::{ProviderCandidate, ResolvedModel};
