//! Capability resolver: requested model id to concrete model and provider candidates.

use serde::Serialize;

use super::{ModelCapabilities, ModelData, ModelRegistry, RegistryError};
use crate::budget::ModelPricing;
use crate::error::RunError;
use crate::llm::Provider;

/// A provider able to serve the resolved model, with its effective capabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCandidate {
    pub provider: Provider,
    /// Model name to send to the provider.
    pub provider_model_id: String,
    pub capabilities: ModelCapabilities,
    pub pricing: ModelPricing,
}

/// Result of resolving a requested model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedModel {
    /// Identifier as requested (may be an alias or deprecated id).
    pub requested: String,
    /// Concrete, non-deprecated model id.
    pub model: String,
    pub capabilities: ModelCapabilities,
    /// Providers in the order they should be tried.
    pub candidates: Vec<ProviderCandidate>,
}

impl ModelRegistry {
    /// Map an alias or deprecated id to the concrete live model.
    pub fn resolve_model(&self, requested: &str) -> Result<&ModelData, RunError> {
        let id = self.alias_target(requested).unwrap_or(requested);
        let model = self
            .get(id)
            .ok_or_else(|| RunError::UnknownModel(requested.to_string()))?;
        if !model.is_deprecated() {
            return Ok(model);
        }
        let replacement = self.follow_replacements(id).map_err(|e| match e {
            RegistryError::ModelIsMissingReplacementModel(m) => RunError::ModelIsMissingReplacementModel(m),
            other => RunError::UnknownModel(other.to_string()),
        })?;
        tracing::info!(
            "Model {} is deprecated, using replacement {}",
            requested,
            replacement.id
        );
        Ok(replacement)
    }

    /// Resolve a requested model and optional provider pin into ordered candidates.
    pub fn resolve(&self, requested: &str, pinned: Option<Provider>) -> Result<ResolvedModel, RunError> {
        let model = self.resolve_model(requested)?;

        let candidates: Vec<ProviderCandidate> = model
            .providers
            .iter()
            .filter(|entry| pinned.map_or(true, |p| p == entry.provider))
            .filter_map(|entry| {
                // validate() guarantees pricing; an unvalidated registry just loses the entry
                let pricing = entry.pricing?;
                Some(ProviderCandidate {
                    provider: entry.provider,
                    provider_model_id: entry
                        .provider_model_id
                        .clone()
                        .unwrap_or_else(|| model.id.clone()),
                    capabilities: model.capabilities.with_overrides(&entry.overrides),
                    pricing,
                })
            })
            .collect();

        if let Some(provider) = pinned {
            if candidates.is_empty() {
                return Err(RunError::ProviderDoesNotSupportModel {
                    provider,
                    model: model.id.clone(),
                });
            }
        }

        Ok(ResolvedModel {
            requested: requested.to_string(),
            model: model.id.clone(),
            capabilities: model.capabilities,
            candidates,
        })
    }
}
