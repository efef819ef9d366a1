//! Static model/provider capability registry.
//!
//! The registry is loaded once at startup (built-in table or a JSON file) and is
//! read-only afterwards. [`ModelRegistry::validate`] is the startup self-check that
//! rejects inconsistent data: deprecated models without a replacement, aliases pointing
//! nowhere, providers without pricing.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CapabilityOverrides, ModelCapabilities};
use crate::budget::ModelPricing;
use crate::llm::Provider;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read model registry: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse model registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Model {0} is declared more than once")]
    DuplicateModel(String),

    #[error("Deprecated model {0} has no replacement model")]
    ModelIsMissingReplacementModel(String),

    #[error("Replacement model {replacement} of {model} does not exist")]
    UnknownReplacementModel { model: String, replacement: String },

    #[error("Replacement chain starting at {0} loops")]
    ReplacementCycle(String),

    #[error("Alias {alias} points to unknown model {target}")]
    DanglingAlias { alias: String, target: String },

    #[error("Alias {alias} points to deprecated model {target}")]
    DeprecatedAliasTarget { alias: String, target: String },

    #[error("Model {0} has no provider")]
    NoProviders(String),

    #[error("Provider {provider} is listed twice for model {model}")]
    DuplicateProvider { model: String, provider: Provider },

    #[error("Missing pricing data for model {model} on provider {provider}")]
    MissingPricing { model: String, provider: Provider },

    #[error("Invalid pricing for model {model} on provider {provider}: {reason}")]
    InvalidPricing {
        model: String,
        provider: Provider,
        reason: String,
    },
}

/// One provider able to serve a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderModelData {
    pub provider: Provider,
    /// Provider specific model name when it differs from the model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_model_id: Option<String>,
    #[serde(default)]
    pub overrides: CapabilityOverrides,
    /// Kept optional so that a missing entry is reported by `validate` instead of failing
    /// deserialization with an unhelpful message.
    #[serde(default)]
    pub pricing: Option<ModelPricing>,
}

/// Marks a model as deprecated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deprecation {
    #[serde(default)]
    pub replacement_model: Option<String>,
}

/// Canonical data of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub capabilities: ModelCapabilities,
    /// Providers in priority order.
    #[serde(default)]
    pub providers: Vec<ProviderModelData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation: Option<Deprecation>,
}

impl ModelData {
    pub fn is_deprecated(&self) -> bool {
        self.deprecation.is_some()
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderModelData> {
        self.providers.iter().find(|p| p.provider == provider)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    models: Vec<ModelData>,
    #[serde(default)]
    aliases: HashMap<String, String>,
}

/// Registry of models, their providers and pricing.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelData>,
    /// "latest" style aliases to concrete model ids
    aliases: HashMap<String, String>,
    /// Declaration order, used for listing
    order: Vec<String>,
}

impl ModelRegistry {
    /// Build a registry without validating it.
    pub fn from_parts(
        models: Vec<ModelData>,
        aliases: HashMap<String, String>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self {
            aliases,
            ..Default::default()
        };
        for model in models {
            if registry.models.contains_key(&model.id) {
                return Err(RegistryError::DuplicateModel(model.id));
            }
            registry.order.push(model.id.clone());
            registry.models.insert(model.id.clone(), model);
        }
        Ok(registry)
    }

    /// Build and validate a registry.
    pub fn new(
        models: Vec<ModelData>,
        aliases: HashMap<String, String>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::from_parts(models, aliases)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Load and validate a registry from a JSON file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&contents)?;
        let registry = Self::new(file.models, file.aliases)?;
        tracing::info!(
            "Loaded {} models and {} aliases from {}",
            registry.models.len(),
            registry.aliases.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn to_json(&self) -> Result<String, RegistryError> {
        let file = RegistryFile {
            models: self.list().into_iter().cloned().collect(),
            aliases: self.aliases.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelData> {
        self.models.get(model_id)
    }

    pub fn alias_target(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn list(&self) -> Vec<&ModelData> {
        self.order.iter().filter_map(|id| self.models.get(id)).collect()
    }

    /// Check registry consistency. Run once at load time.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for (alias, target) in &self.aliases {
            match self.models.get(target) {
                None => {
                    return Err(RegistryError::DanglingAlias {
                        alias: alias.clone(),
                        target: target.clone(),
                    })
                }
                Some(m) if m.is_deprecated() => {
                    return Err(RegistryError::DeprecatedAliasTarget {
                        alias: alias.clone(),
                        target: target.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        for id in &self.order {
            let model = &self.models[id];
            if model.is_deprecated() {
                self.follow_replacements(id)?;
                continue;
            }
            if model.providers.is_empty() {
                return Err(RegistryError::NoProviders(id.clone()));
            }
            let mut seen = HashSet::new();
            for entry in &model.providers {
                if !seen.insert(entry.provider) {
                    return Err(RegistryError::DuplicateProvider {
                        model: id.clone(),
                        provider: entry.provider,
                    });
                }
                let pricing = entry.pricing.as_ref().ok_or_else(|| RegistryError::MissingPricing {
                    model: id.clone(),
                    provider: entry.provider,
                })?;
                pricing.validate().map_err(|reason| RegistryError::InvalidPricing {
                    model: id.clone(),
                    provider: entry.provider,
                    reason,
                })?;
            }
        }
        Ok(())
    }

    /// Follow the replacement chain of a deprecated model to a live model.
    pub(crate) fn follow_replacements(&self, model_id: &str) -> Result<&ModelData, RegistryError> {
        let mut visited = HashSet::new();
        let mut current = model_id.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Err(RegistryError::ReplacementCycle(model_id.to_string()));
            }
            let model = self.models.get(&current).ok_or_else(|| RegistryError::UnknownReplacementModel {
                model: model_id.to_string(),
                replacement: current.clone(),
            })?;
            match &model.deprecation {
                None => return Ok(model),
                Some(Deprecation {
                    replacement_model: Some(next),
                }) => current = next.clone(),
                Some(Deprecation {
                    replacement_model: None,
                }) => return Err(RegistryError::ModelIsMissingReplacementModel(current)),
            }
        }
    }
}

/// Shared registry for concurrent read-only access.
pub type SharedModelRegistry = Arc<ModelRegistry>;
