//! Engine configuration.
//!
//! Read from a JSON file when one is given and exists. Otherwise environment variables
//! are used as defaults:
//! - `AGENTRUN_MAX_TOOL_ITERATIONS` - bound on tool call rounds per run
//! - `AGENTRUN_PROVIDER_TIMEOUT_SECS` - timeout of a single provider call
//! - `AGENTRUN_MODELS_FILE` - model registry JSON replacing the built-in table

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{OpenAiCompatibleClient, Provider, ProviderRegistry};
use crate::models::{ModelRegistry, RegistryError};
use crate::runner::MAX_TOOL_CALL_ITERATIONS;

pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Endpoint settings for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// OpenAI-compatible base URL. Defaults to the provider's public endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_tool_call_iterations")]
    pub max_tool_call_iterations: usize,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<Provider, ProviderSettings>,
}

fn default_max_tool_call_iterations() -> usize {
    MAX_TOOL_CALL_ITERATIONS
}

fn default_provider_timeout_secs() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tool_call_iterations: MAX_TOOL_CALL_ITERATIONS,
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            models_file: None,
            providers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` when it exists, otherwise from the environment.
    pub fn load_or_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => {
                let config = Self::load(path)?;
                tracing::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Some(path) => {
                tracing::info!(
                    "No config file found at {}, using environment defaults",
                    path.display()
                );
                Self::from_env()
            }
            None => Self::from_env(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = env_parse("AGENTRUN_MAX_TOOL_ITERATIONS")? {
            config.max_tool_call_iterations = value;
        }
        if let Some(value) = env_parse("AGENTRUN_PROVIDER_TIMEOUT_SECS")? {
            config.provider_timeout_secs = value;
        }
        config.models_file = std::env::var("AGENTRUN_MODELS_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tool_call_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_tool_call_iterations must be positive".to_string(),
            ));
        }
        if self.provider_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "provider_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// The registry from `models_file`, or the built-in one. Both are validated.
    pub fn load_model_registry(&self) -> Result<ModelRegistry, ConfigError> {
        let registry = match &self.models_file {
            Some(path) => {
                tracing::info!("Loading model registry from {}", path.display());
                ModelRegistry::load(path)?
            }
            None => ModelRegistry::builtin()?,
        };
        Ok(registry)
    }

    /// Register an OpenAI-compatible client for every provider with an endpoint and an
    /// API key in the environment.
    pub fn build_provider_registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for provider in Provider::ALL {
            let settings = self.providers.get(&provider).cloned().unwrap_or_default();
            let Some(base_url) = settings
                .base_url
                .or_else(|| provider.openai_compatible_base_url().map(str::to_string))
            else {
                continue;
            };
            let key_env = settings
                .api_key_env
                .unwrap_or_else(|| provider.api_key_env().to_string());
            match std::env::var(&key_env) {
                Ok(key) if !key.trim().is_empty() => {
                    tracing::info!("Registered {} client ({})", provider, base_url);
                    registry.register(Arc::new(OpenAiCompatibleClient::new(provider, base_url, key)));
                }
                _ => tracing::debug!("{} is not set, skipping {}", key_env, provider),
            }
        }
        registry
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        _ => Ok(None),
    }
}
