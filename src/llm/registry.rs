//! Registry of provider clients keyed by [`Provider`].

use std::collections::HashMap;
use std::sync::Arc;

use super::{Provider, ProviderClient};

/// Maps each provider to the client that talks to it.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under the provider it reports.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        let provider = client.provider();
        if self.clients.insert(provider, client).is_some() {
            tracing::debug!("Replaced client for provider {}", provider);
        }
    }

    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&provider).cloned()
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.clients.keys().copied().collect();
        providers.sort();
        providers
    }

    /// Clients for every provider with an API key in the environment, using default
    /// endpoints.
    pub fn from_env() -> Self {
        crate::config::EngineConfig::default().build_provider_registry()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

/// Shared provider registry.
pub type SharedProviderRegistry = Arc<ProviderRegistry>;
