use std::sync::Arc;

use tracing::debug;

use crate::{
    err::{Error, Result},
    provider::{dynamo::DynamoProvider, kaito::KaitoProvider, kuberay::KubeRayProvider, Provider},
};

// ProviderRegistry

#[derive(Clone, Default)]
pub struct ProviderRegistry(Vec<Arc<dyn Provider>>);

impl ProviderRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(DynamoProvider);
        registry.register(KubeRayProvider);
        registry.register(KaitoProvider);
        registry
    }

    /// Registers a provider. A provider with the same id is replaced and keeps its position.
    pub fn register<PROVIDER: Provider + 'static>(&mut self, provider: PROVIDER) {
        let id = provider.id();
        let provider: Arc<dyn Provider> = Arc::new(provider);
        match self.0.iter_mut().find(|registered| registered.id() == id) {
            Some(registered) => {
                debug!(provider.id = id, "replacing provider");
                *registered = provider;
            }
            None => {
                debug!(provider.id = id, "registering provider");
                self.0.push(provider);
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Provider>> {
        self.0
            .iter()
            .find(|provider| provider.id() == id)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(id.into()))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.0.iter().map(|provider| provider.id()).collect()
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.0
    }
}

// Tests
