//! In-process service registry.
//!
//! Holds providers in memory and pushes every change to subscribers. Useful for
//! tests and for deployments with a fixed provider list.

use std::collections::HashMap;
use std::sync::Arc;

use ares_registry::{
    EndpointAddr, InvokerRegistration, ProviderEndpoint, ProviderMap, RegistryError,
    ServiceRegistry,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

/// In-memory `ServiceRegistry`
#[derive(Clone, Debug)]
pub struct MemoryRegistry {
    /// Everything ever published, by service name
    published: Arc<RwLock<ProviderMap>>,
    /// The cached view handed to invokers
    cached_tx: Arc<watch::Sender<ProviderMap>>,
    /// Filter applied by `init_provider_map`
    filter: Arc<RwLock<Option<(String, String)>>>,
    invokers: Arc<RwLock<Vec<InvokerRegistration>>>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (cached_tx, _) = watch::channel(HashMap::new());
        Self {
            published: Arc::new(RwLock::new(HashMap::new())),
            cached_tx: Arc::new(cached_tx),
            filter: Arc::new(RwLock::new(None)),
            invokers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a registry pre-populated with providers
    pub fn with_providers(providers: impl IntoIterator<Item = ProviderEndpoint>) -> Self {
        let registry = Self::new();
        for provider in providers {
            registry.publish(provider);
        }
        registry
    }

    /// Publish a provider. Re-publishing the same endpoint for a service replaces it.
    pub fn publish(&self, provider: ProviderEndpoint) {
        info!("Publishing {} at {}", provider.service, provider.addr);
        {
            let mut published = self.published.write();
            let providers = published.entry(provider.service.name.clone()).or_default();
            providers.retain(|p| p.addr != provider.addr);
            providers.push(provider);
        }
        self.refresh();
    }

    /// Withdraw an endpoint from every service it serves
    pub fn withdraw(&self, addr: &EndpointAddr) {
        info!("Withdrawing endpoint {}", addr);
        {
            let mut published = self.published.write();
            for providers in published.values_mut() {
                providers.retain(|p| &p.addr != addr);
            }
            published.retain(|_, providers| !providers.is_empty());
        }
        self.refresh();
    }

    /// Invokers registered so far
    pub fn registered_invokers(&self) -> Vec<InvokerRegistration> {
        self.invokers.read().clone()
    }

    /// Rebuild the cached view and notify subscribers
    fn refresh(&self) {
        let filter = self.filter.read().clone();
        let published = self.published.read();

        let cached: ProviderMap = published
            .iter()
            .filter_map(|(service, providers)| {
                let matching: Vec<_> = providers
                    .iter()
                    .filter(|p| match &filter {
                        Some((app_key, group)) => {
                            &p.app_key == app_key && (group.is_empty() || &p.service.group == group)
                        }
                        None => true,
                    })
                    .cloned()
                    .collect();
                (!matching.is_empty()).then(|| (service.clone(), matching))
            })
            .collect();

        debug!("Provider cache now holds {} services", cached.len());
        self.cached_tx.send_replace(cached);
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn init_provider_map(
        &self,
        remote_app_key: &str,
        group: &str,
    ) -> Result<(), RegistryError> {
        let known = self
            .published
            .read()
            .values()
            .flatten()
            .any(|p| p.app_key == remote_app_key);
        if !known {
            return Err(RegistryError::UnknownApplication(remote_app_key.to_string()));
        }

        *self.filter.write() = Some((remote_app_key.to_string(), group.to_string()));
        self.refresh();
        Ok(())
    }

    fn provider_map(&self) -> ProviderMap {
        self.cached_tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<ProviderMap> {
        self.cached_tx.subscribe()
    }

    async fn register_invoker(&self, invoker: InvokerRegistration) -> Result<(), RegistryError> {
        debug!("Registering invoker {} for {}", invoker.app_name, invoker.service);
        self.invokers.write().push(invoker);
        Ok(())
    }
}
