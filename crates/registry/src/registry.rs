//! The registry collaborator as seen by an invoker

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{EndpointAddr, InvokerRegistration, ProviderEndpoint, RegistryError};

/// Providers keyed by service name.
pub type ProviderMap = HashMap<String, Vec<ProviderEndpoint>>;

/// Every distinct endpoint in a provider map.
pub fn endpoint_set(map: &ProviderMap) -> HashSet<EndpointAddr> {
    map.values()
        .flatten()
        .map(|provider| provider.addr.clone())
        .collect()
}

/// Discovery and publication of service endpoints.
///
/// Implementations own the coordination protocol; the invoker only reads
/// snapshots and follows pushed updates.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// Load the providers of a remote application into the local cache.
    async fn init_provider_map(
        &self,
        remote_app_key: &str,
        group: &str,
    ) -> Result<(), RegistryError>;

    /// Current snapshot of the cached providers.
    fn provider_map(&self) -> ProviderMap;

    /// Follow changes to the cached providers.
    fn subscribe(&self) -> watch::Receiver<ProviderMap>;

    /// Publish an invoker. Callers do not wait on the outcome.
    async fn register_invoker(&self, invoker: InvokerRegistration) -> Result<(), RegistryError>;
}
