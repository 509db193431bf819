//! Choosing a provider endpoint for a call.

use std::sync::atomic::{AtomicUsize, Ordering};

use ares_registry::{ProviderEndpoint, ServiceDescriptor};

/// Picks one provider out of the candidates published for a service.
pub trait EndpointSelector: Send + Sync + 'static {
    /// Select a provider for `service`, or `None` if no candidate fits.
    fn select<'a>(
        &self,
        service: &ServiceDescriptor,
        candidates: &'a [ProviderEndpoint],
    ) -> Option<&'a ProviderEndpoint>;
}

/// Whether `provider` serves the version and group `service` asks for.
///
/// Empty fields on the requested descriptor match anything.
#[must_use]
pub fn matches(service: &ServiceDescriptor, provider: &ProviderEndpoint) -> bool {
    (service.version.is_empty() || service.version == provider.service.version)
        && (service.group.is_empty() || service.group == provider.service.group)
}

/// Cycles through matching providers in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    /// Create a selector starting at the first candidate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }
}

impl EndpointSelector for RoundRobin {
    fn select<'a>(
        &self,
        service: &ServiceDescriptor,
        candidates: &'a [ProviderEndpoint],
    ) -> Option<&'a ProviderEndpoint> {
        let fitting: Vec<&ProviderEndpoint> = candidates
            .iter()
            .filter(|provider| matches(service, provider))
            .collect();
        if fitting.is_empty() {
            return None;
        }

        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        fitting.get(turn % fitting.len()).copied()
    }
}
