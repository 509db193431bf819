//! Invocation dispatcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ares_registry::{
    EndpointAddr, InvokerRegistration, ProviderMap, ServiceDescriptor, ServiceRegistry,
    endpoint_set,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ExhaustionPolicy, InvokerConfig, RetryPolicy};
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{InvocationRequest, InvocationResponse, ResponseStatus, Serialization};
use crate::selector::{EndpointSelector, RoundRobin};
use crate::transport::pending::PendingTable;
use crate::transport::pool::ConnectionPool;

/// Builder for creating invokers.
pub struct InvokerBuilder {
    config: InvokerConfig,
    selector: Option<Arc<dyn EndpointSelector>>,
}

impl InvokerBuilder {
    /// Create a new invoker builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: InvokerConfig::default(),
            selector: None,
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: InvokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the name of the invoking application.
    #[must_use]
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.config.app_name = app_name.into();
        self
    }

    /// Set the number of connections per endpoint.
    #[must_use]
    pub const fn pool_size(mut self, size: usize) -> Self {
        self.config.pool.pool_size = size;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the wire serialization.
    #[must_use]
    pub const fn serialization(mut self, serialization: Serialization) -> Self {
        self.config.serialization = serialization;
        self
    }

    /// Set what happens when every connection to an endpoint is lent out.
    #[must_use]
    pub const fn exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.config.pool.exhaustion = policy;
        self
    }

    /// Set the timeout for a single connect attempt.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.connect_timeout = timeout;
        self
    }

    /// Set the connection retry policy.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.pool.retry = retry;
        self
    }

    /// Set the maximum frame payload.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.pool.max_frame_size = size;
        self
    }

    /// Use a custom endpoint selector instead of round robin.
    #[must_use]
    pub fn selector(mut self, selector: impl EndpointSelector) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    /// Build the invoker. No connection is made until it is initialized.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn build(self) -> Result<Invoker> {
        self.config.validate()?;

        let pending = Arc::new(PendingTable::new());
        let pool = Arc::new(ConnectionPool::new(
            self.config.pool.clone(),
            self.config.serialization,
            Arc::clone(&pending),
        ));

        Ok(Invoker {
            config: self.config,
            pending,
            pool,
            providers: Arc::new(RwLock::new(ProviderMap::new())),
            selector: self
                .selector
                .unwrap_or_else(|| Arc::new(RoundRobin::new())),
            watcher: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }
}

impl Default for InvokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side entry point for remote calls.
///
/// Each call borrows a pooled connection only for the write; the response is
/// routed back through the pending table, so one connection multiplexes many
/// outstanding calls.
pub struct Invoker {
    config: InvokerConfig,
    pending: Arc<PendingTable>,
    pool: Arc<ConnectionPool>,
    providers: Arc<RwLock<ProviderMap>>,
    selector: Arc<dyn EndpointSelector>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Invoker {
    /// Create a new invoker builder.
    #[must_use]
    pub fn builder() -> InvokerBuilder {
        InvokerBuilder::new()
    }

    /// Invoker configuration.
    #[must_use]
    pub const fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// The connection pools.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Current providers by service name.
    #[must_use]
    pub fn providers(&self) -> ProviderMap {
        self.providers.read().clone()
    }

    /// Load providers from `registry`, connect to all of them, register this
    /// invoker for every consumed service and follow topology changes.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the provider map cannot be loaded or holds
    /// an invalid address.
    #[instrument(skip(self, registry))]
    pub async fn start<R>(&self, registry: Arc<R>, remote_app_key: &str, group: &str) -> Result<()>
    where
        R: ServiceRegistry + ?Sized,
    {
        registry.init_provider_map(remote_app_key, group).await?;

        let updates = registry.subscribe();
        let map = registry.provider_map();

        let services: Vec<String> = map.keys().cloned().collect();
        self.initialize(map).await?;
        self.register_services(&registry, services, group);
        self.follow(updates);

        info!(
            "Invoker {} started against {} ({} endpoints)",
            self.config.app_name,
            remote_app_key,
            self.pool.endpoints().len()
        );
        Ok(())
    }

    /// Connect to every endpoint in `providers` and start routing calls to them.
    ///
    /// # Errors
    ///
    /// Returns a registry error if any address is invalid; nothing is connected
    /// in that case.
    pub async fn initialize(&self, providers: ProviderMap) -> Result<()> {
        self.pool.initialize(endpoint_set(&providers)).await?;
        *self.providers.write() = providers;
        Ok(())
    }

    /// Apply a new provider map: pool new endpoints, drain withdrawn ones.
    ///
    /// # Errors
    ///
    /// Returns a registry error if a new address is invalid; the previous
    /// providers stay in effect.
    pub async fn apply_provider_map(&self, providers: ProviderMap) -> Result<()> {
        apply(&self.pool, &self.providers, providers).await
    }

    fn register_services<R>(&self, registry: &Arc<R>, services: Vec<String>, group: &str)
    where
        R: ServiceRegistry + ?Sized,
    {
        for name in services {
            let registration = InvokerRegistration {
                service: ServiceDescriptor::new(name).with_group(group),
                app_name: self.config.app_name.clone(),
                group: group.to_string(),
            };
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                let service = registration.service.clone();
                if let Err(e) = registry.register_invoker(registration).await {
                    warn!("Failed to register invoker for {}: {}", service, e);
                }
            });
        }
    }

    fn follow(&self, mut updates: watch::Receiver<ProviderMap>) {
        let pool = Arc::clone(&self.pool);
        let providers = Arc::clone(&self.providers);

        let handle = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let map = updates.borrow_and_update().clone();
                debug!("Registry pushed {} services", map.len());
                if let Err(e) = apply(&pool, &providers, map).await {
                    error!("Ignoring provider update: {}", e);
                }
            }
            debug!("Registry update stream ended");
        });

        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Call a remote method and wait for its response.
    ///
    /// The request's correlation id is kept unless it is nil; the caller
    /// application and an unset timeout are filled in from the configuration.
    /// A response carrying a remote exception is returned as is; see
    /// [`InvocationResponse::into_result`].
    ///
    /// # Errors
    ///
    /// - `Error::NoProvider` if no endpoint serves the target service
    /// - `Error::PoolExhausted` if no connection became available
    /// - `Error::Transport` if the connection failed before the response
    /// - `Error::Timeout` if connecting or waiting for the response outlasted
    ///   the call's timeout
    /// - `Error::Protocol` if the provider rejected the request
    #[instrument(skip(self, request), fields(service = %request.target_service, method = %request.method_name))]
    pub async fn invoke(&self, mut request: InvocationRequest) -> Result<InvocationResponse> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let timeout = request.effective_timeout(self.config.default_timeout);
        let deadline = Instant::now() + timeout;

        if request.correlation_id.is_nil() {
            request.correlation_id = Uuid::new_v4();
        }
        if request.caller_application_name.is_empty() {
            request
                .caller_application_name
                .clone_from(&self.config.app_name);
        }
        request = request.timeout(timeout);
        let correlation_id = request.correlation_id;

        let addr = self.select(&request.target_service)?;
        let mut conn = self
            .pool
            .checkout(&addr, deadline)
            .await
            .map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout(timeout),
                other => other,
            })?;

        let receiver = match conn.id().and_then(|id| self.pending.register(correlation_id, id)) {
            Ok(receiver) => receiver,
            Err(e) => {
                conn.release().await;
                return Err(e);
            }
        };
        // From here on the entry goes away however this call ends, dropped
        // futures included
        let _entry = self.pending.guard(correlation_id);

        if let Err(e) = conn.send(request).await {
            warn!("Failed to send {} to {}: {}", correlation_id, addr, e);
            // Released in the background; a broken connection gets replaced there
            drop(conn);
            return Err(e);
        }

        // The connection is free for other calls while this one waits. A
        // connection that closed meanwhile is replaced in the background so
        // the wait below is not delayed by reconnects.
        if conn.is_open() {
            conn.release().await;
        } else {
            drop(conn);
        }

        match timeout_at(deadline, receiver).await {
            Ok(Ok(Ok(response))) => match response.status {
                ResponseStatus::ProtocolError => Err(ProtocolError::Rejected(
                    response.error.map(|e| e.message).unwrap_or_default(),
                )
                .into()),
                ResponseStatus::Success | ResponseStatus::RemoteException => Ok(response),
            },
            Ok(Ok(Err(e))) => {
                debug!("Call {} failed with its connection: {}", correlation_id, e);
                Err(e)
            }
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                debug!("Call {} timed out after {:?}", correlation_id, timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    fn select(&self, service: &ServiceDescriptor) -> Result<EndpointAddr> {
        let providers = self.providers.read();
        let candidates = providers
            .get(&service.name)
            .map(Vec::as_slice)
            .unwrap_or_default();

        self.selector
            .select(service, candidates)
            .map(|provider| provider.addr.clone())
            .ok_or_else(|| Error::NoProvider(service.to_string()))
    }

    /// Stop following the registry, close every connection and fail every
    /// outstanding call.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            handle.abort();
        }

        self.pool.shutdown().await;
        info!("Invoker {} shut down", self.config.app_name);
    }
}

impl Drop for Invoker {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

async fn apply(
    pool: &ConnectionPool,
    providers: &RwLock<ProviderMap>,
    map: ProviderMap,
) -> Result<()> {
    let wanted: HashSet<EndpointAddr> = endpoint_set(&map);
    pool.update_endpoints(&wanted).await?;
    *providers.write() = map;
    Ok(())
}
