//! Per-endpoint connection pools.
//!
//! Each provider endpoint owns a bounded `ArrayQueue` of idle connections whose
//! capacity is the configured pool size, so the queue can never hold more than
//! `pool_size` connections. Every slot is at any moment idle in the queue, lent
//! to one caller, or vacant because its connection could not be (re)established.
//! Vacant slots are refilled on demand by `acquire`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use ares_registry::EndpointAddr;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::config::{ExhaustionPolicy, PoolConfig};
use crate::error::{ConnectionError, Error, Result};
use crate::protocol::{InvocationRequest, Serialization};
use crate::transport::connection::Connection;
use crate::transport::pending::PendingTable;

/// Attempts made to replace a broken connection when the retry policy itself
/// is unbounded.
const REPLACEMENT_ATTEMPTS: u32 = 3;

struct EndpointPool {
    addr: EndpointAddr,
    idle: ArrayQueue<Connection>,
    vacant: AtomicUsize,
    available: Notify,
    retired: AtomicBool,
}

impl EndpointPool {
    fn new(addr: EndpointAddr, pool_size: usize) -> Self {
        Self {
            addr,
            idle: ArrayQueue::new(pool_size),
            vacant: AtomicUsize::new(0),
            available: Notify::new(),
            retired: AtomicBool::new(false),
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn claim_vacancy(&self) -> bool {
        self.vacant
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    fn mark_vacant(&self) {
        self.vacant.fetch_add(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

/// A slot claimed for refilling. Handed back as vacant on drop unless a
/// connection filled it, so an abandoned connect cannot leak the slot.
struct Vacancy<'a> {
    endpoint: &'a EndpointPool,
    filled: bool,
}

impl<'a> Vacancy<'a> {
    fn claim(endpoint: &'a EndpointPool) -> Option<Self> {
        endpoint.claim_vacancy().then(|| Self {
            endpoint,
            filled: false,
        })
    }

    fn fill(mut self) {
        self.filled = true;
    }
}

impl Drop for Vacancy<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.endpoint.mark_vacant();
        }
    }
}

/// Connection pools for every known provider endpoint.
pub struct ConnectionPool {
    config: PoolConfig,
    serialization: Serialization,
    pending: Arc<PendingTable>,
    endpoints: DashMap<EndpointAddr, Arc<EndpointPool>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl ConnectionPool {
    /// Create an empty pool. Connections route their responses into `pending`.
    #[must_use]
    pub fn new(config: PoolConfig, serialization: Serialization, pending: Arc<PendingTable>) -> Self {
        Self {
            config,
            serialization,
            pending,
            endpoints: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Establish `pool_size` connections to every endpoint.
    ///
    /// Transient connect failures are retried with backoff according to the
    /// retry policy (forever by default). Endpoints that are already pooled are
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns a registry error if any address is invalid, before connecting to
    /// anything, and `Error::ShuttingDown` if the pool was shut down meanwhile.
    #[instrument(skip(self, endpoints))]
    pub async fn initialize<I>(&self, endpoints: I) -> Result<()>
    where
        I: IntoIterator<Item = EndpointAddr>,
    {
        let endpoints: Vec<EndpointAddr> = endpoints.into_iter().collect();
        for addr in &endpoints {
            addr.validate()?;
        }

        let fresh: Vec<Arc<EndpointPool>> = endpoints
            .into_iter()
            .filter_map(|addr| self.provision(addr))
            .collect();

        info!(
            "Initializing {} endpoint pools with {} connections each",
            fresh.len(),
            self.config.pool_size
        );

        let limit = self.config.retry.max_attempts;
        join_all(fresh.iter().map(|endpoint| self.fill(endpoint, limit))).await;

        if self.is_shutdown() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Bring the pooled endpoints in line with `wanted`: new endpoints get a
    /// fresh pool, endpoints no longer wanted are drained.
    ///
    /// New endpoints get one connect attempt per slot; slots that fail stay
    /// vacant and are refilled on demand.
    ///
    /// # Errors
    ///
    /// Returns a registry error if a new address is invalid. Nothing is
    /// changed in that case.
    #[instrument(skip(self, wanted))]
    pub async fn update_endpoints(&self, wanted: &HashSet<EndpointAddr>) -> Result<()> {
        for addr in wanted {
            if !self.endpoints.contains_key(addr) {
                addr.validate()?;
            }
        }

        let removed: Vec<EndpointAddr> = self
            .endpoints
            .iter()
            .filter(|entry| !wanted.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for addr in &removed {
            self.drain(addr).await;
        }

        let added: Vec<Arc<EndpointPool>> = wanted
            .iter()
            .filter_map(|addr| self.provision(addr.clone()))
            .collect();
        if !added.is_empty() {
            info!("Provisioning {} new endpoint pools", added.len());
        }
        join_all(added.iter().map(|endpoint| self.fill(endpoint, Some(1)))).await;

        Ok(())
    }

    /// Take an idle connection for `addr`, or `None` if every slot is lent out.
    ///
    /// Dead idle connections are discarded and their slot is refilled with a
    /// single connect attempt.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownEndpoint` for an endpoint that is not pooled, or
    /// the connect error if a vacant slot could not be refilled.
    pub async fn acquire(&self, addr: &EndpointAddr) -> Result<Option<Connection>> {
        let endpoint = self.endpoint(addr)?;
        self.acquire_from(&endpoint).await
    }

    async fn acquire_from(&self, endpoint: &Arc<EndpointPool>) -> Result<Option<Connection>> {
        if self.is_shutdown() {
            return Err(Error::ShuttingDown);
        }
        if endpoint.is_retired() {
            return Err(Error::UnknownEndpoint(endpoint.addr.clone()));
        }

        while let Some(conn) = endpoint.idle.pop() {
            if conn.is_usable() {
                return Ok(Some(conn));
            }
            debug!("Discarding dead idle connection {} to {}", conn.id(), endpoint.addr);
            endpoint.vacant.fetch_add(1, Ordering::SeqCst);
            conn.close().await;
        }

        let Some(vacancy) = Vacancy::claim(endpoint) else {
            return Ok(None);
        };

        let conn = self.connect(&endpoint.addr).await?;
        vacancy.fill();
        Ok(Some(conn))
    }

    /// Lend a connection for `addr` that is returned to the pool when the
    /// guard is released or dropped.
    ///
    /// When every connection is lent out, `ExhaustionPolicy::FailFast` fails at
    /// once and `ExhaustionPolicy::Wait` waits for a release until `deadline`.
    /// Refilling a vacant slot never outlasts `deadline` either.
    ///
    /// # Errors
    ///
    /// Returns `Error::PoolExhausted` when no connection became available in
    /// time, `Error::Timeout` when `deadline` passed while connecting, or any
    /// error `acquire` returns.
    pub async fn checkout(
        self: &Arc<Self>,
        addr: &EndpointAddr,
        deadline: Instant,
    ) -> Result<PooledConnection> {
        let endpoint = self.endpoint(addr)?;
        let budget = deadline.saturating_duration_since(Instant::now());

        loop {
            // Register interest before looking so a release in between is not missed
            let notified = endpoint.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acquired = timeout_at(deadline, self.acquire_from(&endpoint))
                .await
                .map_err(|_| {
                    debug!("Deadline passed while connecting to {}", addr);
                    Error::Timeout(budget)
                })??;
            if let Some(conn) = acquired {
                return Ok(PooledConnection {
                    pool: Arc::clone(self),
                    endpoint: Arc::clone(&endpoint),
                    conn: Some(conn),
                });
            }

            match self.config.exhaustion {
                ExhaustionPolicy::FailFast => return Err(Error::PoolExhausted(addr.clone())),
                ExhaustionPolicy::Wait => {
                    debug!("Pool for {} exhausted, waiting for a release", addr);
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::PoolExhausted(addr.clone()));
                    }
                }
            }
        }
    }

    /// Return a connection to the pool for `addr`.
    ///
    /// A connection that is no longer open and writable is closed and replaced
    /// by a fresh one. Passing `None` tops the pool up with a fresh connection.
    /// Connections for endpoints that are no longer pooled are closed.
    pub async fn release(&self, addr: &EndpointAddr, conn: Option<Connection>) {
        match self.endpoints.get(addr).map(|entry| Arc::clone(entry.value())) {
            Some(endpoint) => self.release_to(&endpoint, conn).await,
            None => {
                if let Some(conn) = conn {
                    debug!("Closing connection {} to unpooled endpoint {}", conn.id(), addr);
                    conn.close().await;
                }
            }
        }
    }

    async fn release_to(&self, endpoint: &Arc<EndpointPool>, conn: Option<Connection>) {
        let conn = match conn {
            Some(conn) if conn.is_usable() => conn,
            stale => {
                if let Some(conn) = stale {
                    debug!(
                        "Connection {} to {} is no longer usable, replacing it",
                        conn.id(),
                        endpoint.addr
                    );
                    conn.close().await;
                }
                if self.is_shutdown() || endpoint.is_retired() {
                    return;
                }
                let limit = self
                    .config
                    .retry
                    .max_attempts
                    .map_or(REPLACEMENT_ATTEMPTS, |max| max.min(REPLACEMENT_ATTEMPTS));
                match self.connect_with_retry(endpoint, Some(limit)).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(
                            "Could not replace connection to {}, slot left vacant: {}",
                            endpoint.addr, e
                        );
                        endpoint.mark_vacant();
                        return;
                    }
                }
            }
        };

        self.offer(endpoint, conn).await;
    }

    async fn offer(&self, endpoint: &EndpointPool, conn: Connection) {
        if self.is_shutdown() || endpoint.is_retired() {
            conn.close().await;
            return;
        }

        match endpoint.idle.push(conn) {
            Ok(()) => endpoint.available.notify_one(),
            Err(surplus) => {
                warn!(
                    "Pool for {} already full, closing surplus connection {}",
                    endpoint.addr,
                    surplus.id()
                );
                surplus.close().await;
            }
        }
    }

    /// Stop pooling `addr` and close its idle connections. Connections lent
    /// out at the time are closed when they come back.
    #[instrument(skip(self))]
    pub async fn drain(&self, addr: &EndpointAddr) {
        let Some((_, endpoint)) = self.endpoints.remove(addr) else {
            return;
        };

        endpoint.retired.store(true, Ordering::SeqCst);
        endpoint.available.notify_waiters();

        let mut closed = 0;
        while let Some(conn) = endpoint.idle.pop() {
            conn.close().await;
            closed += 1;
        }
        info!("Drained pool for {} ({} idle connections closed)", addr, closed);
    }

    /// Drain every endpoint and fail every outstanding invocation.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Fail callers before closing connections so they see the shutdown
        let failed = self.pending.fail_all(&Error::ShuttingDown);

        let addrs = self.endpoints();
        for addr in &addrs {
            self.drain(addr).await;
        }
        info!(
            "Connection pool shut down ({} endpoints, {} pending invocations failed)",
            addrs.len(),
            failed
        );
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Idle connections currently queued for `addr`.
    #[must_use]
    pub fn idle_count(&self, addr: &EndpointAddr) -> usize {
        self.endpoints.get(addr).map_or(0, |entry| entry.idle.len())
    }

    /// Slots for `addr` that currently have no connection.
    #[must_use]
    pub fn vacant_count(&self, addr: &EndpointAddr) -> usize {
        self.endpoints
            .get(addr)
            .map_or(0, |entry| entry.vacant.load(Ordering::SeqCst))
    }

    /// Endpoints currently pooled.
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndpointAddr> {
        self.endpoints.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Whether `addr` is currently pooled.
    #[must_use]
    pub fn contains(&self, addr: &EndpointAddr) -> bool {
        self.endpoints.contains_key(addr)
    }

    fn endpoint(&self, addr: &EndpointAddr) -> Result<Arc<EndpointPool>> {
        self.endpoints
            .get(addr)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownEndpoint(addr.clone()))
    }

    /// Register a pool for `addr` unless one exists. Returns the new pool.
    fn provision(&self, addr: EndpointAddr) -> Option<Arc<EndpointPool>> {
        match self.endpoints.entry(addr) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let endpoint = Arc::new(EndpointPool::new(slot.key().clone(), self.config.pool_size));
                slot.insert(Arc::clone(&endpoint));
                Some(endpoint)
            }
        }
    }

    /// Establish every slot of a fresh endpoint pool concurrently.
    async fn fill(&self, endpoint: &Arc<EndpointPool>, limit: Option<u32>) -> usize {
        let attempts = (0..self.config.pool_size).map(|_| async move {
            match self.connect_with_retry(endpoint, limit).await {
                Ok(conn) => {
                    self.offer(endpoint, conn).await;
                    true
                }
                Err(e) => {
                    warn!("Slot for {} left vacant: {}", endpoint.addr, e);
                    endpoint.mark_vacant();
                    false
                }
            }
        });

        let established = join_all(attempts).await.into_iter().filter(|ok| *ok).count();
        debug!(
            "Established {}/{} connections to {}",
            established, self.config.pool_size, endpoint.addr
        );
        established
    }

    async fn connect_with_retry(
        &self,
        endpoint: &EndpointPool,
        limit: Option<u32>,
    ) -> Result<Connection> {
        let mut attempt = 0;
        loop {
            if self.is_shutdown() {
                return Err(Error::ShuttingDown);
            }
            if endpoint.is_retired() {
                return Err(Error::UnknownEndpoint(endpoint.addr.clone()));
            }

            match self.connect(&endpoint.addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    attempt += 1;
                    if limit.is_some_and(|max| attempt >= max) {
                        return Err(ConnectionError::RetriesExhausted {
                            addr: endpoint.addr.clone(),
                            attempts: attempt,
                        }
                        .into());
                    }

                    let delay = self.config.retry.backoff(attempt);
                    warn!(
                        "Connect attempt {} to {} failed: {}, retrying in {:?}",
                        attempt, endpoint.addr, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn connect(&self, addr: &EndpointAddr) -> Result<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Connection::connect(
            id,
            addr.clone(),
            &self.config,
            self.serialization,
            Arc::clone(&self.pending),
        )
        .await
    }
}

/// A connection lent out by the pool.
///
/// Dropping the guard releases the connection on a spawned task; call
/// [`PooledConnection::release`] to release it inline instead.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    endpoint: Arc<EndpointPool>,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or(Error::Transport(ConnectionError::Closed))
    }

    /// Id of the lent connection.
    ///
    /// # Errors
    ///
    /// Fails only if the connection was already handed back.
    pub fn id(&self) -> Result<u64> {
        self.conn().map(Connection::id)
    }

    /// Endpoint the connection belongs to.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointAddr {
        &self.endpoint.addr
    }

    /// Whether the lent connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_open)
    }

    /// Write one request on the lent connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub async fn send(&mut self, request: InvocationRequest) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.send(request).await,
            None => Err(ConnectionError::Closed.into()),
        }
    }

    /// Hand the connection back to the pool and wait until it is queued or
    /// replaced.
    pub async fn release(mut self) {
        let conn = self.conn.take();
        self.pool.release_to(&self.endpoint, conn).await;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if let Ok(handle) = Handle::try_current() {
            let pool = Arc::clone(&self.pool);
            let endpoint = Arc::clone(&self.endpoint);
            handle.spawn(async move {
                pool.release_to(&endpoint, Some(conn)).await;
            });
        } else {
            // Outside a runtime nothing can reconnect; leave the slot vacant
            drop(conn);
            self.endpoint.mark_vacant();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    /// Accepts connections and holds them open until told to drop them.
    struct Sink {
        addr: EndpointAddr,
        held: Arc<Mutex<Vec<TcpStream>>>,
    }

    impl Sink {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = EndpointAddr::from(listener.local_addr().unwrap());
            let held = Arc::new(Mutex::new(Vec::new()));
            let accepted = Arc::clone(&held);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.lock().await.push(stream);
                }
            });
            Self { addr, held }
        }

        async fn drop_all(&self) {
            self.held.lock().await.clear();
        }
    }

    fn pool(size: usize, exhaustion: ExhaustionPolicy) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            pool_size: size,
            connect_timeout: Duration::from_millis(500),
            exhaustion,
            retry: crate::config::RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(ConnectionPool::new(
            config,
            Serialization::Bincode,
            Arc::new(PendingTable::new()),
        ))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_initialize_fills_every_slot() {
        let sink = Sink::start().await;
        let pool = pool(3, ExhaustionPolicy::FailFast);

        pool.initialize([sink.addr.clone()]).await.unwrap();

        assert_eq!(pool.idle_count(&sink.addr), 3);
        assert_eq!(pool.vacant_count(&sink.addr), 0);
    }

    #[tokio::test]
    async fn test_invalid_address_is_fatal() {
        let sink = Sink::start().await;
        let pool = pool(2, ExhaustionPolicy::FailFast);

        let result = pool
            .initialize([sink.addr.clone(), EndpointAddr::new("", 9000)])
            .await;

        assert!(matches!(result, Err(Error::Registry(_))));
        assert!(pool.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_empty_when_exhausted() {
        let sink = Sink::start().await;
        let pool = pool(2, ExhaustionPolicy::FailFast);
        pool.initialize([sink.addr.clone()]).await.unwrap();

        let a = pool.acquire(&sink.addr).await.unwrap().unwrap();
        let b = pool.acquire(&sink.addr).await.unwrap().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(pool.acquire(&sink.addr).await.unwrap().is_none());

        pool.release(&sink.addr, Some(a)).await;
        pool.release(&sink.addr, Some(b)).await;
        assert_eq!(pool.idle_count(&sink.addr), 2);
    }

    #[tokio::test]
    async fn test_release_replaces_closed_connection() {
        let sink = Sink::start().await;
        let pool = pool(1, ExhaustionPolicy::FailFast);
        pool.initialize([sink.addr.clone()]).await.unwrap();

        let conn = pool.acquire(&sink.addr).await.unwrap().unwrap();
        let old_id = conn.id();
        sink.drop_all().await;
        wait_until(|| !conn.is_open()).await;

        pool.release(&sink.addr, Some(conn)).await;

        assert_eq!(pool.idle_count(&sink.addr), 1);
        let fresh = pool.acquire(&sink.addr).await.unwrap().unwrap();
        assert_ne!(fresh.id(), old_id);
        assert!(fresh.is_usable());
    }

    #[tokio::test]
    async fn test_release_none_tops_up() {
        let sink = Sink::start().await;
        let pool = pool(2, ExhaustionPolicy::FailFast);
        pool.initialize([sink.addr.clone()]).await.unwrap();

        let lost = pool.acquire(&sink.addr).await.unwrap().unwrap();
        drop(lost);
        assert_eq!(pool.idle_count(&sink.addr), 1);

        pool.release(&sink.addr, None).await;
        assert_eq!(pool.idle_count(&sink.addr), 2);
    }

    #[tokio::test]
    async fn test_idle_count_never_exceeds_pool_size() {
        let sink = Sink::start().await;
        let pool = pool(2, ExhaustionPolicy::FailFast);
        pool.initialize([sink.addr.clone()]).await.unwrap();

        // Extra top-ups beyond capacity are closed, not queued
        pool.release(&sink.addr, None).await;
        pool.release(&sink.addr, None).await;
        assert_eq!(pool.idle_count(&sink.addr), 2);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            let addr = sink.addr.clone();
            tasks.push(tokio::spawn(async move {
                if let Ok(Some(conn)) = pool.acquire(&addr).await {
                    assert!(pool.idle_count(&addr) <= 2);
                    tokio::task::yield_now().await;
                    pool.release(&addr, Some(conn)).await;
                }
                assert!(pool.idle_count(&addr) <= 2);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.idle_count(&sink.addr), 2);
    }

    #[tokio::test]
    async fn test_checkout_fail_fast_and_wait() {
        let sink = Sink::start().await;

        let fail_fast = pool(1, ExhaustionPolicy::FailFast);
        fail_fast.initialize([sink.addr.clone()]).await.unwrap();
        let held = fail_fast
            .checkout(&sink.addr, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        let err = fail_fast
            .checkout(&sink.addr, Instant::now() + Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PoolExhausted(_)));
        held.release().await;

        let waiting = pool(1, ExhaustionPolicy::Wait);
        waiting.initialize([sink.addr.clone()]).await.unwrap();
        let held = waiting
            .checkout(&sink.addr, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        let releaser = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            held.release().await;
        });
        let second = waiting
            .checkout(&sink.addr, Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
        assert!(second.is_open());
        releaser.await.unwrap();

        let err = waiting
            .checkout(&sink.addr, Instant::now() + Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_dropped_guard_returns_connection() {
        let sink = Sink::start().await;
        let pool = pool(1, ExhaustionPolicy::FailFast);
        pool.initialize([sink.addr.clone()]).await.unwrap();

        let guard = pool
            .checkout(&sink.addr, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pool.idle_count(&sink.addr), 0);
        drop(guard);

        let addr = sink.addr.clone();
        wait_until(|| pool.idle_count(&addr) == 1).await;
    }

    #[tokio::test]
    async fn test_drain_closes_idle_and_returned_connections() {
        let sink = Sink::start().await;
        let pool = pool(2, ExhaustionPolicy::FailFast);
        pool.initialize([sink.addr.clone()]).await.unwrap();

        let lent = pool.acquire(&sink.addr).await.unwrap().unwrap();
        pool.update_endpoints(&HashSet::new()).await.unwrap();

        assert!(!pool.contains(&sink.addr));
        assert!(matches!(
            pool.acquire(&sink.addr).await,
            Err(Error::UnknownEndpoint(_))
        ));

        pool.release(&sink.addr, Some(lent)).await;
        assert_eq!(pool.idle_count(&sink.addr), 0);
    }

    #[tokio::test]
    async fn test_unreachable_new_endpoint_is_vacant_then_refilled() {
        // Reserve a port and free it so nothing listens there yet
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = EndpointAddr::from(probe.local_addr().unwrap());
        drop(probe);

        let pool = pool(1, ExhaustionPolicy::FailFast);
        pool.update_endpoints(&HashSet::from([addr.clone()]))
            .await
            .unwrap();
        assert_eq!(pool.idle_count(&addr), 0);
        assert_eq!(pool.vacant_count(&addr), 1);

        assert!(matches!(
            pool.acquire(&addr).await,
            Err(Error::Transport(_))
        ));
        assert_eq!(pool.vacant_count(&addr), 1);

        let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await.unwrap();
        let _accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let conn = pool.acquire(&addr).await.unwrap().unwrap();
        assert_eq!(pool.vacant_count(&addr), 0);
        pool.release(&addr, Some(conn)).await;
        assert_eq!(pool.idle_count(&addr), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_refuses_checkout() {
        let sink = Sink::start().await;
        let pending = Arc::new(PendingTable::new());
        let pool = Arc::new(ConnectionPool::new(
            PoolConfig {
                pool_size: 1,
                ..Default::default()
            },
            Serialization::Json,
            Arc::clone(&pending),
        ));
        pool.initialize([sink.addr.clone()]).await.unwrap();

        let rx = pending.register(uuid::Uuid::new_v4(), 99).unwrap();
        pool.shutdown().await;

        assert!(matches!(rx.await.unwrap(), Err(Error::ShuttingDown)));
        assert!(pool.endpoints().is_empty());
        assert!(matches!(
            pool.acquire(&sink.addr).await,
            Err(Error::UnknownEndpoint(_))
        ));
    }

    /// A listener that never accepts, with its backlog filled so further
    /// connects hang.
    async fn stalled_listener() -> (tokio::net::TcpListener, Vec<TcpStream>) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let local = listener.local_addr().unwrap();

        let mut queued = Vec::new();
        for _ in 0..16 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(local)).await {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }
        (listener, queued)
    }

    #[tokio::test]
    async fn test_refill_connect_bounded_by_deadline() {
        let (listener, _queued) = stalled_listener().await;
        let addr = EndpointAddr::from(listener.local_addr().unwrap());
        let config = PoolConfig {
            pool_size: 1,
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let pool = Arc::new(ConnectionPool::new(
            config,
            Serialization::Bincode,
            Arc::new(PendingTable::new()),
        ));
        let endpoint = pool.provision(addr.clone()).unwrap();
        endpoint.mark_vacant();

        let started = Instant::now();
        let result = pool
            .checkout(&addr, Instant::now() + Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        // The abandoned connect hands its slot back
        assert_eq!(pool.vacant_count(&addr), 1);
        assert_eq!(pool.idle_count(&addr), 0);
    }
}
