//! A single pooled connection to one provider endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ares_registry::EndpointAddr;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{ConnectionError, Error, Result};
use crate::protocol::{InvocationRequest, InvocationResponse, Serialization, WireCodec};
use crate::transport::pending::PendingTable;
use crate::transport::router::ResponseRouter;

/// Framed client side of a TCP stream: writes requests, reads responses.
pub(crate) type ClientFramed = Framed<TcpStream, WireCodec<InvocationResponse>>;

/// Upper bound for flushing and shutting down the write half on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Liveness flags shared between a connection and its response router.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    open: AtomicBool,
    writable: AtomicBool,
}

impl ConnectionState {
    const fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            writable: AtomicBool::new(true),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
    }
}

/// One network stream bound to exactly one endpoint.
///
/// Owned by the pool while idle and lent to exactly one caller while in use.
/// Inbound frames are handled by a `ResponseRouter` task, so responses keep
/// flowing while the connection sits idle in the pool.
pub struct Connection {
    id: u64,
    endpoint: EndpointAddr,
    sink: SplitSink<ClientFramed, InvocationRequest>,
    state: Arc<ConnectionState>,
    pending: Arc<PendingTable>,
    router: JoinHandle<()>,
}

impl Connection {
    /// Connect to `endpoint` and start routing its responses.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the endpoint cannot be reached within the
    /// connect timeout.
    pub(crate) async fn connect(
        id: u64,
        endpoint: EndpointAddr,
        config: &PoolConfig,
        serialization: Serialization,
        pending: Arc<PendingTable>,
    ) -> Result<Self> {
        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(endpoint.clone(), config.connect_timeout))?
        .map_err(|e| ConnectionError::ConnectFailed {
            addr: endpoint.clone(),
            source: e,
        })?;

        stream.set_nodelay(true)?;

        let codec = WireCodec::new(serialization).with_max_frame_size(config.max_frame_size);
        let (sink, stream) = Framed::new(stream, codec).split();

        let state = Arc::new(ConnectionState::new());
        let router = ResponseRouter::new(
            id,
            endpoint.clone(),
            Arc::clone(&state),
            Arc::clone(&pending),
        );
        let router = tokio::spawn(router.run(stream));

        debug!("Created new connection {} to {}", id, endpoint);

        Ok(Self {
            id,
            endpoint,
            sink,
            state,
            pending,
            router,
        })
    }

    /// Get the connection ID.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Endpoint this connection belongs to.
    #[must_use]
    pub const fn endpoint(&self) -> &EndpointAddr {
        &self.endpoint
    }

    /// Whether the stream is still open in both directions as far as we know.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Whether the last write succeeded.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.state.writable.load(Ordering::SeqCst)
    }

    /// Open and writable: fit to be pooled.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.is_open() && self.is_writable()
    }

    /// Encode and write one request.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails, which also marks the
    /// connection unwritable. Encoding failures leave the connection usable.
    pub async fn send(&mut self, request: InvocationRequest) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectionError::Closed.into());
        }

        match self.sink.send(request).await {
            Ok(()) => Ok(()),
            Err(Error::Io(e)) => {
                self.state.writable.store(false, Ordering::SeqCst);
                Err(ConnectionError::Broken(e.to_string()).into())
            }
            Err(e) => Err(e),
        }
    }

    /// Flush and shut down the write half, then drop the connection.
    pub async fn close(mut self) {
        self.state.mark_closed();
        match timeout(CLOSE_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => debug!("Closed connection {} to {}", self.id, self.endpoint),
            Ok(Err(e)) => debug!("Connection {} closed uncleanly: {}", self.id, e),
            Err(_) => debug!("Connection {} close timed out", self.id),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.state.mark_closed();
        self.router.abort();

        let failed = self
            .pending
            .fail_connection(self.id, &Error::Transport(ConnectionError::Closed));
        if failed > 0 {
            debug!(
                "Failed {} in-flight calls on discarded connection {}",
                failed, self.id
            );
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
