//! Per-connection inbound loop handing responses to their waiting callers.

use std::sync::Arc;

use ares_registry::EndpointAddr;
use futures::StreamExt;
use futures::stream::SplitStream;
use tracing::{debug, error, trace};

use crate::error::{ConnectionError, Error};
use crate::protocol::Envelope;
use crate::transport::connection::{ClientFramed, ConnectionState};
use crate::transport::pending::PendingTable;

/// Reads frames from one connection until it fails or closes.
pub(crate) struct ResponseRouter {
    connection_id: u64,
    endpoint: EndpointAddr,
    state: Arc<ConnectionState>,
    pending: Arc<PendingTable>,
}

impl ResponseRouter {
    pub(crate) const fn new(
        connection_id: u64,
        endpoint: EndpointAddr,
        state: Arc<ConnectionState>,
        pending: Arc<PendingTable>,
    ) -> Self {
        Self {
            connection_id,
            endpoint,
            state,
            pending,
        }
    }

    /// Route responses until the stream ends, then fail whatever is still
    /// waiting on this connection.
    pub(crate) async fn run(self, mut stream: SplitStream<ClientFramed>) {
        let cause = loop {
            match stream.next().await {
                Some(Ok(response)) => {
                    trace!(
                        "Routing response {} from connection {}",
                        response.correlation_id(),
                        self.connection_id
                    );
                    self.pending.complete(response);
                }
                Some(Err(e)) => {
                    error!(
                        "Connection {} to {} failed reading: {}",
                        self.connection_id, self.endpoint, e
                    );
                    break match e {
                        Error::Io(io) => Error::Transport(ConnectionError::Broken(io.to_string())),
                        other => other,
                    };
                }
                None => {
                    debug!(
                        "Connection {} to {} closed by peer",
                        self.connection_id, self.endpoint
                    );
                    break Error::Transport(ConnectionError::Closed);
                }
            }
        };

        // Mark closed first so nobody hands this connection out again
        self.state.mark_closed();
        let failed = self.pending.fail_connection(self.connection_id, &cause);
        if failed > 0 {
            debug!(
                "Failed {} in-flight calls on connection {}",
                failed, self.connection_id
            );
        }
    }
}
