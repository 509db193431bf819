//! Table of invocations awaiting their response.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Envelope, InvocationResponse};

/// Type alias for response sender channel.
pub type ResponseSender = oneshot::Sender<Result<InvocationResponse>>;

/// Type alias for the receiving half held by the caller.
pub type ResponseReceiver = oneshot::Receiver<Result<InvocationResponse>>;

struct PendingInvocation {
    connection_id: u64,
    sender: ResponseSender,
}

/// Process-wide map from correlation id to the waiting caller.
///
/// Every entry is removed exactly once: by the response router, by the failure
/// of the connection the request was written to, or by the caller's
/// [`PendingGuard`] when it stops waiting.
/// Removal goes through `DashMap::remove`, so whichever of those happens first
/// wins and the others find nothing.
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<Uuid, PendingInvocation>,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call about to be written to `connection_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateCorrelationId` if the id is already outstanding.
    pub fn register(&self, correlation_id: Uuid, connection_id: u64) -> Result<ResponseReceiver> {
        match self.entries.entry(correlation_id) {
            Entry::Occupied(_) => Err(Error::DuplicateCorrelationId(correlation_id)),
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingInvocation {
                    connection_id,
                    sender,
                });
                Ok(receiver)
            }
        }
    }

    /// Deliver a response. Returns `false` if nobody is waiting for it.
    pub fn complete(&self, response: InvocationResponse) -> bool {
        let correlation_id = response.correlation_id();
        match self.entries.remove(&correlation_id) {
            Some((id, pending)) => {
                if pending.sender.send(Ok(response)).is_err() {
                    debug!("Caller for {} went away before its response", id);
                }
                true
            }
            None => {
                warn!(
                    "Discarding response for unknown or expired correlation id {}",
                    correlation_id
                );
                false
            }
        }
    }

    /// Drop an entry without resolving it. Returns whether it was present.
    pub fn remove(&self, correlation_id: &Uuid) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    /// Fail every call written to `connection_id`. Returns how many were failed.
    pub fn fail_connection(&self, connection_id: u64, error: &Error) -> usize {
        let ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        self.fail_ids(ids, error)
    }

    /// Fail every outstanding call.
    pub fn fail_all(&self, error: &Error) -> usize {
        let ids: Vec<Uuid> = self.entries.iter().map(|entry| *entry.key()).collect();
        self.fail_ids(ids, error)
    }

    fn fail_ids(&self, ids: Vec<Uuid>, error: &Error) -> usize {
        let mut failed = 0;
        for id in ids {
            // Lost races against `complete` or a timeout are skipped here
            if let Some((_, pending)) = self.entries.remove(&id) {
                let _ = pending.sender.send(Err(error.replicate()));
                failed += 1;
            }
        }
        failed
    }

    /// Whether a call with this id is outstanding.
    #[must_use]
    pub fn contains(&self, correlation_id: &Uuid) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no call is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tie the entry for `correlation_id` to the returned guard's lifetime.
    pub(crate) const fn guard(&self, correlation_id: Uuid) -> PendingGuard<'_> {
        PendingGuard {
            table: self,
            correlation_id,
        }
    }
}

/// Removes a registered call from its table when dropped, including when the
/// caller's future is dropped mid-call.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    correlation_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.remove(&self.correlation_id) {
            debug!("Abandoned call {} removed from pending table", self.correlation_id);
        }
    }
}
