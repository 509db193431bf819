//! Transport layer for the invoker.
//!
//! This module handles connections to provider endpoints, their pooling,
//! routing of inbound responses to waiting callers, and the dispatcher tying
//! them together.

pub mod connection;
pub mod invoker;
pub mod pending;
pub mod pool;
mod router;

pub use connection::Connection;
pub use invoker::{Invoker, InvokerBuilder};
pub use pending::{PendingTable, ResponseReceiver, ResponseSender};
pub use pool::{ConnectionPool, PooledConnection};
