//! Client-side RPC transport core.
//!
//! This crate turns a local call on a remote service into a framed request on
//! a pooled TCP connection to one of the service's providers, and hands the
//! matching response back to the caller.
//!
//! # Features
//!
//! - **Connection Pooling**: A bounded set of connections per provider endpoint,
//!   validated on release and replaced when broken
//! - **Multiplexing**: Connections are lent only for the write; responses are
//!   matched to callers by correlation id
//! - **Pluggable Serialization**: bincode, CBOR or JSON, fixed per process
//! - **Topology Following**: Pools track provider changes pushed by the registry
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ares_invoker::{InvocationRequest, Invoker, Serialization, ServiceDescriptor};
//! use ares_registry::ServiceRegistry;
//!
//! async fn example(registry: Arc<dyn ServiceRegistry>) -> ares_invoker::Result<()> {
//!     let invoker = Invoker::builder()
//!         .app_name("checkout")
//!         .pool_size(4)
//!         .serialization(Serialization::Cbor)
//!         .build()?;
//!     invoker.start(registry, "inventory", "default").await?;
//!
//!     let request = InvocationRequest::new(ServiceDescriptor::new("inventory.Stock"), "reserve")
//!         .arg_value(Serialization::Cbor, &"sku-42")?
//!         .timeout(Duration::from_millis(500));
//!     let reserved: bool = invoker
//!         .invoke(request)
//!         .await?
//!         .into_value(Serialization::Cbor)?;
//!
//!     invoker.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod selector;
pub mod transport;

// Re-export commonly used types
pub use config::{ExhaustionPolicy, InvokerConfig, PoolConfig, RetryPolicy};
pub use error::{CodecError, ConnectionError, Error, ProtocolError, Result};
pub use protocol::{
    ErrorInfo, InvocationRequest, InvocationResponse, ResponseStatus, Serialization, WireCodec,
    decode_frame, encode_frame,
};
pub use selector::{EndpointSelector, RoundRobin};
pub use transport::{
    connection::Connection,
    invoker::{Invoker, InvokerBuilder},
    pending::PendingTable,
    pool::{ConnectionPool, PooledConnection},
};

// Re-export registry types that are part of our public API
pub use ares_registry::{EndpointAddr, ProviderEndpoint, ProviderMap, ServiceDescriptor};
pub use bytes::Bytes;
