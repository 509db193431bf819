//! Registry boundary for the Ares RPC invoker
//!
//! This crate provides:
//! - Provider endpoint identity types (EndpointAddr, ProviderEndpoint)
//! - Service descriptors shared with the wire data model
//! - The `ServiceRegistry` trait consumed by the invoker

pub mod endpoint;
pub mod error;
pub mod registry;

pub use endpoint::{EndpointAddr, InvokerRegistration, ProviderEndpoint, ServiceDescriptor};
pub use error::RegistryError;
pub use registry::{ProviderMap, ServiceRegistry, endpoint_set};
