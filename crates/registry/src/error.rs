//! Error types for registry operations

use thiserror::Error;

/// Registry-related errors
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Endpoint address can never be connected to
    #[error("Invalid address '{0}': {1}")]
    InvalidAddress(String, &'static str),

    /// No providers known for the requested application
    #[error("No providers registered for application '{0}'")]
    UnknownApplication(String),

    /// Backend (coordination service) failure
    #[error("Registry backend error: {0}")]
    Backend(String),
}
