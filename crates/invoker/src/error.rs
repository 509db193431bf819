//! Error types for the invoker.

use std::io;
use std::time::Duration;

use ares_registry::{EndpointAddr, RegistryError};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ErrorInfo;

/// Result type alias for invoker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for invoker operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry collaborator failure.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Connection refused, reset or broken while in use.
    #[error("Transport error: {0}")]
    Transport(#[from] ConnectionError),

    /// No response within the call's timeout.
    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed frame or wire format disagreement.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Serialization or deserialization failure.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The remote method itself failed.
    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorInfo),

    /// No idle connection to the endpoint was available in time.
    #[error("Connection pool for {0} exhausted")]
    PoolExhausted(EndpointAddr),

    /// No pool exists for the endpoint.
    #[error("No connection pool for endpoint {0}")]
    UnknownEndpoint(EndpointAddr),

    /// The registry knows no provider for the service.
    #[error("No provider available for service '{0}'")]
    NoProvider(String),

    /// A call with this correlation id is already outstanding.
    #[error("Correlation id {0} already in flight")]
    DuplicateCorrelationId(Uuid),

    /// The invoker is shutting down.
    #[error("Invoker is shutting down")]
    ShuttingDown,

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Response channel dropped without a result.
    #[error("Channel closed")]
    ChannelClosed,
}

impl Error {
    /// Whether retrying the same call may succeed.
    ///
    /// Transport failures, timeouts and pool exhaustion are transient; protocol,
    /// codec and remote application failures are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::PoolExhausted(_) | Self::Io(_)
        )
    }

    /// Copy of this error for fanning one failure out to many waiters.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::Protocol(e) => Self::Protocol(e.clone()),
            Self::Codec(e) => Self::Codec(e.clone()),
            Self::Transport(e) => Self::Transport(e.replicate()),
            Self::Io(e) => Self::Transport(ConnectionError::Broken(e.to_string())),
            Self::ShuttingDown => Self::ShuttingDown,
            other => Self::Transport(ConnectionError::Broken(other.to_string())),
        }
    }
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: EndpointAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Connection attempt exceeded the connect timeout.
    #[error("Connecting to {0} timed out after {1:?}")]
    ConnectTimeout(EndpointAddr, Duration),

    /// Gave up re-establishing a connection.
    #[error("Gave up connecting to {addr} after {attempts} attempts")]
    RetriesExhausted {
        /// The address we tried to connect to.
        addr: EndpointAddr,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    Closed,

    /// Write or read failed on an established connection.
    #[error("Connection broken: {0}")]
    Broken(String),
}

impl ConnectionError {
    fn replicate(&self) -> Self {
        match self {
            Self::Closed => Self::Closed,
            other => Self::Broken(other.to_string()),
        }
    }
}

/// Protocol-level errors.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProtocolError {
    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Tag byte names no known serialization.
    #[error("Unknown serialization tag: {0:#04x}")]
    UnknownSerialization(u8),

    /// Peer uses a different serialization than this process.
    #[error("Serialization mismatch: expected {expected}, got {actual}")]
    SerializationMismatch {
        /// Configured serialization.
        expected: &'static str,
        /// Serialization named by the frame.
        actual: &'static str,
    },

    /// Remote peer could not decode our request.
    #[error("Rejected by peer: {0}")]
    Rejected(String),
}

/// Codec-related errors.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Unsupported codec type.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}
