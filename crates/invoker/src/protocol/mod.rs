//! Protocol layer for the invoker.
//!
//! This module contains the core protocol definitions including:
//! - Request and response envelopes
//! - Serialization strategies
//! - Framing and codec implementations

pub mod framing;
pub mod message;
pub mod serialization;

pub use framing::{WireCodec, decode_frame, encode_frame};
pub use message::{
    Envelope, EnvelopeKind, ErrorInfo, InvocationRequest, InvocationResponse, ResponseStatus,
};
pub use serialization::Serialization;
