//! Message framing for the wire protocol.
//!
//! Every envelope travels as one frame:
//!
//! ```text
//! +----------------+-----+----------------------+
//! | length: u32 BE | tag | payload (length B)   |
//! +----------------+-----+----------------------+
//! ```
//!
//! `length` counts payload bytes only. `tag` names the serialization of the
//! payload and must match the process-wide configured one.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Envelope, Serialization};

/// Maximum payload size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size (4 bytes length + 1 byte serialization tag).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Codec writing any envelope and reading envelopes of type `D`.
///
/// A client connection is a `WireCodec<InvocationResponse>`: it encodes
/// requests and decodes responses. Partial frames stay in the read buffer until
/// the whole payload has arrived.
#[derive(Debug)]
pub struct WireCodec<D> {
    serialization: Serialization,
    max_frame_size: usize,
    _decodes: PhantomData<fn() -> D>,
}

impl<D> WireCodec<D> {
    /// Create a codec for the given serialization.
    #[must_use]
    pub const fn new(serialization: Serialization) -> Self {
        Self {
            serialization,
            max_frame_size: MAX_FRAME_SIZE,
            _decodes: PhantomData,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Serialization this codec speaks.
    #[must_use]
    pub const fn serialization(&self) -> Serialization {
        self.serialization
    }

    fn check_size(&self, size: usize) -> std::result::Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    fn check_tag(&self, tag: u8) -> std::result::Result<(), ProtocolError> {
        let actual = Serialization::from_tag(tag)?;
        if actual != self.serialization {
            return Err(ProtocolError::SerializationMismatch {
                expected: self.serialization.name(),
                actual: actual.name(),
            });
        }
        Ok(())
    }
}

impl<D: Envelope> Decoder for WireCodec<D> {
    type Item = D;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least header size
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;
        let tag = header.get_u8();

        self.check_size(payload_len)?;
        self.check_tag(tag)?;

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        self.serialization.deserialize(&payload).map(Some)
    }
}

impl<D, E: Envelope> Encoder<E> for WireCodec<D> {
    type Error = Error;

    fn encode(&mut self, envelope: E, buf: &mut BytesMut) -> Result<()> {
        let payload = self.serialization.serialize(&envelope)?;
        self.check_size(payload.len())?;

        buf.reserve(FRAME_HEADER_SIZE + payload.len());

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload.len() as u32);
        buf.put_u8(self.serialization.tag());
        buf.put(payload);

        Ok(())
    }
}

/// Encode one envelope into a complete frame.
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized or is too large.
pub fn encode_frame<E: Envelope>(envelope: E, serialization: Serialization) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    WireCodec::<E>::new(serialization).encode(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one complete frame holding an envelope of kind `D::KIND`.
///
/// # Errors
///
/// Returns an error if the frame is truncated, carries trailing bytes, names
/// another serialization, or does not hold a `D`.
pub fn decode_frame<D: Envelope>(frame: &[u8], serialization: Serialization) -> Result<D> {
    let mut buf = BytesMut::from(frame);
    let decoded = WireCodec::<D>::new(serialization).decode(&mut buf)?;
    match decoded {
        Some(envelope) if buf.is_empty() => Ok(envelope),
        Some(_) => Err(crate::error::CodecError::DeserializationFailed(format!(
            "{} trailing bytes after {} frame",
            buf.len(),
            D::KIND
        ))
        .into()),
        None => Err(crate::error::CodecError::DeserializationFailed(format!(
            "truncated {} frame",
            D::KIND
        ))
        .into()),
    }
}
