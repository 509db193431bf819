//! Pluggable payload serialization.
//!
//! The strategy is chosen once from configuration and shared by the encoder
//! and decoder of every connection. Each strategy owns a one-byte wire tag that
//! the frame header carries so a peer speaking a different format is detected
//! rather than misread.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{CodecError, ProtocolError, Result};

/// Serialization strategy for envelopes and argument payloads.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Serialization {
    /// Compact binary format via `bincode`.
    #[default]
    Bincode,
    /// CBOR via `ciborium`.
    Cbor,
    /// JSON via `serde_json`.
    Json,
}

impl Serialization {
    /// Every supported strategy.
    pub const ALL: [Self; 3] = [Self::Bincode, Self::Cbor, Self::Json];

    /// Wire tag written after the frame length.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Bincode => 0x01,
            Self::Cbor => 0x02,
            Self::Json => 0x03,
        }
    }

    /// Strategy named by a wire tag.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownSerialization` for unassigned tags.
    pub const fn from_tag(tag: u8) -> std::result::Result<Self, ProtocolError> {
        match tag {
            0x01 => Ok(Self::Bincode),
            0x02 => Ok(Self::Cbor),
            0x03 => Ok(Self::Json),
            other => Err(ProtocolError::UnknownSerialization(other)),
        }
    }

    /// Configuration identifier.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bincode => "bincode",
            Self::Cbor => "cbor",
            Self::Json => "json",
        }
    }

    /// Serialize a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    pub fn serialize<T: Serialize>(self, value: &T) -> Result<Bytes> {
        let vec = match self {
            Self::Bincode => bincode::serialize(value)
                .map_err(|e| CodecError::SerializationFailed(e.to_string()))?,
            Self::Cbor => {
                let mut vec = Vec::new();
                ciborium::ser::into_writer(value, &mut vec).map_err(CodecError::from)?;
                vec
            }
            Self::Json => serde_json::to_vec(value)
                .map_err(|e| CodecError::SerializationFailed(e.to_string()))?,
        };
        Ok(Bytes::from(vec))
    }

    /// Deserialize a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is invalid for this format or shape.
    pub fn deserialize<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        let value = match self {
            Self::Bincode => bincode::deserialize(data).map_err(CodecError::from)?,
            Self::Cbor => ciborium::de::from_reader(data).map_err(CodecError::from)?,
            Self::Json => serde_json::from_slice(data).map_err(CodecError::from)?,
        };
        Ok(value)
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Serialization {
    type Err = CodecError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CodecError::UnsupportedCodec(s.to_string()))
    }
}
