//! Payload Codec Seam
//!
//! The session layer moves opaque payload buffers; turning those buffers into
//! application messages (login, directory, market-price payloads) is the job of
//! a codec supplied by the application. This crate defines that seam: the
//! [`PayloadCodec`] trait and the negotiated [`WireFormat`] selector.
//!
//! The JSON wire format is a pass-through selection made at channel
//! negotiation time - the transport does not convert between formats, it only
//! records which codec the peer agreed to speak.

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codec errors surfaced to the application
#[derive(Error, Debug)]
pub enum CodecError {
    /// Payload could not be decoded into an application message
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Application message could not be encoded into a payload
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// Peer negotiated a wire format this codec does not speak
    #[error("Unsupported wire format: {format:?}")]
    UnsupportedFormat { format: WireFormat },
}

impl CodecError {
    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an encode error
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Wire format negotiated during the channel handshake
///
/// Carried as a single byte in the connect request/ack frames.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum WireFormat {
    /// Native binary payloads
    Binary = 0,
    /// JSON payloads, handled by a pass-through codec above this layer
    Json = 1,
}

impl Default for WireFormat {
    fn default() -> Self {
        WireFormat::Binary
    }
}

/// Application-payload codec consumed by the session layer
///
/// Implementations own the message model; the transport only sees `Bytes`.
pub trait PayloadCodec: Send {
    /// Decoded application message type
    type Message;

    /// Decode one opaque payload buffer into an application message
    fn decode(&self, payload: Bytes) -> Result<Self::Message>;

    /// Encode an application message into an opaque payload buffer
    fn encode(&self, message: &Self::Message) -> Result<Bytes>;

    /// The wire format this codec speaks
    fn wire_format(&self) -> WireFormat;
}

/// Identity codec: payloads in, payloads out
///
/// Used by sessions that forward buffers without interpreting them, and by the
/// test harness.
#[derive(Debug, Clone, Default)]
pub struct PassthroughCodec {
    format: WireFormat,
}

impl PassthroughCodec {
    /// Create a pass-through codec for the given wire format
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }
}

impl PayloadCodec for PassthroughCodec {
    type Message = Bytes;

    fn decode(&self, payload: Bytes) -> Result<Bytes> {
        Ok(payload)
    }

    fn encode(&self, message: &Bytes) -> Result<Bytes> {
        Ok(message.clone())
    }

    fn wire_format(&self) -> WireFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_roundtrip() {
        assert_eq!(WireFormat::try_from(0u8), Ok(WireFormat::Binary));
        assert_eq!(WireFormat::try_from(1u8), Ok(WireFormat::Json));
        assert!(WireFormat::try_from(2u8).is_err());

        let byte: u8 = WireFormat::Json.into();
        assert_eq!(byte, 1);
    }

    #[test]
    fn test_passthrough_codec() {
        let codec = PassthroughCodec::new(WireFormat::Binary);
        let payload = Bytes::from_static(b"market-price update");

        let decoded = codec.decode(payload.clone()).unwrap();
        assert_eq!(decoded, payload);

        let encoded = codec.encode(&decoded).unwrap();
        assert_eq!(encoded, payload);
        assert_eq!(codec.wire_format(), WireFormat::Binary);
    }

    #[test]
    fn test_codec_error_constructors() {
        let err = CodecError::decode("truncated field list");
        assert!(err.to_string().contains("truncated field list"));

        let err = CodecError::encode("oversized map entry");
        assert!(err.to_string().contains("Encode error"));
    }
}
