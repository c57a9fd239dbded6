//! Connection Handshake
//!
//! After the socket is up, the client sends a `ConnectRequest` frame and the
//! server answers with a `ConnectAck` carrying the negotiated session
//! parameters (protocol version, ping timeout, fragment size, wire format) or
//! a `ConnectNak` with a reason. Negotiation itself is a pure function so the
//! rules are testable without a socket.
//!
//! Request and ack share one fixed 9-byte body:
//! `u8 major, u8 minor, u16 BE ping timeout (s), u32 BE fragment size,
//! u8 wire format`.

use crate::{Result, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use codec::WireFormat;

const HANDSHAKE_BODY_LEN: usize = 9;

/// Handshake parameters proposed by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub major: u8,
    pub minor: u8,
    pub ping_timeout_secs: u16,
    pub max_fragment_size: u32,
    pub wire_format: WireFormat,
}

/// Negotiated parameters returned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub major: u8,
    pub minor: u8,
    pub ping_timeout_secs: u16,
    pub max_fragment_size: u32,
    pub wire_format: WireFormat,
}

/// What the accepting side is willing to negotiate
#[derive(Debug, Clone, Copy)]
pub struct HandshakeLimits {
    pub major: u8,
    pub minor: u8,
    pub min_ping_timeout_secs: u16,
    pub max_ping_timeout_secs: u16,
    pub max_fragment_size: u32,
    pub accept_json: bool,
}

impl Default for HandshakeLimits {
    fn default() -> Self {
        Self {
            major: 1,
            minor: 0,
            min_ping_timeout_secs: 10,
            max_ping_timeout_secs: 255,
            max_fragment_size: 6144,
            accept_json: true,
        }
    }
}

fn encode_fields(
    major: u8,
    minor: u8,
    ping_timeout_secs: u16,
    max_fragment_size: u32,
    wire_format: WireFormat,
) -> Bytes {
    let mut body = BytesMut::with_capacity(HANDSHAKE_BODY_LEN);
    body.put_u8(major);
    body.put_u8(minor);
    body.put_u16(ping_timeout_secs);
    body.put_u32(max_fragment_size);
    body.put_u8(wire_format.into());
    body.freeze()
}

fn decode_fields(mut body: Bytes) -> Result<(u8, u8, u16, u32, WireFormat)> {
    if body.len() != HANDSHAKE_BODY_LEN {
        return Err(TransportError::protocol(format!(
            "Handshake body has {} bytes, expected {}",
            body.len(),
            HANDSHAKE_BODY_LEN
        )));
    }
    let major = body.get_u8();
    let minor = body.get_u8();
    let ping = body.get_u16();
    let frag = body.get_u32();
    let format = WireFormat::try_from(body.get_u8())
        .map_err(|e| TransportError::protocol(format!("Bad wire format byte: {}", e)))?;
    Ok((major, minor, ping, frag, format))
}

impl ConnectRequest {
    pub fn encode(&self) -> Bytes {
        encode_fields(
            self.major,
            self.minor,
            self.ping_timeout_secs,
            self.max_fragment_size,
            self.wire_format,
        )
    }

    pub fn decode(body: Bytes) -> Result<Self> {
        let (major, minor, ping_timeout_secs, max_fragment_size, wire_format) =
            decode_fields(body)?;
        Ok(Self {
            major,
            minor,
            ping_timeout_secs,
            max_fragment_size,
            wire_format,
        })
    }
}

impl ConnectAck {
    pub fn encode(&self) -> Bytes {
        encode_fields(
            self.major,
            self.minor,
            self.ping_timeout_secs,
            self.max_fragment_size,
            self.wire_format,
        )
    }

    pub fn decode(body: Bytes) -> Result<Self> {
        let (major, minor, ping_timeout_secs, max_fragment_size, wire_format) =
            decode_fields(body)?;
        Ok(Self {
            major,
            minor,
            ping_timeout_secs,
            max_fragment_size,
            wire_format,
        })
    }
}

/// Apply the accepting side's negotiation rules to a connect request
///
/// Version majors must match; the minor is the lower of the two. The ping
/// timeout is the client's request clamped into the server's window, and the
/// fragment size is the smaller of both sides. An `Err` is the nak reason
/// sent back to the client.
pub fn negotiate(
    limits: &HandshakeLimits,
    request: &ConnectRequest,
) -> std::result::Result<ConnectAck, String> {
    if request.major != limits.major {
        return Err(format!(
            "unsupported protocol version {}.{}",
            request.major, request.minor
        ));
    }

    if request.wire_format == WireFormat::Json && !limits.accept_json {
        return Err("JSON wire format not supported".to_string());
    }

    if request.max_fragment_size == 0 {
        return Err("fragment size must be non-zero".to_string());
    }

    let ping = request
        .ping_timeout_secs
        .clamp(limits.min_ping_timeout_secs, limits.max_ping_timeout_secs);

    Ok(ConnectAck {
        major: limits.major,
        minor: request.minor.min(limits.minor),
        ping_timeout_secs: ping,
        max_fragment_size: request.max_fragment_size.min(limits.max_fragment_size),
        wire_format: request.wire_format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            major: 1,
            minor: 2,
            ping_timeout_secs: 30,
            max_fragment_size: 6144,
            wire_format: WireFormat::Binary,
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let req = request();
        let decoded = ConnectRequest::decode(req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_ack_roundtrip() {
        let ack = ConnectAck {
            major: 1,
            minor: 0,
            ping_timeout_secs: 60,
            max_fragment_size: 4096,
            wire_format: WireFormat::Json,
        };
        let decoded = ConnectAck::decode(ack.encode()).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn test_decode_rejects_short_body() {
        assert!(ConnectRequest::decode(Bytes::from_static(&[1, 0, 0])).is_err());
    }

    #[test]
    fn test_negotiation_takes_lower_minor_and_fragment() {
        let limits = HandshakeLimits {
            minor: 1,
            max_fragment_size: 4096,
            ..Default::default()
        };
        let ack = negotiate(&limits, &request()).unwrap();
        assert_eq!(ack.minor, 1);
        assert_eq!(ack.max_fragment_size, 4096);
        assert_eq!(ack.wire_format, WireFormat::Binary);
    }

    #[test]
    fn test_negotiation_clamps_ping_timeout() {
        let limits = HandshakeLimits {
            min_ping_timeout_secs: 40,
            max_ping_timeout_secs: 120,
            ..Default::default()
        };
        assert_eq!(negotiate(&limits, &request()).unwrap().ping_timeout_secs, 40);

        let mut req = request();
        req.ping_timeout_secs = 500;
        assert_eq!(negotiate(&limits, &req).unwrap().ping_timeout_secs, 120);
    }

    #[test]
    fn test_negotiation_rejects_major_mismatch() {
        let limits = HandshakeLimits::default();
        let mut req = request();
        req.major = 2;
        assert!(negotiate(&limits, &req).is_err());
    }

    #[test]
    fn test_negotiation_rejects_json_when_unsupported() {
        let limits = HandshakeLimits {
            accept_json: false,
            ..Default::default()
        };
        let mut req = request();
        req.wire_format = WireFormat::Json;
        assert!(negotiate(&limits, &req).is_err());
    }
}
