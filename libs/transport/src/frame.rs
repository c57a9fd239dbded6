//! Wire Framing and Fragmentation
//!
//! Every message on a channel travels as a length-prefixed frame:
//! `u16 BE total length` (header included), `u8 kind`, `u8 flags`, body.
//! Payloads larger than the negotiated fragment size are split across
//! multiple `Data` frames and reassembled on the receiving side; reassembly
//! state is per-channel and never shared.

use crate::{Result, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Frame header: length (u16) + kind (u8) + flags (u8)
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest frame the u16 length prefix can describe
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Largest payload the reassembler accepts; a peer declaring more is
/// rejected as a protocol error before anything is allocated
pub const MAX_REASSEMBLED_LEN: usize = 16 * 1024 * 1024;

/// Bound on payloads mid-reassembly per channel
pub const MAX_PARTIAL_PAYLOADS: usize = 32;

/// First frame of a fragmented payload; body starts with total length + id
pub const FLAG_FRAG_START: u8 = 0x01;
/// Continuation frame of a fragmented payload; body starts with id
pub const FLAG_FRAG_NEXT: u8 = 0x02;
/// Final frame of a fragmented payload
pub const FLAG_FRAG_END: u8 = 0x04;

/// Logical frame kinds carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Application payload (possibly one fragment of one)
    Data = 0,
    /// Zero-payload keep-alive
    Ping = 1,
    /// Client handshake request
    ConnectRequest = 2,
    /// Server handshake acceptance with negotiated parameters
    ConnectAck = 3,
    /// Server handshake rejection
    ConnectNak = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Ping),
            2 => Ok(FrameKind::ConnectRequest),
            3 => Ok(FrameKind::ConnectAck),
            4 => Ok(FrameKind::ConnectNak),
            other => Err(TransportError::protocol(format!(
                "Unknown frame kind: {}",
                other
            ))),
        }
    }
}

/// One wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u8,
    pub body: Bytes,
}

impl Frame {
    /// Create an unflagged frame
    pub fn new(kind: FrameKind, body: Bytes) -> Self {
        Self {
            kind,
            flags: 0,
            body,
        }
    }

    /// Create a keep-alive frame
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, Bytes::new())
    }

    /// Total encoded length including the header
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.len()
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let total = self.encoded_len();
        if total > MAX_FRAME_LEN {
            return Err(TransportError::protocol(format!(
                "Frame body {} exceeds wire limit {}",
                self.body.len(),
                MAX_FRAME_LEN - FRAME_HEADER_LEN
            )));
        }

        dst.reserve(total);
        dst.put_u16(total as u16);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flags);
        dst.extend_from_slice(&self.body);
        Ok(())
    }

    /// Decode one frame from the front of `src`, if a complete one is buffered
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `src` only when a full frame is present.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let total = u16::from_be_bytes([src[0], src[1]]) as usize;
        if total < FRAME_HEADER_LEN {
            return Err(TransportError::protocol(format!(
                "Frame length {} below header size",
                total
            )));
        }
        if src.len() < total {
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(2);
        let kind = FrameKind::try_from(frame.get_u8())?;
        let flags = frame.get_u8();

        Ok(Some(Frame {
            kind,
            flags,
            body: frame.freeze(),
        }))
    }
}

/// Split an oversized payload into fragment frames
///
/// `max_chunk` is the negotiated fragment size: the most payload bytes any one
/// frame may carry. Payloads at or below the limit come back as a single
/// unflagged `Data` frame.
pub fn fragment_payload(payload: &Bytes, max_chunk: usize, next_id: &mut u16) -> Result<Vec<Frame>> {
    if max_chunk == 0 {
        return Err(TransportError::protocol("Fragment size must be non-zero"));
    }

    if payload.len() <= max_chunk {
        return Ok(vec![Frame::new(FrameKind::Data, payload.clone())]);
    }

    let id = *next_id;
    *next_id = next_id.wrapping_add(1);

    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let chunk_len = max_chunk.min(payload.len() - offset);
        let chunk = payload.slice(offset..offset + chunk_len);
        let last = offset + chunk_len == payload.len();

        let mut body = BytesMut::with_capacity(6 + chunk_len);
        let flags = if offset == 0 {
            body.put_u32(payload.len() as u32);
            body.put_u16(id);
            FLAG_FRAG_START
        } else {
            body.put_u16(id);
            if last {
                FLAG_FRAG_NEXT | FLAG_FRAG_END
            } else {
                FLAG_FRAG_NEXT
            }
        };

        body.extend_from_slice(&chunk);
        frames.push(Frame {
            kind: FrameKind::Data,
            flags,
            body: body.freeze(),
        });

        offset += chunk_len;
    }

    Ok(frames)
}

/// Per-channel reassembly of fragmented payloads
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<u16, PartialPayload>,
}

#[derive(Debug)]
struct PartialPayload {
    expected: usize,
    buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `Data` frame; returns the complete payload once all fragments
    /// have arrived, or `None` while the payload is still partial.
    ///
    /// Unfragmented frames pass straight through.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Bytes>> {
        if frame.flags & (FLAG_FRAG_START | FLAG_FRAG_NEXT) == 0 {
            return Ok(Some(frame.body));
        }

        let mut body = frame.body;

        if frame.flags & FLAG_FRAG_START != 0 {
            if body.len() < 6 {
                return Err(TransportError::protocol("Truncated fragment start header"));
            }
            let expected = body.get_u32() as usize;
            let id = body.get_u16();

            if expected > MAX_REASSEMBLED_LEN {
                return Err(TransportError::protocol(format!(
                    "Declared payload length {} exceeds limit {}",
                    expected, MAX_REASSEMBLED_LEN
                )));
            }
            if body.len() > expected {
                return Err(TransportError::protocol(format!(
                    "Fragment start carries {} bytes of {} declared for id {}",
                    body.len(),
                    expected,
                    id
                )));
            }
            if self.partial.len() >= MAX_PARTIAL_PAYLOADS && !self.partial.contains_key(&id) {
                return Err(TransportError::protocol(format!(
                    "Too many payloads mid-reassembly ({})",
                    self.partial.len()
                )));
            }

            // Capacity grows with bytes actually received, never with the
            // peer's declaration
            let mut buf = BytesMut::with_capacity(body.len());
            buf.extend_from_slice(&body);
            // A reused id discards the stale partial payload
            self.partial.insert(id, PartialPayload { expected, buf });
            return Ok(None);
        }

        if body.len() < 2 {
            return Err(TransportError::protocol("Truncated fragment header"));
        }
        let id = body.get_u16();

        let partial = self.partial.get_mut(&id).ok_or_else(|| {
            TransportError::protocol(format!("Fragment continuation for unknown id {}", id))
        })?;

        partial.buf.extend_from_slice(&body);
        if partial.buf.len() > partial.expected {
            self.partial.remove(&id);
            return Err(TransportError::protocol(format!(
                "Reassembled payload overruns declared length for id {}",
                id
            )));
        }

        if frame.flags & FLAG_FRAG_END != 0 {
            if let Some(partial) = self.partial.remove(&id) {
                if partial.buf.len() != partial.expected {
                    return Err(TransportError::protocol(format!(
                        "Payload ended at {} of {} declared bytes for id {}",
                        partial.buf.len(),
                        partial.expected,
                        id
                    )));
                }
                return Ok(Some(partial.buf.freeze()));
            }
        }

        Ok(None)
    }

    /// Drop all partial payloads (channel teardown)
    pub fn clear(&mut self) {
        self.partial.clear();
    }

    /// Number of payloads currently mid-reassembly
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
