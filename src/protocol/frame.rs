//! WebSocket frame codec (RFC 6455 base framing).
//!
//! Pure functions over byte buffers: [`decode_frame`] consumes one frame
//! from the front of a receive buffer, [`encode_frame`] produces the bytes
//! for an outgoing frame.
//!
//! # Wire format
//!
//! ```text
//! [FIN|RSV|opcode:1][MASK|len7:1][len16/len64?][mask key?][payload]
//! ```
//!
//! Base length 126 selects a 2-byte big-endian extended length, 127 an
//! 8-byte one. Client frames carry a 4-byte masking key; frames this
//! process sends never do.
//!
//! No extensions and no fragmentation: the gateway emits only FIN frames
//! and does not reassemble continuation frames on receive.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// FIN / MASK bit in the first / second header byte.
const BIT_HIGH: u8 = 0x80;

/// Low-nibble opcode mask.
const OPCODE_MASK: u8 = 0x0F;

/// Base payload length mask.
const LEN_MASK: u8 = 0x7F;

/// Base length value selecting the 16-bit extended length.
const LEN_U16: u8 = 126;

/// Base length value selecting the 64-bit extended length.
const LEN_U64: u8 = 127;

/// Largest payload length the codec accepts (63-bit limit per RFC 6455).
const MAX_PAYLOAD_LEN: u64 = 1 << 63;

// ============================================================================
// Opcode
// ============================================================================

/// WebSocket frame opcode.
///
/// The gateway acts on `Text`, `Close`, `Ping` and `Pong`; everything else
/// decodes but is dropped by the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message (not reassembled here).
    Continuation,
    /// UTF-8 text payload.
    Text,
    /// Binary payload.
    Binary,
    /// Connection close.
    Close,
    /// Keepalive probe; answered with a [`Opcode::Pong`].
    Ping,
    /// Keepalive reply.
    Pong,
    /// Reserved / unknown opcode value.
    Reserved(u8),
}

impl Opcode {
    /// Decodes the low nibble of the first header byte.
    #[inline]
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & OPCODE_MASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Returns the wire value of this opcode.
    #[inline]
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(other) => other & OPCODE_MASK,
        }
    }

    /// Returns `true` for control opcodes (close/ping/pong and reserved
    /// control values).
    #[inline]
    #[must_use]
    pub fn is_control(self) -> bool {
        self.bits() & 0x8 != 0
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded WebSocket frame.
///
/// `payload` is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag. Non-final frames are not reassembled.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the peer masked this frame (clients must, servers must not).
    pub masked: bool,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
}

// ============================================================================
// DecodeOutcome
// ============================================================================

/// Result of one [`decode_frame`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete frame was decoded; drop `consumed` bytes from the buffer
    /// before the next call.
    Frame {
        /// The decoded frame.
        frame: Frame,
        /// Total bytes the frame occupied (header + payload).
        consumed: usize,
    },
    /// The buffer does not yet hold a complete frame. Nothing was consumed;
    /// call again once more bytes arrive.
    NeedMoreData,
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes one frame from the front of `buf`.
///
/// Returns [`DecodeOutcome::NeedMoreData`] while the buffer is short of one
/// complete frame, consuming nothing.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for a declared payload length at or above
/// the 63-bit limit, which no amount of further data can resolve.
pub fn decode_frame(buf: &[u8]) -> Result<DecodeOutcome> {
    if buf.len() < 2 {
        return Ok(DecodeOutcome::NeedMoreData);
    }

    let fin = buf[0] & BIT_HIGH != 0;
    let opcode = Opcode::from_bits(buf[0]);
    let masked = buf[1] & BIT_HIGH != 0;
    let base_len = buf[1] & LEN_MASK;

    // Header cursor past the two fixed bytes.
    let mut offset = 2usize;

    let payload_len: u64 = match base_len {
        LEN_U16 => {
            if buf.len() < offset + 2 {
                return Ok(DecodeOutcome::NeedMoreData);
            }
            let len = u64::from(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
            offset += 2;
            len
        }
        LEN_U64 => {
            if buf.len() < offset + 8 {
                return Ok(DecodeOutcome::NeedMoreData);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            let len = u64::from_be_bytes(bytes);
            if len >= MAX_PAYLOAD_LEN {
                return Err(Error::protocol(format!(
                    "frame length {len} exceeds 63-bit limit"
                )));
            }
            offset += 8;
            len
        }
        n => u64::from(n),
    };

    let masking_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(DecodeOutcome::NeedMoreData);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = payload_len as usize;
    let total = match offset.checked_add(payload_len) {
        Some(total) => total,
        None => {
            return Err(Error::protocol(format!(
                "frame length {payload_len} overflows buffer arithmetic"
            )));
        }
    };
    if buf.len() < total {
        return Ok(DecodeOutcome::NeedMoreData);
    }

    let mut payload = buf[offset..total].to_vec();
    if let Some(key) = masking_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(DecodeOutcome::Frame {
        frame: Frame {
            fin,
            opcode,
            masked,
            payload,
        },
        consumed: total,
    })
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes an outgoing frame.
///
/// FIN is always set (the gateway never fragments) and the MASK bit is
/// always clear (server-to-client frames are unmasked).
#[must_use]
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut buf = Vec::with_capacity(10 + len);

    buf.push(BIT_HIGH | opcode.bits());

    if len < usize::from(LEN_U16) {
        buf.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.push(LEN_U16);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(LEN_U64);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    buf.extend_from_slice(payload);
    buf
}

// ============================================================================
// Tests
// ============================================================================
