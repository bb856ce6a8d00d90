//! Wire protocol: WebSocket framing, HTTP handshake, JSON messages.
//!
//! This module owns everything byte-shaped. It is pure (no sockets, no
//! locks), which is what makes the codec testable in isolation.
//!
//! # Protocol Overview
//!
//! A connection starts as buffered HTTP. [`handshake`] classifies the
//! request: a WebSocket upgrade promotes the socket to framed mode and all
//! further bytes flow through [`frame`]; a `POST /command` becomes an
//! [`OutboundCommand`] via the normalization in [`message`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | RFC 6455 base frame codec |
//! | `handshake` | Request classification and accept-token computation |
//! | `message` | JSON message shapes and command normalization |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket frame codec.
pub mod frame;

/// HTTP request classification and upgrade handshake.
pub mod handshake;

/// JSON wire message types.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{DecodeOutcome, Frame, Opcode, decode_frame, encode_frame};
pub use handshake::{
    HandshakeOutcome, HttpStatus, classify_request, compute_accept, error_response,
    json_response, switching_protocols,
};
pub use message::{CommandRequest, InboundMessage, OutboundCommand, correlated_reply_body};
