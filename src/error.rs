//! Error types for the browser gateway.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use browser_gateway::{Result, Error};
//!
//! async fn example(server: &GatewayServer) -> Result<()> {
//!     server.send_to(&connection_id, &message).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::Io`] |
//! | Protocol | [`Error::Protocol`], [`Error::Handshake`] |
//! | Application | [`Error::InvalidCommand`], [`Error::Json`] |
//! | Correlation | [`Error::NoBrowserPeer`], [`Error::ConnectionNotFound`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::ConnectionId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. Errors are handled
/// at the connection boundary and never propagate across connections.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when gateway configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Socket-level failure on an individual connection.
    ///
    /// Returned when a read or write on a peer socket fails.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed by the peer or by shutdown.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// WebSocket framing violation that more data cannot resolve.
    ///
    /// Returned for internally inconsistent frame headers, e.g. a declared
    /// payload length above the 63-bit limit.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Malformed or unclassifiable HTTP request head.
    ///
    /// Returned when buffered bytes are neither a WebSocket upgrade nor a
    /// `POST /command` request.
    #[error("Handshake error: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Application Errors
    // ========================================================================
    /// A bridge request that names no action.
    ///
    /// Returned when the request body carries neither an `action` nor a
    /// `name` field.
    #[error("Invalid command: {message}")]
    InvalidCommand {
        /// Description of the invalid command.
        message: String,
    },

    // ========================================================================
    // Correlation Errors
    // ========================================================================
    /// No browser peer is connected to take a bridged command.
    #[error("No browser peer connected")]
    NoBrowserPeer,

    /// Connection id not present in the registry.
    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The missing connection's id.
        connection_id: ConnectionId,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates an invalid command error.
    #[inline]
    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            message: message.into(),
        }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(connection_id: ConnectionId) -> Self {
        Self::ConnectionNotFound { connection_id }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a transport-level error.
    ///
    /// Transport errors close the affected connection but are never fatal to
    /// the gateway process.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::Io(_)
        )
    }

    /// Returns `true` if this is a protocol-level error.
    ///
    /// Protocol errors close only the offending connection.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Handshake { .. })
    }

    /// Returns `true` if this error maps to an HTTP `400` response.
    #[inline]
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidCommand { .. } | Self::Handshake { .. } | Self::Json(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("read reset by peer");
        assert_eq!(err.to_string(), "Connection failed: read reset by peer");
    }

    #[test]
    fn test_no_browser_peer_display() {
        assert_eq!(
            Error::NoBrowserPeer.to_string(),
            "No browser peer connected"
        );
    }

    #[test]
    fn test_is_connection_error() {
        let conn_err = Error::connection("test");
        let closed_err = Error::ConnectionClosed;
        let other_err = Error::config("test");

        assert!(conn_err.is_connection_error());
        assert!(closed_err.is_connection_error());
        assert!(!other_err.is_connection_error());
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(Error::protocol("bad frame").is_protocol_error());
        assert!(Error::handshake("bad head").is_protocol_error());
        assert!(!Error::NoBrowserPeer.is_protocol_error());
    }

    #[test]
    fn test_is_bad_request() {
        assert!(Error::invalid_command("no action").is_bad_request());
        assert!(!Error::NoBrowserPeer.is_bad_request());
        assert!(!Error::ConnectionClosed.is_bad_request());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
