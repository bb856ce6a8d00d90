//! Type-safe identifiers for gateway entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! | Type | Backing | Format |
//! |------|---------|--------|
//! | [`ConnectionId`] | `String` | `browser-<n>` or `http-<uuid>` |
//! | [`CorrelationId`] | `Uuid` | v4 UUID |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CorrelationId
// ============================================================================

/// Identifier linking an outbound WebSocket command to the HTTP caller
/// whose response depends on it.
///
/// Generated once per bridged request; the browser peer echoes it back in
/// the `id` field of its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh random correlation id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a correlation id from its string form.
    ///
    /// Returns `None` if the string is not a valid UUID.
    #[inline]
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Prefix for connections accepted as (potential) browser peers.
const BROWSER_PREFIX: &str = "browser-";

/// Prefix for HTTP callers parked awaiting a correlated reply.
const HTTP_PREFIX: &str = "http-";

/// Monotonic counter standing in for the socket descriptor in browser ids.
static NEXT_CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one accepted socket.
///
/// Every connection starts with a `browser-<n>` id. When an HTTP bridge
/// request arrives on it, the connection is re-keyed in the registry under
/// `http-<correlation id>` so the matching reply can find it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates the next `browser-<n>` id from the global sequence.
    #[inline]
    #[must_use]
    pub fn next_browser() -> Self {
        let seq = NEXT_CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{BROWSER_PREFIX}{seq}"))
    }

    /// Creates the `http-<id>` key for a parked bridge caller.
    #[inline]
    #[must_use]
    pub fn http(correlation_id: &CorrelationId) -> Self {
        Self(format!("{HTTP_PREFIX}{correlation_id}"))
    }

    /// Builds the `http-<id>` key from a raw id string received on the wire.
    #[inline]
    #[must_use]
    pub fn http_raw(raw_id: &str) -> Self {
        Self(format!("{HTTP_PREFIX}{raw_id}"))
    }

    /// Returns `true` for ids of parked HTTP bridge callers.
    #[inline]
    #[must_use]
    pub fn is_http_bridge(&self) -> bool {
        self.0.starts_with(HTTP_PREFIX)
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
