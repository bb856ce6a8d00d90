//! Browser Gateway - Local protocol bridge for browser-extension automation.
//!
//! This library runs a single listening port that serves two very different
//! clients at once: the browser extension keeps one long-lived WebSocket
//! open, and other local processes issue one-off `POST /command` requests.
//! The gateway bridges the two: each HTTP command borrows a round trip over
//! the WebSocket, correlated by a generated id.
//!
//! # Architecture
//!
//! The WebSocket wire protocol (opening handshake and base framing) is
//! implemented by hand; no protocol library sits between the gateway and
//! the bytes.
//!
//! - One accept loop plus one read task per connection, all on the shared
//!   tokio runtime
//! - The connection registry is the only cross-task state, guarded by a
//!   single mutex
//! - Tool semantics live outside: the gateway reports inbound messages
//!   through [`GatewayDelegate`] and the dispatcher pushes outbound ones
//!   through [`GatewayServer`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use browser_gateway::{GatewayOptions, GatewayServer, NoopDelegate, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Listen on the default port (3457) with a no-op event sink.
//!     let server = GatewayServer::start(GatewayOptions::new(), Arc::new(NoopDelegate)).await?;
//!     println!("gateway listening on port {}", server.port());
//!
//!     // ... the extension connects, local callers POST /command ...
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`delegate`] | Event-sink trait wired to the external tool dispatcher |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`options`] | Gateway configuration |
//! | [`protocol`] | Frame codec, handshake, JSON message shapes |
//! | [`transport`] | Listener, connections, registry, correlator |

// ============================================================================
// Modules
// ============================================================================

/// Delegate interface between the gateway and the tool dispatcher.
///
/// Every callback has a no-op default implementation.
pub mod delegate;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for gateway entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Gateway configuration options.
pub mod options;

/// Wire protocol: WebSocket framing, HTTP handshake, JSON messages.
pub mod protocol;

/// Gateway transport layer.
///
/// Listener, per-connection state, registry, and HTTP bridging.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Delegate types
pub use delegate::{GatewayDelegate, NoopDelegate};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, CorrelationId};

// Configuration
pub use options::{DEFAULT_PORT, GatewayOptions};

// Transport types
pub use transport::{Connection, ConnectionState, GatewayServer};
