//! Gateway transport layer.
//!
//! One listening socket serves two kinds of traffic: the browser
//! extension's long-lived WebSocket, and short-lived `POST /command`
//! requests from other local processes. Both arrive as plain TCP; the
//! per-connection read task classifies them and routes accordingly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   POST /command    ┌─────────────────┐    WebSocket   ┌────────────┐
//! │ Local caller │───────────────────►│  GatewayServer   │◄──────────────►│ Extension  │
//! │  (one-shot)  │◄──── 200 JSON ─────│  port 3457       │  text frames   │  (peer)    │
//! └──────────────┘   parked until     │  Registry        │                └────────────┘
//!                    correlated reply │  Correlator      │
//!                                     └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `server` | Listener, accept loop, dispatcher-facing sends |
//! | `connection` | Per-socket state machine and read task |
//! | `registry` | Shared id → connection map |
//! | `bridge` | Request correlator and HTTP bridging |

// ============================================================================
// Submodules
// ============================================================================

/// Request correlator and HTTP-to-WebSocket bridge.
pub(crate) mod bridge;

/// Per-socket connection state and read loop.
pub mod connection;

/// Shared connection registry.
pub mod registry;

/// Gateway listener and accept loop.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, ConnectionState};
pub use registry::ConnectionRegistry;
pub use server::GatewayServer;
