//! Delegate interface between the gateway and the tool dispatcher.
//!
//! The gateway reports lifecycle events and uncorrelated inbound messages
//! through [`GatewayDelegate`]; the dispatcher pushes outbound messages
//! through [`crate::transport::GatewayServer::send_to`] and
//! [`crate::transport::GatewayServer::broadcast`].
//!
//! Every method has a no-op default, so embedders implement only the
//! callbacks they care about.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use serde_json::Value;

use crate::identifiers::ConnectionId;

// ============================================================================
// GatewayDelegate
// ============================================================================

/// Event sink for gateway lifecycle and inbound browser messages.
///
/// Called from connection tasks; implementations must be cheap or hand work
/// off to their own tasks.
#[async_trait]
pub trait GatewayDelegate: Send + Sync {
    /// The gateway is listening.
    async fn on_server_started(&self, port: u16) {
        let _ = port;
    }

    /// The gateway stopped and all connections were closed.
    async fn on_server_stopped(&self) {}

    /// A browser peer identified itself.
    async fn on_browser_connected(&self, connection_id: &ConnectionId, browser_name: Option<&str>) {
        let _ = (connection_id, browser_name);
    }

    /// An established browser peer disconnected.
    async fn on_browser_disconnected(&self, connection_id: &ConnectionId) {
        let _ = connection_id;
    }

    /// An inbound message that matched no pending correlation.
    ///
    /// Carries unsolicited events (`{"event": ...}`) and any other message a
    /// peer sends outside a bridged round trip.
    async fn on_tool_request(&self, message: Value, connection_id: &ConnectionId) {
        let _ = (message, connection_id);
    }
}

// ============================================================================
// NoopDelegate
// ============================================================================

/// Delegate that ignores every event.
///
/// Useful for tests and for embedders that only push outbound messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

#[async_trait]
impl GatewayDelegate for NoopDelegate {}

// ============================================================================
// Tests
// ============================================================================
