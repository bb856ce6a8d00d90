//! Request correlator and HTTP-to-WebSocket bridge.
//!
//! A `POST /command` body is normalized into the outbound wire shape, sent
//! to a connected browser peer, and the HTTP connection is parked in the
//! registry under `http-<correlation id>`, open and unresponded, until the
//! peer's reply carrying the same id comes back. Replies that match no
//! parked caller fall through to the delegate as ordinary inbound messages.
//!
//! There is no bridge timeout: a caller whose reply never arrives stays
//! parked until its own socket gives up. The only timer here is the short
//! post-reply linger that lets slow callers finish reading.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::identifiers::ConnectionId;
use crate::protocol::handshake::{HttpStatus, error_response, json_response};
use crate::protocol::message::{CommandRequest, InboundMessage, correlated_reply_body};
use crate::transport::{Connection, GatewayServer};

// ============================================================================
// CommandOutcome
// ============================================================================

/// What became of a bridge request's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandOutcome {
    /// Parked in the registry awaiting a correlated reply.
    Parked,
    /// Answered terminally (400/503); the caller must close it.
    Closed,
}

// ============================================================================
// HTTP Bridge
// ============================================================================

/// Handles a complete `POST /command` body on `connection`.
///
/// On success the connection is re-keyed under the generated correlation id
/// and left open. All failure paths write their HTTP error response here
/// and report [`CommandOutcome::Closed`].
pub(crate) async fn handle_command_request(
    server: &Arc<GatewayServer>,
    connection: &Arc<Connection>,
    body: &[u8],
) -> CommandOutcome {
    let command = match CommandRequest::from_body(body).and_then(CommandRequest::resolve) {
        Ok(command) => command,
        Err(e) => {
            debug!(connection_id = %connection.id(), error = %e, "Rejecting bridge request");
            let _ = connection
                .write_all(&error_response(HttpStatus::BadRequest, &e.to_string()))
                .await;
            return CommandOutcome::Closed;
        }
    };

    let caller_id = connection.id();
    let Some(peer) = server.registry().find_browser_peer(&caller_id) else {
        // No queuing, no retry: the caller retries at a higher layer.
        debug!(connection_id = %caller_id, action = %command.action, "No browser peer for bridged command");
        let _ = connection
            .write_all(&error_response(
                HttpStatus::ServiceUnavailable,
                "no browser peer connected",
            ))
            .await;
        return CommandOutcome::Closed;
    };

    let outbound = match serde_json::to_value(&command) {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!(connection_id = %caller_id, error = %e, "Command serialization failed");
            let _ = connection
                .write_all(&error_response(HttpStatus::BadRequest, &e.to_string()))
                .await;
            return CommandOutcome::Closed;
        }
    };

    // Park before sending so the reply can never race past an
    // unregistered waiter.
    let parked_id = ConnectionId::http(&command.id);
    server.registry().rekey(&caller_id, parked_id.clone());
    connection.set_id(parked_id.clone());
    connection.mark_parked();

    debug!(
        connection_id = %parked_id,
        peer_id = %peer.id(),
        action = %command.action,
        "Bridging command to browser peer"
    );

    if let Err(e) = peer.send_text(&outbound).await {
        warn!(peer_id = %peer.id(), error = %e, "Peer write failed");
        server.close_connection(&peer).await;

        // Un-park and fail the caller; the peer that would have answered
        // is gone.
        server.registry().remove(&parked_id);
        let _ = connection
            .write_all(&error_response(
                HttpStatus::ServiceUnavailable,
                "browser peer write failed",
            ))
            .await;
        return CommandOutcome::Closed;
    }

    CommandOutcome::Parked
}

// ============================================================================
// Peer Messages
// ============================================================================

/// Routes one decoded JSON message from an open WebSocket peer.
///
/// Correlated replies answer their parked HTTP caller; `identify` records
/// the browser name; everything else goes to the delegate.
pub(crate) async fn handle_peer_message(
    server: &Arc<GatewayServer>,
    connection: &Arc<Connection>,
    message: Value,
) {
    match InboundMessage::classify(&message) {
        InboundMessage::Reply { id } => {
            let parked_id = ConnectionId::http_raw(&id);

            // Remove eagerly: at most one reply is ever delivered per
            // correlation id.
            if let Some(parked) = server.registry().remove(&parked_id) {
                deliver_correlated_reply(server, parked, &message).await;
                return;
            }

            trace!(correlation_id = %id, "Reply matched no parked caller; passing through");
            server
                .delegate()
                .on_tool_request(message, &connection.id())
                .await;
        }

        InboundMessage::Identify { browser_name } => {
            debug!(
                connection_id = %connection.id(),
                browser_name = browser_name.as_deref().unwrap_or("unknown"),
                "Browser peer identified"
            );
            connection.set_browser_name(browser_name.clone());
            server
                .delegate()
                .on_browser_connected(&connection.id(), browser_name.as_deref())
                .await;
        }

        InboundMessage::Event => {
            server
                .delegate()
                .on_tool_request(message, &connection.id())
                .await;
        }
    }
}

/// Writes the `200 OK` reply to a parked caller and schedules its close.
async fn deliver_correlated_reply(
    server: &Arc<GatewayServer>,
    parked: Arc<Connection>,
    message: &Value,
) {
    let body = correlated_reply_body(message);
    let response = json_response(HttpStatus::Ok, &body);

    if let Err(e) = parked.write_all(&response).await {
        warn!(connection_id = %parked.id(), error = %e, "Reply write failed");
        server.close_connection(&parked).await;
        return;
    }

    // EOF lets the caller finish reading now; the socket itself lingers so
    // callers that read asynchronously are not cut off mid-read.
    if let Err(e) = parked.shutdown_write().await {
        warn!(connection_id = %parked.id(), error = %e, "Reply half-close failed");
        server.close_connection(&parked).await;
        return;
    }

    debug!(connection_id = %parked.id(), "Correlated reply delivered");

    let server = Arc::clone(server);
    let linger = server.reply_linger();
    tokio::spawn(async move {
        tokio::time::sleep(linger).await;
        // Idempotent: a caller that already hung up is a no-op here.
        server.close_connection(&parked).await;
    });
}
