//! Per-socket connection state and read loop.
//!
//! Every accepted socket gets one [`Connection`] and one spawned read task.
//! The read task owns the receive buffer exclusively; writes may come from
//! any task (the correlator routes other connections' traffic here), so the
//! write half sits behind an async mutex.
//!
//! # State Machine
//!
//! ```text
//! AwaitingHandshake ──► WebSocketOpen ──► Closed
//!         │
//!         └──────────► HttpParked ─────► Closed
//! ```
//!
//! `AwaitingHandshake` buffers bytes until the request classifies as an
//! upgrade or a bridge command. `WebSocketOpen` runs the frame loop
//! indefinitely. `HttpParked` waits, unresponded, for a correlated reply.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::identifiers::ConnectionId;
use crate::protocol::frame::{DecodeOutcome, Frame, Opcode, decode_frame, encode_frame};
use crate::protocol::handshake::{
    HandshakeOutcome, HttpStatus, classify_request, compute_accept, error_response,
    switching_protocols,
};
use crate::transport::GatewayServer;
use crate::transport::bridge::{self, CommandOutcome};

// ============================================================================
// Constants
// ============================================================================

/// Read chunk size for the per-connection receive loop.
const READ_CHUNK: usize = 4096;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted; request not yet classified.
    AwaitingHandshake,
    /// Promoted browser peer speaking WebSocket frames.
    WebSocketOpen,
    /// HTTP caller parked awaiting a correlated reply.
    HttpParked,
    /// Closed; terminal.
    Closed,
}

// ============================================================================
// Connection
// ============================================================================

/// State for one accepted socket.
///
/// The read half lives inside the spawned read task; the write half is
/// shared here so the correlator and the dispatcher can send from other
/// tasks. Closing is idempotent.
pub struct Connection {
    /// Registry key. Re-keyed to `http-<id>` when a bridge request parks
    /// this connection.
    id: Mutex<ConnectionId>,

    /// Lifecycle state.
    state: Mutex<ConnectionState>,

    /// Name reported by the peer's `identify` message.
    browser_name: Mutex<Option<String>>,

    /// Write half; locked per write so interleaved senders stay whole.
    writer: tokio::sync::Mutex<OwnedWriteHalf>,

    /// Set once by whichever path closes first.
    closed: AtomicBool,

    /// Whether this connection ever reached `WebSocketOpen`; drives the
    /// disconnect notification.
    was_open: AtomicBool,

    /// Abort handle for the read task; aborting drops the read half.
    read_task: Mutex<Option<AbortHandle>>,
}

impl Connection {
    /// Creates a connection in `AwaitingHandshake` with a fresh browser id.
    #[must_use]
    pub fn new(write_half: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            id: Mutex::new(ConnectionId::next_browser()),
            state: Mutex::new(ConnectionState::AwaitingHandshake),
            browser_name: Mutex::new(None),
            writer: tokio::sync::Mutex::new(write_half),
            closed: AtomicBool::new(false),
            was_open: AtomicBool::new(false),
            read_task: Mutex::new(None),
        })
    }

    /// Current registry key.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id.lock().clone()
    }

    /// Replaces the registry key (bridge parking).
    pub(crate) fn set_id(&self, id: ConnectionId) {
        *self.id.lock() = id;
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns `true` for established browser peers.
    #[inline]
    #[must_use]
    pub fn is_websocket_open(&self) -> bool {
        self.state() == ConnectionState::WebSocketOpen
    }

    /// Promotes the connection to an open WebSocket peer.
    pub(crate) fn mark_websocket_open(&self) {
        *self.state.lock() = ConnectionState::WebSocketOpen;
        self.was_open.store(true, Ordering::SeqCst);
    }

    /// Parks the connection awaiting a correlated reply.
    pub(crate) fn mark_parked(&self) {
        *self.state.lock() = ConnectionState::HttpParked;
    }

    /// Marks the terminal state.
    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    /// Returns `true` exactly once, for the first closer.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Whether the connection ever reached `WebSocketOpen`.
    #[inline]
    #[must_use]
    pub fn was_websocket_open(&self) -> bool {
        self.was_open.load(Ordering::SeqCst)
    }

    /// Name from the peer's `identify` message, if received.
    #[must_use]
    pub fn browser_name(&self) -> Option<String> {
        self.browser_name.lock().clone()
    }

    /// Records the peer-reported browser name.
    pub(crate) fn set_browser_name(&self, name: Option<String>) {
        *self.browser_name.lock() = name;
    }

    /// Stores the read task's abort handle.
    pub(crate) fn attach_read_task(&self, handle: AbortHandle) {
        *self.read_task.lock() = Some(handle);
    }

    /// Aborts the read task, if still attached.
    pub(crate) fn abort_read_task(&self) {
        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Connection - Writes
// ============================================================================

impl Connection {
    /// Writes raw bytes, looping until complete.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] on socket failure.
    pub async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Sends a frame with the given opcode and payload.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] on socket failure.
    pub async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.write_all(&encode_frame(opcode, payload)).await
    }

    /// Sends a JSON value as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] on serialization failure or
    /// [`crate::Error::Io`] on socket failure.
    pub async fn send_text(&self, value: &Value) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        self.send_frame(Opcode::Text, &json).await
    }

    /// Half-closes the write side, signalling EOF to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] on socket failure.
    pub async fn shutdown_write(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Read Loop
// ============================================================================

/// Outcome of one buffer-processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopAction {
    /// Keep reading.
    Continue,
    /// Stop reading and close the connection.
    Stop,
}

/// Drives one connection from accept to close.
///
/// Owns the receive buffer; nothing else touches it.
pub(crate) async fn run_read_loop(
    server: Arc<GatewayServer>,
    connection: Arc<Connection>,
    mut read_half: OwnedReadHalf,
) {
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                debug!(connection_id = %connection.id(), "Peer closed connection");
                break;
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if process_buffer(&server, &connection, &mut buffer).await == LoopAction::Stop {
                    break;
                }
            }
            Err(e) => {
                warn!(connection_id = %connection.id(), error = %e, "Read failed");
                break;
            }
        }
    }

    server.close_connection(&connection).await;
}

/// Consumes as much of the buffer as the current state allows.
async fn process_buffer(
    server: &Arc<GatewayServer>,
    connection: &Arc<Connection>,
    buffer: &mut Vec<u8>,
) -> LoopAction {
    loop {
        match connection.state() {
            ConnectionState::AwaitingHandshake => match classify_request(buffer) {
                Ok(HandshakeOutcome::NeedMoreData) => return LoopAction::Continue,

                Ok(HandshakeOutcome::Upgrade { key, consumed }) => {
                    let accept = compute_accept(&key);
                    buffer.drain(..consumed);

                    // Promote before replying so a bridge request racing in
                    // right after the 101 already sees an open peer.
                    connection.mark_websocket_open();
                    if let Err(e) = connection.write_all(&switching_protocols(&accept)).await {
                        warn!(connection_id = %connection.id(), error = %e, "Handshake reply failed");
                        return LoopAction::Stop;
                    }
                    debug!(connection_id = %connection.id(), "WebSocket handshake complete");
                    // Loop again: the peer may have pipelined its first
                    // frame right behind the handshake bytes.
                }

                Ok(HandshakeOutcome::Command { body, consumed }) => {
                    buffer.drain(..consumed);
                    match bridge::handle_command_request(server, connection, &body).await {
                        CommandOutcome::Parked => {}
                        CommandOutcome::Closed => return LoopAction::Stop,
                    }
                }

                Err(e) => {
                    debug!(connection_id = %connection.id(), error = %e, "Unclassifiable request");
                    let _ = connection
                        .write_all(&error_response(HttpStatus::BadRequest, &e.to_string()))
                        .await;
                    return LoopAction::Stop;
                }
            },

            ConnectionState::WebSocketOpen => match decode_frame(buffer) {
                Ok(DecodeOutcome::NeedMoreData) => return LoopAction::Continue,

                Ok(DecodeOutcome::Frame { frame, consumed }) => {
                    buffer.drain(..consumed);
                    if handle_frame(server, connection, frame).await == LoopAction::Stop {
                        return LoopAction::Stop;
                    }
                }

                Err(e) => {
                    warn!(connection_id = %connection.id(), error = %e, "Unrecoverable frame error");
                    return LoopAction::Stop;
                }
            },

            // Parked connections only wait for the correlated reply; any
            // further input from the caller is discarded.
            ConnectionState::HttpParked => {
                buffer.clear();
                return LoopAction::Continue;
            }

            ConnectionState::Closed => return LoopAction::Stop,
        }
    }
}

/// Dispatches one decoded frame.
async fn handle_frame(
    server: &Arc<GatewayServer>,
    connection: &Arc<Connection>,
    frame: Frame,
) -> LoopAction {
    // No reassembly: fragments are dropped rather than silently treated as
    // whole messages.
    if !frame.fin || frame.opcode == Opcode::Continuation {
        warn!(connection_id = %connection.id(), "Dropping fragmented frame (no reassembly)");
        return LoopAction::Continue;
    }

    match frame.opcode {
        Opcode::Text => {
            let text = match String::from_utf8(frame.payload) {
                Ok(text) => text,
                Err(_) => {
                    // A single encoding glitch should not sever a working
                    // browser session.
                    warn!(connection_id = %connection.id(), "Dropping text frame with invalid UTF-8");
                    return LoopAction::Continue;
                }
            };

            match serde_json::from_str::<Value>(&text) {
                Ok(message) => {
                    bridge::handle_peer_message(server, connection, message).await;
                    LoopAction::Continue
                }
                Err(e) => {
                    debug!(connection_id = %connection.id(), error = %e, "Malformed JSON from peer");
                    let reply = serde_json::json!({
                        "type": "error",
                        "error": format!("malformed JSON: {e}"),
                    });
                    match connection.send_text(&reply).await {
                        Ok(()) => LoopAction::Continue,
                        Err(_) => LoopAction::Stop,
                    }
                }
            }
        }

        Opcode::Ping => {
            trace!(connection_id = %connection.id(), "Ping");
            match connection.send_frame(Opcode::Pong, &frame.payload).await {
                Ok(()) => LoopAction::Continue,
                Err(_) => LoopAction::Stop,
            }
        }

        Opcode::Pong => {
            trace!(connection_id = %connection.id(), "Pong");
            LoopAction::Continue
        }

        Opcode::Close => {
            debug!(connection_id = %connection.id(), "Close frame received");
            let _ = connection.send_frame(Opcode::Close, &frame.payload).await;
            LoopAction::Stop
        }

        other => {
            debug!(connection_id = %connection.id(), opcode = ?other, "Unsupported opcode dropped");
            LoopAction::Continue
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
