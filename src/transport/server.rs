//! Gateway listener and accept loop.
//!
//! One `GatewayServer` owns the listening socket, the connection registry,
//! and the delegate. Each accepted socket becomes a [`Connection`] with its
//! own spawned read task; the registry is the only state shared between
//! them.
//!
//! # Lifecycle
//!
//! 1. [`GatewayServer::start`]: bind with address reuse, spawn the accept
//!    loop, notify `on_server_started`
//! 2. Accept → register connection → spawn read task
//! 3. [`GatewayServer::stop`]: flag shutdown, close every connection
//!    (WebSocket peers get a Close frame first), notify `on_server_stopped`

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::delegate::GatewayDelegate;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::options::GatewayOptions;
use crate::protocol::frame::Opcode;
use crate::transport::connection::{self, Connection};
use crate::transport::registry::ConnectionRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Listen backlog.
const LISTEN_BACKLOG: u32 = 128;

/// Accept poll interval while checking the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// GatewayServer
// ============================================================================

/// The gateway: listening socket, registry, and delegate wiring.
///
/// # Example
///
/// ```ignore
/// let server = GatewayServer::start(GatewayOptions::new(), delegate).await?;
/// println!("listening on port {}", server.port());
///
/// // Dispatcher-initiated sends:
/// server.broadcast(&message).await;
///
/// server.stop().await;
/// ```
pub struct GatewayServer {
    /// Bound port (resolved when the options asked for port 0).
    port: u16,

    /// Gateway configuration.
    options: GatewayOptions,

    /// All live connections.
    registry: ConnectionRegistry,

    /// Event sink for the external tool dispatcher.
    delegate: Arc<dyn GatewayDelegate>,

    /// Accept-loop shutdown flag.
    shutdown: AtomicBool,

    /// Accept-loop task; cancelled on stop so the listener closes promptly.
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// GatewayServer - Constructor
// ============================================================================

impl GatewayServer {
    /// Binds the listening socket and starts accepting connections.
    ///
    /// Address reuse is enabled explicitly so a restart right after a crash
    /// does not fail to bind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn start(
        options: GatewayOptions,
        delegate: Arc<dyn GatewayDelegate>,
    ) -> Result<Arc<Self>> {
        let addr = SocketAddr::new(options.bind_ip, options.port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let port = listener.local_addr()?.port();

        debug!(port, "Gateway socket bound");

        let server = Arc::new(Self {
            port,
            options,
            registry: ConnectionRegistry::new(),
            delegate,
            shutdown: AtomicBool::new(false),
            accept_task: Mutex::new(None),
        });

        let accept = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            accept.accept_loop(listener).await;
        });
        *server.accept_task.lock() = Some(handle);

        server.delegate.on_server_started(port).await;
        info!(port, "Gateway started");

        Ok(server)
    }
}

// ============================================================================
// GatewayServer - Accessors
// ============================================================================

impl GatewayServer {
    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of live connections in any state.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of established WebSocket peers.
    #[must_use]
    pub fn browser_peer_count(&self) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|connection| connection.is_websocket_open())
            .count()
    }

    /// The connection registry.
    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The event sink.
    pub(crate) fn delegate(&self) -> &Arc<dyn GatewayDelegate> {
        &self.delegate
    }

    /// Grace period between answering a parked caller and closing it.
    pub(crate) fn reply_linger(&self) -> Duration {
        self.options.reply_linger
    }
}

// ============================================================================
// GatewayServer - Dispatcher Sends
// ============================================================================

impl GatewayServer {
    /// Sends a JSON message to one connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] for unknown ids, or the write
    /// failure from the socket.
    pub async fn send_to(&self, connection_id: &ConnectionId, message: &Value) -> Result<()> {
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| Error::connection_not_found(connection_id.clone()))?;
        connection.send_text(message).await
    }

    /// Sends a JSON message to every open WebSocket peer.
    ///
    /// Write failures are logged per peer and do not interrupt the rest of
    /// the broadcast.
    pub async fn broadcast(&self, message: &Value) {
        for connection in self.registry.snapshot() {
            if connection.is_websocket_open()
                && let Err(e) = connection.send_text(message).await
            {
                warn!(connection_id = %connection.id(), error = %e, "Broadcast write failed");
            }
        }
    }
}

// ============================================================================
// GatewayServer - Lifecycle
// ============================================================================

impl GatewayServer {
    /// Stops accepting, closes every connection, and notifies the delegate.
    pub async fn stop(&self) {
        info!("Gateway stopping");
        self.shutdown.store(true, Ordering::SeqCst);

        // Cancel the accept loop and wait it out so the listening socket is
        // released before this returns.
        let accept_task = self.accept_task.lock().take();
        if let Some(handle) = accept_task {
            handle.abort();
            let _ = handle.await;
        }

        for connection in self.registry.drain() {
            if connection.is_websocket_open() {
                let _ = connection.send_frame(Opcode::Close, &[]).await;
            }
            self.close_connection(&connection).await;
        }

        self.delegate.on_server_stopped().await;
        info!("Gateway stopped");
    }

    /// Closes one connection; safe to call from any task, any number of
    /// times.
    ///
    /// Cancels the read task, shuts the socket down, removes the registry
    /// entry, and notifies the delegate when an established browser peer
    /// goes away.
    pub(crate) async fn close_connection(&self, connection: &Arc<Connection>) {
        if !connection.begin_close() {
            return;
        }

        connection.mark_closed();
        let id = connection.id();

        let _ = connection.shutdown_write().await;
        self.registry.remove(&id);

        if connection.was_websocket_open() && !id.is_http_bridge() {
            debug!(connection_id = %id, "Browser peer disconnected");
            self.delegate.on_browser_disconnected(&id).await;
        }

        // Last: dropping the read half is what fully releases the socket,
        // and this may be aborting the calling task itself.
        connection.abort_read_task();
        debug!(connection_id = %id, "Connection closed");
    }
}

// ============================================================================
// GatewayServer - Accept Loop
// ============================================================================

impl GatewayServer {
    /// Background task that accepts new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            // Accept with timeout to allow checking the shutdown flag.
            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, addr))) => self.handle_accept(stream, addr),
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Registers a freshly accepted socket and spawns its read task.
    fn handle_accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let connection = Connection::new(write_half);

        debug!(connection_id = %connection.id(), ?addr, "Connection accepted");

        // Registered before the first read so even an immediate socket
        // failure has an entry to clean up.
        self.registry.insert(Arc::clone(&connection));

        let handle = tokio::spawn(connection::run_read_loop(
            Arc::clone(self),
            Arc::clone(&connection),
            read_half,
        ));
        connection.attach_read_task(handle.abort_handle());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use crate::delegate::NoopDelegate;
    use crate::protocol::frame::{DecodeOutcome, Frame, decode_frame};

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Delegate that records every callback on a channel.
    struct RecordingDelegate {
        events: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl GatewayDelegate for RecordingDelegate {
        async fn on_server_started(&self, port: u16) {
            let _ = self.events.send(format!("started:{port}"));
        }

        async fn on_server_stopped(&self) {
            let _ = self.events.send("stopped".to_string());
        }

        async fn on_browser_connected(
            &self,
            _connection_id: &ConnectionId,
            browser_name: Option<&str>,
        ) {
            let _ = self
                .events
                .send(format!("connected:{}", browser_name.unwrap_or("unknown")));
        }

        async fn on_browser_disconnected(&self, _connection_id: &ConnectionId) {
            let _ = self.events.send("disconnected".to_string());
        }

        async fn on_tool_request(&self, message: Value, _connection_id: &ConnectionId) {
            let _ = self.events.send(format!("tool:{message}"));
        }
    }

    fn recording_delegate() -> (Arc<RecordingDelegate>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingDelegate { events: tx }), rx)
    }

    async fn start_server(delegate: Arc<dyn GatewayDelegate>) -> Arc<GatewayServer> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let options = GatewayOptions::new()
            .with_port(0)
            .with_reply_linger(Duration::from_millis(100));
        GatewayServer::start(options, delegate).await.expect("start")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    /// Opens a WebSocket connection the way the extension does.
    async fn ws_connect(port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        stream
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .expect("write upgrade");

        let mut head = Vec::new();
        let mut chunk = [0u8; 256];
        while !head.windows(4).any(|window| window == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.expect("read 101");
            assert!(n > 0, "eof during handshake");
            head.extend_from_slice(&chunk[..n]);
        }

        let head = String::from_utf8(head).expect("utf-8");
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        stream
    }

    /// Reads one server frame off the stream.
    async fn read_server_frame(stream: &mut TcpStream) -> Frame {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let DecodeOutcome::Frame { frame, .. } = decode_frame(&buf).expect("decode") {
                return frame;
            }
            let n = stream.read(&mut chunk).await.expect("read frame");
            assert!(n > 0, "eof waiting for frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Builds a client frame (masked, as clients must send).
    fn masked_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let key = [0x5A, 0x13, 0xC4, 0x7E];
        let len = payload.len();
        let mut buf = Vec::with_capacity(14 + len);
        buf.push(0x80 | opcode.bits());

        if len < 126 {
            buf.push(0x80 | len as u8);
        } else {
            buf.push(0x80 | 126);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }

        buf.extend_from_slice(&key);
        buf.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        buf
    }

    async fn send_masked_text(stream: &mut TcpStream, value: &Value) {
        let payload = serde_json::to_vec(value).expect("json");
        stream
            .write_all(&masked_frame(Opcode::Text, &payload))
            .await
            .expect("write frame");
    }

    /// Issues a `POST /command` and reads the full response.
    async fn http_post(port: u16, body: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let request = format!(
            "POST /command HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body,
        );
        stream.write_all(request.as_bytes()).await.expect("write");

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.expect("read");
        String::from_utf8(response).expect("utf-8")
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_start_and_stop() {
        let (delegate, mut events) = recording_delegate();
        let server = start_server(delegate).await;

        assert!(server.port() > 0);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(next_event(&mut events).await, format!("started:{}", server.port()));

        server.stop().await;
        assert_eq!(next_event(&mut events).await, "stopped");
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_rebind_same_port_after_stop() {
        let server = start_server(Arc::new(NoopDelegate)).await;
        let port = server.port();
        server.stop().await;

        // Address reuse lets a restart grab the same port immediately.
        let options = GatewayOptions::new().with_port(port);
        let restarted = GatewayServer::start(options, Arc::new(NoopDelegate))
            .await
            .expect("rebind");
        assert_eq!(restarted.port(), port);
        restarted.stop().await;
    }

    // ========================================================================
    // HTTP Bridge
    // ========================================================================

    #[tokio::test]
    async fn test_command_without_peer_returns_503() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let response = http_post(server.port(), r#"{"name":"browser_getTabs","params":{}}"#).await;
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable"));
        assert!(response.contains(r#"{"error":"no browser peer connected"}"#));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_command_without_action_returns_400() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let response = http_post(server.port(), r#"{"params":{}}"#).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_json_body_returns_400() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let response = http_post(server.port(), "{not json").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_request_returns_400() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let mut stream = TcpStream::connect(("127.0.0.1", server.port()))
            .await
            .expect("connect");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("write");

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.expect("read");
        assert!(String::from_utf8(response)
            .expect("utf-8")
            .starts_with("HTTP/1.1 400 Bad Request"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_correlated_round_trip() {
        let server = start_server(Arc::new(NoopDelegate)).await;
        let port = server.port();

        let mut peer = ws_connect(port).await;
        assert_eq!(server.browser_peer_count(), 1);

        // The caller blocks until the peer answers; run it concurrently.
        let caller =
            tokio::spawn(
                async move { http_post(port, r#"{"name":"browser_getTabs","params":{}}"#).await },
            );

        // The peer receives the normalized outbound command.
        let frame = read_server_frame(&mut peer).await;
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(!frame.masked);
        let command: Value = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(command["action"], "getTabs");
        assert_eq!(command["payload"], json!({}));
        let correlation_id = command["id"].as_str().expect("id").to_string();

        // Reply with the echoed id; the parked caller gets the flattened body.
        send_masked_text(
            &mut peer,
            &json!({"id": correlation_id, "response": {"tabs": []}}),
        )
        .await;

        let response = timeout(RECV_TIMEOUT, caller)
            .await
            .expect("caller timeout")
            .expect("caller task");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with(r#"{"tabs":[]}"#));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_error_reply_reaches_caller() {
        let server = start_server(Arc::new(NoopDelegate)).await;
        let port = server.port();

        let mut peer = ws_connect(port).await;
        let caller = tokio::spawn(async move {
            http_post(port, r##"{"action":"clickElement","params":{"selector":"#go"}}"##).await
        });

        let frame = read_server_frame(&mut peer).await;
        let command: Value = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(command["action"], "clickElement");
        let correlation_id = command["id"].as_str().expect("id").to_string();

        send_masked_text(
            &mut peer,
            &json!({"id": correlation_id, "error": "no such element"}),
        )
        .await;

        let response = timeout(RECV_TIMEOUT, caller)
            .await
            .expect("caller timeout")
            .expect("caller task");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with(r#"{"error":"no such element"}"#));

        server.stop().await;
    }

    // ========================================================================
    // Peer Messages
    // ========================================================================

    #[tokio::test]
    async fn test_identify_fires_browser_connected() {
        let (delegate, mut events) = recording_delegate();
        let server = start_server(delegate).await;
        assert_eq!(next_event(&mut events).await, format!("started:{}", server.port()));

        let mut peer = ws_connect(server.port()).await;
        send_masked_text(&mut peer, &json!({"action": "identify", "browserName": "firefox"})).await;

        assert_eq!(next_event(&mut events).await, "connected:firefox");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unsolicited_event_passes_through() {
        let (delegate, mut events) = recording_delegate();
        let server = start_server(delegate).await;
        assert_eq!(next_event(&mut events).await, format!("started:{}", server.port()));

        let mut peer = ws_connect(server.port()).await;
        let event = json!({"event": "domChanged", "tabId": 3});
        send_masked_text(&mut peer, &event).await;

        assert_eq!(next_event(&mut events).await, format!("tool:{event}"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_passes_through() {
        let (delegate, mut events) = recording_delegate();
        let server = start_server(delegate).await;
        assert_eq!(next_event(&mut events).await, format!("started:{}", server.port()));

        let mut peer = ws_connect(server.port()).await;
        let stray = json!({"id": "00000000-0000-0000-0000-000000000000", "response": {}});
        send_masked_text(&mut peer, &stray).await;

        // No parked caller with that id: delivered as a tool request.
        assert_eq!(next_event(&mut events).await, format!("tool:{stray}"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_peer_disconnect_notification() {
        let (delegate, mut events) = recording_delegate();
        let server = start_server(delegate).await;
        assert_eq!(next_event(&mut events).await, format!("started:{}", server.port()));

        let peer = ws_connect(server.port()).await;
        drop(peer);

        assert_eq!(next_event(&mut events).await, "disconnected");
        assert_eq!(server.browser_peer_count(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let mut peer = ws_connect(server.port()).await;
        peer.write_all(&masked_frame(Opcode::Ping, b"keepalive"))
            .await
            .expect("write ping");

        let frame = read_server_frame(&mut peer).await;
        assert_eq!(frame.opcode, Opcode::Pong);
        assert_eq!(frame.payload, b"keepalive");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_peer_json_gets_error_without_close() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let mut peer = ws_connect(server.port()).await;
        peer.write_all(&masked_frame(Opcode::Text, b"{not json"))
            .await
            .expect("write");

        let frame = read_server_frame(&mut peer).await;
        let reply: Value = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(reply["type"], "error");

        // The session survives: a ping still gets its pong.
        peer.write_all(&masked_frame(Opcode::Ping, b"still here"))
            .await
            .expect("write ping");
        let frame = read_server_frame(&mut peer).await;
        assert_eq!(frame.opcode, Opcode::Pong);

        server.stop().await;
    }

    // ========================================================================
    // Dispatcher Sends
    // ========================================================================

    #[tokio::test]
    async fn test_broadcast_reaches_open_peers() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let mut peer = ws_connect(server.port()).await;
        let message = json!({"action": "refresh", "payload": {}});
        server.broadcast(&message).await;

        let frame = read_server_frame(&mut peer).await;
        let received: Value = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(received, message);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_errors() {
        let server = start_server(Arc::new(NoopDelegate)).await;

        let result = server
            .send_to(&ConnectionId::from("browser-999999"), &json!({}))
            .await;
        assert!(matches!(result, Err(Error::ConnectionNotFound { .. })));

        server.stop().await;
    }
}
