//! Shared connection registry.
//!
//! One mutex-guarded map is the only state shared across connection tasks.
//! Lookups and mutations take the lock briefly; anything that performs I/O
//! over the result first takes a snapshot so the lock is never held across
//! an await.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::identifiers::ConnectionId;
use crate::transport::Connection;

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Concurrency-safe map from connection id to live connection.
///
/// Used both to find "a" connected browser peer for bridging and to find
/// the specific parked HTTP connection a correlated reply belongs to.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a connection under its id.
    pub fn insert(&self, connection: Arc<Connection>) {
        let id = connection.id();
        trace!(connection_id = %id, "Connection registered");
        self.connections.lock().insert(id, connection);
    }

    /// Removes and returns the connection stored under `id`.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.lock().remove(id);
        if removed.is_some() {
            trace!(connection_id = %id, "Connection deregistered");
        }
        removed
    }

    /// Looks up a connection by id.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    /// Moves a connection from `old` to `new` in one lock scope.
    ///
    /// Used when an HTTP bridge request re-keys its connection under the
    /// generated correlation id. Returns `false` if `old` was absent.
    pub fn rekey(&self, old: &ConnectionId, new: ConnectionId) -> bool {
        let mut connections = self.connections.lock();
        match connections.remove(old) {
            Some(connection) => {
                trace!(from = %old, to = %new, "Connection re-keyed");
                connections.insert(new, connection);
                true
            }
            None => false,
        }
    }

    /// Finds any open WebSocket peer other than `exclude`.
    #[must_use]
    pub fn find_browser_peer(&self, exclude: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .find(|(id, connection)| *id != exclude && connection.is_websocket_open())
            .map(|(_, connection)| Arc::clone(connection))
    }

    /// Returns a stable snapshot of every connection.
    ///
    /// Callers iterate the snapshot, not the map, so socket writes never
    /// happen under the registry lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Removes and returns every connection.
    #[must_use]
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns `true` if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::{TcpListener, TcpStream};

    /// Builds a connection over a real loopback socket pair.
    async fn test_connection() -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (_server_stream, _) = listener.accept().await.expect("accept");

        let (_read_half, write_half) = client.into_split();
        Connection::new(write_half)
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = ConnectionRegistry::new();
        let connection = test_connection().await;
        let id = connection.id();

        registry.insert(Arc::clone(&connection));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(&id).is_none());
    }

    #[tokio::test]
    async fn test_rekey() {
        let registry = ConnectionRegistry::new();
        let connection = test_connection().await;
        let old_id = connection.id();
        let new_id = ConnectionId::from("http-test");

        registry.insert(Arc::clone(&connection));
        assert!(registry.rekey(&old_id, new_id.clone()));
        assert!(registry.get(&old_id).is_none());
        assert!(registry.get(&new_id).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_rekey_missing_returns_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.rekey(&ConnectionId::from("browser-0"), ConnectionId::from("http-x")));
    }

    #[tokio::test]
    async fn test_find_browser_peer_skips_unpromoted() {
        let registry = ConnectionRegistry::new();
        let connection = test_connection().await;
        let id = connection.id();
        registry.insert(Arc::clone(&connection));

        // Still awaiting handshake: not a peer yet.
        assert!(registry.find_browser_peer(&ConnectionId::from("other")).is_none());

        connection.mark_websocket_open();
        assert!(registry.find_browser_peer(&ConnectionId::from("other")).is_some());

        // The caller itself is never chosen as its own peer.
        assert!(registry.find_browser_peer(&id).is_none());
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = ConnectionRegistry::new();
        registry.insert(test_connection().await);
        registry.insert(test_connection().await);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
