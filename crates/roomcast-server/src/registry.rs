//! Live connections keyed by id, and server-wide fan-out.

use std::sync::Arc;

use dashmap::DashMap;
use roomcast_core::ConnectionId;
use roomcast_core::frame;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::ClientConnection;

/// Every connection that completed the upgrade and has not closed yet.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the entry it replaced, if any.
    pub fn insert(&self, connection: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        self.connections.insert(connection.id.clone(), connection)
    }

    /// Unregister a connection by id.
    pub fn remove(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    /// Look up a connection by id.
    pub fn get(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all live connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all live connections.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Send `[event, ...args]` to every live connection.
    ///
    /// The frame is encoded once. Returns how many connections accepted it.
    pub fn broadcast(&self, event: &str, args: &[Value]) -> usize {
        let text = Arc::new(frame::encode(event, args));
        let recipients = self.connections();
        debug!(event, recipients = recipients.len(), "broadcast to all");

        let mut delivered = 0;
        for conn in &recipients {
            if conn.send(Arc::clone(&text)) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id, event, "failed to send broadcast to client");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::connection::test_support::{connection, connection_with_capacity, drain};

    #[test]
    fn insert_get_remove() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = connection("a");
        assert!(registry.insert(Arc::clone(&a)).is_none());
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &a));

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = connection("a");
        let (b, mut rx_b) = connection("b");
        let _ = registry.insert(a);
        let _ = registry.insert(b);

        assert_eq!(registry.broadcast("tick", &[json!(42)]), 2);
        assert_eq!(drain(&mut rx_a), vec![json!(["tick", 42])]);
        assert_eq!(drain(&mut rx_b), vec![json!(["tick", 42])]);
    }

    #[test]
    fn slow_peer_does_not_stop_broadcast() {
        let registry = ConnectionRegistry::new();
        let (slow, _rx_slow) = connection_with_capacity("slow", 1);
        let (fast, mut rx_fast) = connection("fast");
        assert!(slow.send(Arc::new("filler".into())));
        let _ = registry.insert(Arc::clone(&slow));
        let _ = registry.insert(fast);

        assert_eq!(registry.broadcast("tick", &[]), 1);
        assert_eq!(slow.drop_count(), 1);
        assert_eq!(drain(&mut rx_fast), vec![json!(["tick"])]);
    }

    #[test]
    fn broadcast_to_empty_registry() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.broadcast("tick", &[]), 0);
    }

    #[test]
    fn ids_lists_every_connection() {
        let registry = ConnectionRegistry::new();
        for id in ["x", "y", "z"] {
            let (conn, _rx) = connection(id);
            let _ = registry.insert(conn);
        }
        let mut ids: Vec<String> = registry.ids().into_iter().map(ConnectionId::into_inner).collect();
        ids.sort();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }
}
