//! The per-connection API handed to listeners and middleware.

use std::sync::Arc;

use roomcast_core::ConnectionId;
use serde_json::Value;

use crate::connection::ClientConnection;
use crate::registry::ConnectionRegistry;
use crate::rooms::{Room, RoomRegistry};

/// Capability object for one connection.
///
/// Cheap to clone. Room operations go through the owning server's
/// [`RoomRegistry`], so membership stays consistent on both the room and the
/// connection side.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<ClientConnection>,
    room_registry: Arc<RoomRegistry>,
    connection_registry: Arc<ConnectionRegistry>,
}

impl ConnectionHandle {
    /// Bind a connection to the registries of the server that accepted it.
    pub fn new(
        connection: Arc<ClientConnection>,
        room_registry: Arc<RoomRegistry>,
        connection_registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            connection,
            room_registry,
            connection_registry,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.connection.id
    }

    /// Underlying connection state.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Ids of the rooms this connection is in.
    pub fn rooms(&self) -> Vec<String> {
        self.connection.room_ids()
    }

    /// Join room `room`, creating it if needed.
    pub fn join(&self, room: &str) -> bool {
        self.room_registry.join(room, &self.connection)
    }

    /// Leave room `room`.
    pub fn leave(&self, room: &str) -> bool {
        self.room_registry.remove_member(room, &self.connection)
    }

    /// Leave every room this connection is in.
    pub fn leave_all(&self) {
        let _ = self.room_registry.leave_all(&self.connection);
    }

    /// Look up a room on the same server.
    pub fn room(&self, id: &str) -> Option<Arc<Room>> {
        self.room_registry.get_room(id)
    }

    /// Send one `[event, ...args]` frame to this connection.
    pub fn invoke(&self, event: &str, args: &[Value]) -> bool {
        self.connection.send_frame(event, args)
    }

    /// Handle for another live connection on the same server.
    pub fn to(&self, id: &str) -> Option<ConnectionHandle> {
        self.connection_registry.get(id).map(|connection| Self {
            connection,
            room_registry: Arc::clone(&self.room_registry),
            connection_registry: Arc::clone(&self.connection_registry),
        })
    }

    /// Send `[event, ...args]` to every live connection on the server.
    pub fn broadcast(&self, event: &str, args: &[Value]) -> usize {
        self.connection_registry.broadcast(event, args)
    }

    /// Send a raw JSON value, without the frame envelope.
    pub fn send_json(&self, value: &Value) -> bool {
        self.connection.send_json(value)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", self.id())
            .finish_non_exhaustive()
    }
}
