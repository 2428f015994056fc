//! Owner of every room on one server.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::gauge;
use parking_lot::RwLock;
use tracing::debug;

use super::room::Room;
use crate::connection::ClientConnection;
use crate::metrics::ROOMS_ACTIVE;

/// Rooms keyed by id.
///
/// A room created through [`join`](Self::join) disappears again once its last
/// member leaves, unless it was created with `keep_alive`. Lookup plus
/// membership change runs under the registry write lock, so a join cannot
/// land in a room that a concurrent leave is deleting.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the room `id`, creating it if absent.
    ///
    /// An existing room is returned unchanged, including its `keep_alive`.
    pub fn create(&self, id: &str, keep_alive: bool) -> Arc<Room> {
        let mut rooms = self.rooms.write();
        Arc::clone(entry(&mut rooms, id, keep_alive))
    }

    /// Look up a room.
    pub fn get_room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(id).cloned()
    }

    /// Put `conn` in room `id`, creating the room if needed.
    ///
    /// Records the membership on the connection too. Returns `false` if it
    /// was already a member or the connection is closed.
    pub fn join(&self, id: &str, conn: &Arc<ClientConnection>) -> bool {
        let mut rooms = self.rooms.write();
        if conn.is_closed() {
            debug!(room_id = id, client_id = %conn.id, "join from closed connection ignored");
            return false;
        }
        let room = entry(&mut rooms, id, false);
        let joined = room.join(conn);
        let _ = conn.add_room(id);
        joined
    }

    /// Take `conn` out of room `id`, deleting the room if it is now empty and
    /// not `keep_alive`.
    ///
    /// The connection's own room set is left to the caller. Returns `false`
    /// if the room does not exist or `conn` was not in it.
    pub fn leave(&self, id: &str, conn: &ClientConnection) -> bool {
        let mut rooms = self.rooms.write();
        leave_locked(&mut rooms, id, conn)
    }

    /// Like [`leave`](Self::leave), but also forgets `id` on the connection,
    /// under the same lock so a concurrent join cannot interleave.
    pub fn remove_member(&self, id: &str, conn: &ClientConnection) -> bool {
        let mut rooms = self.rooms.write();
        let _ = conn.remove_room(id);
        leave_locked(&mut rooms, id, conn)
    }

    /// Take `conn` out of every room it is in. Returns how many it left.
    pub fn leave_all(&self, conn: &ClientConnection) -> usize {
        let mut rooms = self.rooms.write();
        leave_all_locked(&mut rooms, conn)
    }

    /// Mark `conn` closed and take it out of every room.
    ///
    /// Runs under the registry lock, so no join can land after it.
    pub fn close_connection(&self, conn: &ClientConnection) -> usize {
        let mut rooms = self.rooms.write();
        let _ = conn.mark_closed();
        leave_all_locked(&mut rooms, conn)
    }

    /// Snapshot of all rooms.
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().values().cloned().collect()
    }

    /// Ids of all rooms, sorted.
    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of rooms.
    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    /// Whether there are no rooms.
    pub fn is_empty(&self) -> bool {
        self.rooms.read().is_empty()
    }
}

fn leave_locked(rooms: &mut HashMap<String, Arc<Room>>, id: &str, conn: &ClientConnection) -> bool {
    let Some(room) = rooms.get(id) else {
        return false;
    };
    let left = room.leave(conn);
    if room.is_empty() && !room.keep_alive() {
        let _ = rooms.remove(id);
        gauge!(ROOMS_ACTIVE).decrement(1.0);
        debug!(room_id = id, "room deleted");
    }
    left
}

fn leave_all_locked(rooms: &mut HashMap<String, Arc<Room>>, conn: &ClientConnection) -> usize {
    let mut left = 0;
    for id in conn.room_ids() {
        let _ = conn.remove_room(&id);
        if leave_locked(rooms, &id, conn) {
            left += 1;
        }
    }
    left
}

fn entry<'a>(rooms: &'a mut HashMap<String, Arc<Room>>, id: &str, keep_alive: bool) -> &'a Arc<Room> {
    rooms.entry(id.to_owned()).or_insert_with(|| {
        gauge!(ROOMS_ACTIVE).increment(1.0);
        debug!(room_id = id, keep_alive, "room created");
        Arc::new(Room::new(id, keep_alive))
    })
}
