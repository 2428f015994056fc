//! A named group of connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use roomcast_core::ConnectionId;
use roomcast_core::frame;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::connection::ClientConnection;

/// Event sent to existing members when someone joins.
pub const JOIN_EVENT: &str = "join";
/// Event sent to remaining members when someone leaves.
pub const LEAVE_EVENT: &str = "leave";

/// A room and its current members.
///
/// Membership changes notify the other members. A room never removes itself
/// from the [`RoomRegistry`](super::RoomRegistry); the registry decides when
/// an empty room goes away.
pub struct Room {
    id: String,
    keep_alive: bool,
    members: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl Room {
    /// Create an empty room.
    pub fn new(id: impl Into<String>, keep_alive: bool) -> Self {
        Self {
            id: id.into(),
            keep_alive,
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Room id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the room survives becoming empty.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Add `conn` to the room.
    ///
    /// Existing members receive `["join", {roomId, userId}]` before the new
    /// member is inserted. Returns `false` if `conn` was already a member.
    pub fn join(&self, conn: &Arc<ClientConnection>) -> bool {
        let mut members = self.members.write();
        if members.contains_key(&conn.id) {
            return false;
        }
        let notice = self.membership_frame(JOIN_EVENT, &conn.id);
        let notified = notify(members.values(), &notice);
        let _ = members.insert(conn.id.clone(), Arc::clone(conn));
        debug!(room_id = %self.id, client_id = %conn.id, notified, "joined room");
        true
    }

    /// Remove `conn` from the room.
    ///
    /// On removal the remaining members receive `["leave", {roomId, userId}]`.
    /// Returns `false` if `conn` was not a member.
    pub fn leave(&self, conn: &ClientConnection) -> bool {
        let mut members = self.members.write();
        if members.remove(&conn.id).is_none() {
            return false;
        }
        let notice = self.membership_frame(LEAVE_EVENT, &conn.id);
        let notified = notify(members.values(), &notice);
        debug!(room_id = %self.id, client_id = %conn.id, notified, "left room");
        true
    }

    /// Send `[event, ...args]` to every member.
    ///
    /// Returns how many members accepted the frame.
    pub fn broadcast(&self, event: &str, args: &[Value]) -> usize {
        let text = Arc::new(frame::encode(event, args));
        let members = self.members.read();
        debug!(room_id = %self.id, event, recipients = members.len(), "broadcast to room");
        notify(members.values(), &text)
    }

    /// Snapshot of current members.
    pub fn members(&self) -> Vec<Arc<ClientConnection>> {
        self.members.read().values().cloned().collect()
    }

    /// Ids of current members.
    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.members.read().keys().cloned().collect()
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: &str) -> bool {
        self.members.read().contains_key(id)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Whether the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    fn membership_frame(&self, event: &str, user: &ConnectionId) -> Arc<String> {
        let body = json!({ "roomId": self.id, "userId": user.as_str() });
        Arc::new(frame::encode(event, &[body]))
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("keep_alive", &self.keep_alive)
            .field("members", &self.len())
            .finish()
    }
}

fn notify<'a>(
    recipients: impl Iterator<Item = &'a Arc<ClientConnection>>,
    text: &Arc<String>,
) -> usize {
    let mut delivered = 0;
    for conn in recipients {
        if conn.send(Arc::clone(text)) {
            delivered += 1;
        } else {
            warn!(conn_id = %conn.id, "failed to send room frame to client");
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::connection::test_support::{connection, connection_with_capacity, drain};

    #[test]
    fn join_notifies_existing_members_only() {
        let room = Room::new("lobby", false);
        let (a, mut rx_a) = connection("a");
        let (b, mut rx_b) = connection("b");

        assert!(room.join(&a));
        assert!(drain(&mut rx_a).is_empty());

        assert!(room.join(&b));
        assert_eq!(
            drain(&mut rx_a),
            vec![json!(["join", {"roomId": "lobby", "userId": "b"}])]
        );
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(room.len(), 2);
    }

    #[test]
    fn double_join_is_noop() {
        let room = Room::new("lobby", false);
        let (a, _rx_a) = connection("a");
        let (b, mut rx_b) = connection("b");
        assert!(room.join(&b));
        assert!(room.join(&a));
        let _ = drain(&mut rx_b);

        assert!(!room.join(&a));
        assert_eq!(room.len(), 2);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn leave_notifies_remaining_members() {
        let room = Room::new("lobby", false);
        let (a, mut rx_a) = connection("a");
        let (b, mut rx_b) = connection("b");
        let _ = room.join(&a);
        let _ = room.join(&b);
        let _ = drain(&mut rx_a);

        assert!(room.leave(&b));
        assert_eq!(
            drain(&mut rx_a),
            vec![json!(["leave", {"roomId": "lobby", "userId": "b"}])]
        );
        assert!(drain(&mut rx_b).is_empty());
        assert!(!room.contains("b"));
    }

    #[test]
    fn leave_of_non_member_sends_nothing() {
        let room = Room::new("lobby", false);
        let (a, mut rx_a) = connection("a");
        let (stranger, _rx) = connection("s");
        let _ = room.join(&a);

        assert!(!room.leave(&stranger));
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn broadcast_reaches_members() {
        let room = Room::new("lobby", false);
        let (a, mut rx_a) = connection("a");
        let (b, mut rx_b) = connection("b");
        let _ = room.join(&a);
        let _ = room.join(&b);
        let _ = drain(&mut rx_a);

        assert_eq!(room.broadcast("chat", &[json!("hi"), json!({"n": 1})]), 2);
        assert_eq!(drain(&mut rx_a), vec![json!(["chat", "hi", {"n": 1}])]);
        assert_eq!(drain(&mut rx_b), vec![json!(["chat", "hi", {"n": 1}])]);
    }

    #[test]
    fn broadcast_skips_full_queue_and_continues() {
        let room = Room::new("lobby", false);
        let (stuck, _rx_stuck) = connection_with_capacity("stuck", 1);
        let (ok, mut rx_ok) = connection("ok");
        let _ = room.join(&stuck);
        let _ = room.join(&ok);
        // `stuck` now holds the join notice for `ok` and is full.
        assert_eq!(room.broadcast("chat", &[]), 1);
        assert_eq!(stuck.drop_count(), 1);
        assert_eq!(drain(&mut rx_ok), vec![json!(["chat"])]);
    }

    #[test]
    fn broadcast_to_empty_room() {
        let room = Room::new("empty", true);
        assert_eq!(room.broadcast("chat", &[]), 0);
        assert!(room.is_empty());
        assert!(room.keep_alive());
    }

    #[test]
    fn member_ids_match_members() {
        let room = Room::new("lobby", false);
        let (a, _rx_a) = connection("a");
        let _ = room.join(&a);
        assert_eq!(room.member_ids(), vec![ConnectionId::from("a")]);
        assert_eq!(room.members().len(), 1);
        assert_eq!(room.id(), "lobby");
    }
}
