//! Per-connection state shared between the session task, rooms, and handles.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use roomcast_core::ConnectionId;
use roomcast_core::frame;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::WS_SEND_DROPS_TOTAL;

/// A live WebSocket peer.
///
/// Outbound text goes through a bounded queue drained by the connection's
/// writer task. Sending never blocks: a full or closed queue drops the frame.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Ids of the rooms this connection is a member of.
    rooms: Mutex<HashSet<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// Set once teardown starts. A closed connection never joins a room again.
    closed: AtomicBool,
    /// Count of messages dropped because the queue was full or closed.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            rooms: Mutex::new(HashSet::new()),
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue pre-encoded text for the client.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            counter!(WS_SEND_DROPS_TOTAL).increment(1);
            debug!(client_id = %self.id, "outbound queue full or closed, frame dropped");
            false
        }
    }

    /// Send one `[event, ...args]` frame.
    pub fn send_frame(&self, event: &str, args: &[Value]) -> bool {
        self.send(Arc::new(frame::encode(event, args)))
    }

    /// Serialize a raw JSON value and send it without the frame envelope.
    pub fn send_json(&self, value: &Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the session has started tearing this connection down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the connection closed. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Record membership of `room_id`. Returns `false` if already recorded.
    pub fn add_room(&self, room_id: &str) -> bool {
        self.rooms.lock().insert(room_id.to_owned())
    }

    /// Forget membership of `room_id`. Returns `false` if it was not recorded.
    pub fn remove_room(&self, room_id: &str) -> bool {
        self.rooms.lock().remove(room_id)
    }

    /// Whether membership of `room_id` is recorded.
    pub fn in_room(&self, room_id: &str) -> bool {
        self.rooms.lock().contains(room_id)
    }

    /// Snapshot of recorded room ids, sorted.
    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.lock().iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Mark the connection as alive (pong or other inbound traffic).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("rooms", &self.room_ids())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A connection whose outbound queue is readable by the test.
    pub(crate) fn connection(id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        connection_with_capacity(id, 32)
    }

    pub(crate) fn connection_with_capacity(
        id: &str,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(ClientConnection::new(id.into(), tx)), rx)
    }

    /// Every frame currently queued, parsed as JSON.
    pub(crate) fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }
}
