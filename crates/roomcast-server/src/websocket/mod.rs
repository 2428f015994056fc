//! WebSocket sessions: socket lifecycle, heartbeat, and inbound dispatch.

pub mod dispatch;
pub mod heartbeat;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use roomcast_core::EventBus;
use roomcast_settings::ServerSettings;
use tokio_util::sync::CancellationToken;

use crate::middleware::MiddlewareChain;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomRegistry;

pub use dispatch::{DispatchOutcome, ON_CONNECT_EVENT, ServerEvent, dispatch_text};

/// Per-session tunables derived from [`ServerSettings`].
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Outbound queue length per connection. Also bounds the inbound
    /// dispatch queue.
    pub send_queue_capacity: usize,
    /// Time between pings and liveness checks.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the connection is closed.
    pub heartbeat_timeout: Duration,
    /// Emit on a halted chain.
    pub dispatch_on_halt: bool,
}

impl From<&ServerSettings> for SessionOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            send_queue_capacity: settings.send_queue_capacity,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs),
            dispatch_on_halt: settings.dispatch_on_halt,
        }
    }
}

/// Everything a session needs from the server that accepted it.
#[derive(Clone)]
pub struct SessionContext {
    /// Application listeners.
    pub events: Arc<EventBus<ServerEvent>>,
    /// Middleware run before each dispatch.
    pub middleware: Arc<MiddlewareChain>,
    /// Live connections.
    pub connections: Arc<ConnectionRegistry>,
    /// Rooms.
    pub rooms: Arc<RoomRegistry>,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
    /// Tunables.
    pub options: SessionOptions,
}
