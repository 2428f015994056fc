//! # roomcast-server
//!
//! Real-time messaging over WebSocket.
//!
//! - Every message is a JSON array `[eventName, ...args]`
//! - Inbound frames pass through a [`MiddlewareChain`] and are then emitted on
//!   the server's [`EventBus`](roomcast_core::EventBus) with the sending
//!   [`ConnectionHandle`]
//! - Connections can join [`Room`]s for targeted broadcast; the
//!   [`RoomRegistry`] creates rooms on first join and drops them when the
//!   last member leaves
//! - `/health` and `/metrics` (Prometheus) HTTP endpoints
//! - Heartbeat pings and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod handle;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use connection::ClientConnection;
pub use errors::{MiddlewareError, ServerError};
pub use handle::ConnectionHandle;
pub use middleware::{
    ChainOutcome, Middleware, MiddlewareChain, MiddlewareContext, Next, middleware_fn,
};
pub use registry::ConnectionRegistry;
pub use rooms::{Room, RoomRegistry};
pub use server::{Server, ServerHandle};
pub use websocket::{ON_CONNECT_EVENT, ServerEvent};
