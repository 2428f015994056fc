//! # roomcast-core
//!
//! Foundation types shared by the roomcast crates:
//!
//! - **Connection ids**: [`ConnectionId`], a UUID v7 newtype assigned at accept time
//! - **Frames**: the `[eventName, ...args]` JSON wire envelope ([`Frame`], [`FrameError`])
//! - **Event bus**: [`EventBus`], named-event subscription and fire-and-forget dispatch
//! - **Logging**: `tracing` subscriber setup and in-memory log capture for tests

#![deny(unsafe_code)]

pub mod event_bus;
pub mod frame;
pub mod ids;
pub mod logging;

pub use event_bus::{EventBus, ListenerFuture, ListenerId};
pub use frame::{Frame, FrameError};
pub use ids::ConnectionId;
