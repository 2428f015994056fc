//! Rooms: named groups of connections with targeted broadcast.

pub mod registry;
pub mod room;

pub use registry::RoomRegistry;
pub use room::{JOIN_EVENT, LEAVE_EVENT, Room};
