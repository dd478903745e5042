//! Per-room connection hubs.
//!
//! - [`connection`] - one live session and its two loops
//! - [`room`] - `ConnectionHub`, the member set of one room
//! - [`registry`] - `HubRegistry`, the room to hub map

pub mod connection;
pub mod registry;
pub mod room;

pub use connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionIdentity, ConnectionState, Delivery,
    InboundHandler, DEFAULT_OUTBOUND_QUEUE_CAPACITY,
};
pub use registry::{HubRegistry, RoomLifecycle};
pub use room::{BroadcastReport, ConnectionHub, DuplicatePolicy, RegisterError};
