//! Chat relay: real-time delivery of chat messages to the live members of a
//! room, across any number of relay instances.
//!
//! # Architecture
//!
//! ```text
//! AccessGate ─► Connection ─► ConnectionHub (per room)
//!                   │                ▲
//!                   ▼                │ broadcast
//!             MessageBridge ──► Backbone (Redis pub/sub) ──► MessageBridge (any instance)
//! ```
//!
//! - A [`hub::Connection`] runs an inbound and an outbound loop over one
//!   WebSocket; its outbound queue is bounded and never blocks a broadcast.
//! - A [`hub::ConnectionHub`] holds one room's members, at most one
//!   connection per user; [`hub::HubRegistry`] maps rooms to hubs and
//!   reclaims empty ones.
//! - The [`bridge::MessageBridge`] delivers locally, publishes to the
//!   backbone, and re-injects messages from other instances.
//! - The [`gate::AccessGate`] authenticates and authorizes before any
//!   connection is created.
//!
//! # Modules
//!
//! - [`bridge`] - envelopes, backbones, the message bridge
//! - [`config`] - service configuration from environment
//! - [`errors`] - error types and HTTP mapping
//! - [`gate`] - admission control
//! - [`hub`] - connections and per-room hubs
//! - [`observability`] - metrics and health probes
//! - [`relay`] - the assembled service
//! - [`routes`] - HTTP router
//! - [`transport`] - frame transport traits and the WebSocket adapter

pub mod bridge;
pub mod config;
pub mod errors;
pub mod gate;
pub mod hub;
pub mod observability;
pub mod relay;
pub mod routes;
pub mod transport;
