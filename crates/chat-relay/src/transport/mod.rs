//! Transport boundary for one live session.
//!
//! A session is split into an independently owned reader and writer so the
//! connection's inbound and outbound loops can run as separate tasks. Each
//! unit is one opaque text frame; there is no multiplexing.
//!
//! - [`websocket`] - axum WebSocket adapter and the upgrade route

pub mod websocket;

use crate::errors::TransportError;
use async_trait::async_trait;

/// Receiving half of a transport.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Read the next text frame.
    ///
    /// Returns `Ok(None)` when the peer closed the session cleanly.
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError>;
}

/// Sending half of a transport.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Write one text frame.
    async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Close the session. Called once, after the outbound loop stops.
    async fn close(&mut self) -> Result<(), TransportError>;
}
