//! In-memory transport for driving a `Connection` from a test.
//!
//! `mock_transport()` returns the reader and writer a connection consumes,
//! plus a [`MockPeer`] the test uses to play the remote client.

use async_trait::async_trait;
use chat_relay::errors::TransportError;
use chat_relay::transport::{FrameReader, FrameWriter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Inbound = Result<Option<String>, TransportError>;

pub struct MockReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

pub struct MockWriter {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    stalled: bool,
    writes: Arc<AtomicUsize>,
}

/// Test-side end of a mock transport.
pub struct MockPeer {
    to_connection: mpsc::UnboundedSender<Inbound>,
    from_connection: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

/// A transport whose writes complete immediately.
pub fn mock_transport() -> (MockReader, MockWriter, MockPeer) {
    build(false)
}

/// A transport whose writes never complete, like a client that stopped
/// reading. The connection's outbound queue fills up behind it.
pub fn stalled_transport() -> (MockReader, MockWriter, MockPeer) {
    build(true)
}

fn build(stalled: bool) -> (MockReader, MockWriter, MockPeer) {
    let (to_connection, rx) = mpsc::unbounded_channel();
    let (tx, from_connection) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let writes = Arc::new(AtomicUsize::new(0));
    (
        MockReader { rx },
        MockWriter {
            tx,
            closed: Arc::clone(&closed),
            stalled,
            writes: Arc::clone(&writes),
        },
        MockPeer {
            to_connection,
            from_connection,
            closed,
            writes,
        },
    )
}

impl MockPeer {
    /// Send a text frame to the connection.
    pub fn send_text(&self, text: &str) {
        let _ = self.to_connection.send(Ok(Some(text.to_string())));
    }

    /// Close the session from the client side.
    pub fn hang_up(&self) {
        let _ = self.to_connection.send(Ok(None));
    }

    /// Make the connection's next read fail.
    pub fn fail_read(&self) {
        let _ = self
            .to_connection
            .send(Err(TransportError::Io("connection reset by peer".to_string())));
    }

    /// Next frame the connection wrote, waiting up to one second.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), self.from_connection.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let frame = self.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Frame already written, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_connection.try_recv().ok()
    }

    /// Everything written so far.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_connection.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Whether the connection closed its writer.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write attempts, including ones stuck on a stalled transport.
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameReader for MockReader {
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(item) => item,
            // Peer dropped without hanging up: an idle socket.
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.tx
            .send(frame.to_string())
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
