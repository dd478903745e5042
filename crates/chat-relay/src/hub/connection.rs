//! One live duplex session.
//!
//! A [`Connection`] owns the transport halves and the receiving end of a
//! bounded outbound queue. [`Connection::run`] drives two concurrent loops:
//!
//! - the inbound loop reads frames and hands them to an [`InboundHandler`]
//! - the outbound loop drains the queue and writes to the transport
//!
//! The loops share nothing but the queue and a one-shot close signal (a
//! `CancellationToken` that is a child of the relay's shutdown token).
//! [`ConnectionHandle`] is the cheap, cloneable reference the hub keeps.
//!
//! # Lifecycle
//!
//! `Open -> Closing -> Closed`. `close` moves `Open -> Closing` exactly once
//! and fires the close signal, which unblocks both loops. The connection is
//! `Closed` once both loops have stopped and the transport has been closed.

use crate::transport::{FrameReader, FrameWriter};
use async_trait::async_trait;
use common::types::{ConnectionId, DeviceId, RoomId, UserId};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Who is on the other end of a connection, as established at admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub room_id: RoomId,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or ended the stream.
    PeerClosed,
    /// Read or write failed.
    TransportError,
    /// Outbound queue was closed.
    QueueClosed,
    /// Unregistered from its hub.
    Removed,
    /// Superseded by a newer connection for the same user.
    Replaced,
    /// Relay shutting down.
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::QueueClosed => "queue_closed",
            CloseReason::Removed => "removed",
            CloseReason::Replaced => "replaced",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload is in the outbound queue.
    Queued,
    /// Queue was full; payload dropped for this member only.
    Dropped,
    /// Connection is closing or closed.
    Closed,
}

/// Receives what a connection reads off its transport.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// One text frame from `sender`'s peer.
    async fn on_frame(&self, sender: &ConnectionHandle, frame: String);

    /// Called once, after both loops have stopped.
    async fn on_closed(&self, connection: &ConnectionHandle);
}

struct Shared {
    id: ConnectionId,
    identity: ConnectionIdentity,
    state: AtomicU8,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn close(&self, reason: CloseReason) -> bool {
        let initiated = self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if initiated {
            debug!(
                target: "relay.connection",
                connection_id = %self.id,
                room_id = %self.identity.room_id,
                user_id = %self.identity.user_id,
                reason = %reason,
                "Closing connection"
            );
        }
        // Cancelling an already-cancelled token is a no-op.
        self.closed.cancel();
        initiated
    }
}

/// Cloneable reference to a live connection.
///
/// Holds a sender for the outbound queue and the close signal; does not own
/// the transport.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Arc<str>>,
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("user_id", &self.shared.identity.user_id)
            .field("room_id", &self.shared.identity.room_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.shared.identity.user_id
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.shared.identity.device_id
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.shared.identity.room_id
    }

    #[must_use]
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.shared.identity
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether both handles refer to the same connection.
    #[must_use]
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Enqueue `frame` without waiting.
    ///
    /// A full queue drops the frame for this connection only.
    pub fn try_deliver(&self, frame: Arc<str>) -> Delivery {
        if self.shared.state() != ConnectionState::Open {
            return Delivery::Closed;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Frames waiting in the outbound queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// Fixed capacity of the outbound queue.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.outbound.max_capacity()
    }

    /// Frames dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Begin teardown. Safe to call any number of times from any task.
    ///
    /// Returns `true` only for the call that moved the connection out of
    /// `Open`.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }

    /// Resolves once `close` has been called or the relay is shutting down.
    pub async fn closing(&self) {
        self.shared.closed.cancelled().await;
    }

    fn mark_closed(&self) {
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
    }
}

/// A live session: transport halves plus the outbound queue receiver.
pub struct Connection<R, W> {
    handle: ConnectionHandle,
    outbound_rx: mpsc::Receiver<Arc<str>>,
    reader: R,
    writer: W,
}

impl<R: FrameReader, W: FrameWriter> Connection<R, W> {
    /// Create a connection whose close signal is a child of `parent`.
    ///
    /// `queue_capacity` is clamped to at least 1.
    pub fn new(
        identity: ConnectionIdentity,
        queue_capacity: usize,
        parent: &CancellationToken,
        reader: R,
        writer: W,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let shared = Arc::new(Shared {
            id: ConnectionId::new(),
            identity,
            state: AtomicU8::new(STATE_OPEN),
            closed: parent.child_token(),
            dropped: AtomicU64::new(0),
        });
        Self {
            handle: ConnectionHandle { outbound, shared },
            outbound_rx,
            reader,
            writer,
        }
    }

    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Run both loops until the connection is torn down.
    ///
    /// Returns after the transport is closed and `handler.on_closed` ran.
    #[instrument(
        skip_all,
        name = "relay.connection",
        fields(
            connection_id = %self.handle.id(),
            room_id = %self.handle.room_id(),
            user_id = %self.handle.user_id()
        )
    )]
    pub async fn run(self, handler: Arc<dyn InboundHandler>) {
        let Self {
            handle,
            outbound_rx,
            reader,
            writer,
        } = self;

        debug!(target: "relay.connection", "Connection started");

        let outbound = tokio::spawn(outbound_loop(handle.clone(), outbound_rx, writer));
        let reason = inbound_loop(&handle, reader, handler.as_ref()).await;
        handle.close(reason);

        if let Err(e) = outbound.await {
            warn!(
                target: "relay.connection",
                connection_id = %handle.id(),
                error = %e,
                "Outbound loop panicked"
            );
        }

        handle.mark_closed();
        handler.on_closed(&handle).await;

        info!(
            target: "relay.connection",
            connection_id = %handle.id(),
            dropped = handle.dropped(),
            "Connection closed"
        );
    }

    /// Tear down a connection that never ran (e.g. rejected at registration).
    pub async fn discard(self) {
        let Self {
            handle, mut writer, ..
        } = self;
        handle.close(CloseReason::Removed);
        if let Err(e) = writer.close().await {
            debug!(target: "relay.connection", error = %e, "Transport close failed");
        }
        handle.mark_closed();
    }
}

async fn inbound_loop<R: FrameReader>(
    handle: &ConnectionHandle,
    mut reader: R,
    handler: &dyn InboundHandler,
) -> CloseReason {
    loop {
        let read = tokio::select! {
            biased;
            () = handle.closing() => return CloseReason::Shutdown,
            read = reader.read_frame() => read,
        };

        match read {
            // A handler stuck downstream must not outlive the close signal.
            Ok(Some(frame)) => tokio::select! {
                biased;
                () = handle.closing() => return CloseReason::Shutdown,
                () = handler.on_frame(handle, frame) => {}
            },
            Ok(None) => {
                debug!(
                    target: "relay.connection",
                    connection_id = %handle.id(),
                    "Peer closed the session"
                );
                return CloseReason::PeerClosed;
            }
            Err(e) => {
                debug!(
                    target: "relay.connection",
                    connection_id = %handle.id(),
                    error = %e,
                    "Inbound read failed"
                );
                return CloseReason::TransportError;
            }
        }
    }
}

async fn outbound_loop<W: FrameWriter>(
    handle: ConnectionHandle,
    mut outbound_rx: mpsc::Receiver<Arc<str>>,
    mut writer: W,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = handle.closing() => break,
            next = outbound_rx.recv() => next,
        };

        let Some(frame) = next else {
            handle.close(CloseReason::QueueClosed);
            break;
        };

        let written = tokio::select! {
            biased;
            () = handle.closing() => break,
            written = writer.write_frame(&frame) => written,
        };

        if let Err(e) = written {
            debug!(
                target: "relay.connection",
                connection_id = %handle.id(),
                error = %e,
                "Outbound write failed"
            );
            handle.close(CloseReason::TransportError);
            break;
        }
    }

    // Refuse further enqueues; anything still buffered is discarded with the receiver.
    outbound_rx.close();

    if let Err(e) = writer.close().await {
        debug!(
            target: "relay.connection",
            connection_id = %handle.id(),
            error = %e,
            "Transport close failed"
        );
    }
}
