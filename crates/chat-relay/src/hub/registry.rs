//! Room to hub mapping.
//!
//! Hubs are created lazily on the first join and reclaimed when their last
//! member leaves. The map has its own lock, separate from each hub's member
//! lock, and the two are never held together: a join picks its hub under
//! the map lock, then registers after releasing it. Reclaiming retires the
//! hub first so a join racing with it retries against a fresh hub.

use super::connection::{CloseReason, ConnectionHandle};
use super::room::{ConnectionHub, DuplicatePolicy, RegisterError};
use crate::observability::metrics;
use common::types::{RoomId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Notified when a room gains its first local member or loses its last.
///
/// Called while the registry map lock is held, so implementations must not
/// call back into the registry and must not block.
pub trait RoomLifecycle: Send + Sync {
    fn room_opened(&self, room_id: &RoomId);
    fn room_closed(&self, room_id: &RoomId);
}

/// All live hubs in this process, one per room.
#[derive(Debug)]
pub struct HubRegistry {
    policy: DuplicatePolicy,
    hubs: RwLock<HashMap<RoomId, Arc<ConnectionHub>>>,
    connections: AtomicUsize,
    lifecycle: OnceLock<Weak<dyn RoomLifecycle>>,
}

impl HubRegistry {
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            hubs: RwLock::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            lifecycle: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Install the lifecycle observer. Only the first call takes effect.
    ///
    /// Held weakly: the observer usually owns the registry.
    pub fn set_lifecycle(&self, observer: Weak<dyn RoomLifecycle>) -> bool {
        self.lifecycle.set(observer).is_ok()
    }

    fn lifecycle(&self) -> Option<Arc<dyn RoomLifecycle>> {
        self.lifecycle.get().and_then(Weak::upgrade)
    }

    /// Register `connection` in its room's hub, creating the hub if needed.
    ///
    /// # Errors
    ///
    /// `RegisterError::AlreadyConnected` when the duplicate policy rejects.
    /// A hub left empty by a rejected registration is reclaimed immediately.
    pub async fn join(
        &self,
        connection: ConnectionHandle,
    ) -> Result<Option<ConnectionHandle>, RegisterError> {
        loop {
            let hub = self.open_hub(connection.room_id()).await;
            match hub.register(connection.clone()).await {
                Ok(replaced) => {
                    if replaced.is_none() {
                        self.connections.fetch_add(1, Ordering::AcqRel);
                    }
                    metrics::set_connections_active(self.connection_count());
                    return Ok(replaced);
                }
                // Reclaimed between lookup and registration.
                Err(RegisterError::HubClosed) => {}
                Err(error) => {
                    self.reclaim_if_empty(&hub).await;
                    return Err(error);
                }
            }
        }
    }

    /// Unregister `connection` and reclaim its hub if it is now empty.
    ///
    /// Returns whether the connection was the room's current entry for its
    /// user.
    pub async fn leave(&self, connection: &ConnectionHandle) -> bool {
        let Some(hub) = self.get(connection.room_id()).await else {
            connection.close(CloseReason::Removed);
            return false;
        };

        let removed = hub.unregister(connection).await;
        if removed {
            self.connections.fetch_sub(1, Ordering::AcqRel);
            metrics::set_connections_active(self.connection_count());
        }

        self.reclaim_if_empty(&hub).await;
        removed
    }

    /// Live hub for `room_id`, creating it if absent or retired.
    async fn open_hub(&self, room_id: &RoomId) -> Arc<ConnectionHub> {
        if let Some(hub) = self.hubs.read().await.get(room_id) {
            if !hub.is_retired() {
                return Arc::clone(hub);
            }
        }

        let mut hubs = self.hubs.write().await;
        if let Some(existing) = hubs.get(room_id) {
            if !existing.is_retired() {
                return Arc::clone(existing);
            }
            // Retired but not yet removed; its reclaimer will find it replaced.
            self.notify_closed(room_id);
        }

        let hub = Arc::new(ConnectionHub::new(room_id.clone(), self.policy));
        hubs.insert(room_id.clone(), Arc::clone(&hub));
        info!(target: "relay.hub.registry", room_id = %room_id, "Room opened");
        if let Some(observer) = self.lifecycle() {
            observer.room_opened(room_id);
        }
        metrics::set_rooms_active(hubs.len());
        hub
    }

    /// Retire `hub` if empty, then drop it from the map unless a join has
    /// already replaced it.
    async fn reclaim_if_empty(&self, hub: &Arc<ConnectionHub>) {
        if !hub.retire_if_empty().await {
            return;
        }

        let room_id = hub.room_id();
        let mut hubs = self.hubs.write().await;
        let is_current = hubs
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, hub));
        if is_current {
            hubs.remove(room_id);
            self.notify_closed(room_id);
            metrics::set_rooms_active(hubs.len());
        }
    }

    fn notify_closed(&self, room_id: &RoomId) {
        info!(target: "relay.hub.registry", room_id = %room_id, "Room closed");
        if let Some(observer) = self.lifecycle() {
            observer.room_closed(room_id);
        }
    }

    /// Hub for `room_id`, if any local member is connected.
    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<ConnectionHub>> {
        self.hubs.read().await.get(room_id).cloned()
    }

    /// Whether `user_id` currently holds a connection in `room_id`.
    pub async fn contains_user(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        match self.get(room_id).await {
            Some(hub) => hub.contains(user_id).await,
            None => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    /// Snapshot of rooms with live hubs.
    pub async fn rooms(&self) -> Vec<RoomId> {
        self.hubs.read().await.keys().cloned().collect()
    }

    /// Total registered connections across all rooms.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Close every registered connection. Hubs are reclaimed as the
    /// connections leave.
    pub async fn close_all(&self, reason: CloseReason) {
        let hubs: Vec<Arc<ConnectionHub>> = self.hubs.read().await.values().cloned().collect();
        debug!(
            target: "relay.hub.registry",
            rooms = hubs.len(),
            reason = %reason,
            "Closing all connections"
        );
        for hub in hubs {
            hub.close_all(reason).await;
        }
    }
}
