//! Per-room member set with non-blocking broadcast.

use super::connection::{CloseReason, ConnectionHandle, Delivery};
use crate::observability::metrics;
use common::types::{RoomId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// What to do when a user registers while already holding a connection in
/// the same room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the new connection and tear down the old one.
    #[default]
    Replace,
    /// Refuse the new connection.
    Reject,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("User already connected to room")]
    AlreadyConnected,
    /// The hub was reclaimed after its last member left; register with the
    /// registry's current hub for the room instead.
    #[error("Room hub already reclaimed")]
    HubClosed,
}

/// Tally of one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members whose queue accepted the payload.
    pub delivered: usize,
    /// Members whose queue was full.
    pub dropped: usize,
    /// Members already closing.
    pub closed: usize,
}

/// Live members of one room, at most one connection per user.
///
/// The member set is guarded by this hub's own lock; rooms never contend
/// with each other.
#[derive(Debug)]
pub struct ConnectionHub {
    room_id: RoomId,
    policy: DuplicatePolicy,
    members: RwLock<HashMap<UserId, ConnectionHandle>>,
    // Only set while holding the `members` write lock.
    retired: AtomicBool,
}

impl ConnectionHub {
    #[must_use]
    pub fn new(room_id: RoomId, policy: DuplicatePolicy) -> Self {
        Self {
            room_id,
            policy,
            members: RwLock::new(HashMap::new()),
            retired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Add `connection` to the member set.
    ///
    /// Registering the same connection twice is a no-op. A different
    /// connection for an already-registered user is handled per the hub's
    /// [`DuplicatePolicy`]; under `Replace` the displaced handle is closed and
    /// returned.
    ///
    /// # Errors
    ///
    /// `RegisterError::AlreadyConnected` under `DuplicatePolicy::Reject`,
    /// `RegisterError::HubClosed` once the hub is retired.
    pub async fn register(
        &self,
        connection: ConnectionHandle,
    ) -> Result<Option<ConnectionHandle>, RegisterError> {
        let mut members = self.members.write().await;
        if self.retired.load(Ordering::Acquire) {
            return Err(RegisterError::HubClosed);
        }

        if let Some(existing) = members.get(connection.user_id()) {
            if existing.same_connection(&connection) {
                return Ok(None);
            }
            if self.policy == DuplicatePolicy::Reject {
                debug!(
                    target: "relay.hub",
                    room_id = %self.room_id,
                    user_id = %connection.user_id(),
                    "Rejecting duplicate connection"
                );
                return Err(RegisterError::AlreadyConnected);
            }
        }

        let user_id = connection.user_id().clone();
        let connection_id = connection.id();
        let replaced = members.insert(user_id.clone(), connection);
        let member_count = members.len();
        drop(members);

        if let Some(old) = &replaced {
            old.close(CloseReason::Replaced);
            metrics::record_connection_replaced();
            info!(
                target: "relay.hub",
                room_id = %self.room_id,
                user_id = %user_id,
                old_connection_id = %old.id(),
                connection_id = %connection_id,
                "Replaced existing connection"
            );
        } else {
            debug!(
                target: "relay.hub",
                room_id = %self.room_id,
                user_id = %user_id,
                connection_id = %connection_id,
                member_count,
                "Connection registered"
            );
        }

        Ok(replaced)
    }

    /// Remove `connection` and close it.
    ///
    /// Only removes the entry if it still refers to this exact connection, so
    /// a replaced connection unregistering late cannot evict its successor.
    /// Returns whether an entry was removed.
    pub async fn unregister(&self, connection: &ConnectionHandle) -> bool {
        let removed = {
            let mut members = self.members.write().await;
            let is_current = members
                .get(connection.user_id())
                .is_some_and(|current| current.same_connection(connection));
            if is_current {
                members.remove(connection.user_id());
            }
            is_current
        };

        connection.close(CloseReason::Removed);

        if removed {
            debug!(
                target: "relay.hub",
                room_id = %self.room_id,
                user_id = %connection.user_id(),
                connection_id = %connection.id(),
                "Connection unregistered"
            );
        }
        removed
    }

    /// Enqueue `payload` for every member except `exclude`.
    ///
    /// Never waits on a member: a full queue drops the payload for that
    /// member only.
    pub async fn broadcast(&self, payload: Arc<str>, exclude: Option<&UserId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        {
            let members = self.members.read().await;
            for (user_id, member) in members.iter() {
                if exclude == Some(user_id) {
                    continue;
                }
                match member.try_deliver(Arc::clone(&payload)) {
                    Delivery::Queued => report.delivered += 1,
                    Delivery::Dropped => report.dropped += 1,
                    Delivery::Closed => report.closed += 1,
                }
            }
        }

        if report.dropped > 0 {
            debug!(
                target: "relay.hub",
                room_id = %self.room_id,
                dropped = report.dropped,
                "Outbound queue full, message dropped for slow members"
            );
        }
        metrics::record_broadcast(report.delivered, report.dropped);
        report
    }

    /// Whether this hub was reclaimed. A retired hub never accepts members
    /// again.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Retire the hub if it has no members.
    ///
    /// Returns true only for the call that performed the retirement.
    pub(crate) async fn retire_if_empty(&self) -> bool {
        let members = self.members.write().await;
        if !members.is_empty() || self.retired.load(Ordering::Acquire) {
            return false;
        }
        self.retired.store(true, Ordering::Release);
        true
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    pub async fn contains(&self, user_id: &UserId) -> bool {
        self.members.read().await.contains_key(user_id)
    }

    /// Current handle for `user_id`, if registered.
    pub async fn member(&self, user_id: &UserId) -> Option<ConnectionHandle> {
        self.members.read().await.get(user_id).cloned()
    }

    /// Snapshot of registered user ids.
    pub async fn members(&self) -> Vec<UserId> {
        self.members.read().await.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(super) async fn lock_members(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, HashMap<UserId, ConnectionHandle>> {
        self.members.write().await
    }

    /// Close every member. Used on shutdown.
    pub async fn close_all(&self, reason: CloseReason) {
        for member in self.members.read().await.values() {
            member.close(reason);
        }
    }
}
