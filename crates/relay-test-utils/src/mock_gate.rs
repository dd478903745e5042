//! Mock admission collaborators.
//!
//! [`MockGate`] implements both `TokenDecoder` and `MembershipDirectory`.
//! Tokens are `"<user>:<device>"` strings; any other token is rejected.
//! Rooms and members are declared with the builder methods.

use async_trait::async_trait;
use chat_relay::gate::{
    AccessGate, AuthError, Identity, LookupError, MembershipDirectory, TokenDecoder,
};
use common::types::{DeviceId, RoomId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct MockGate {
    rooms: HashMap<String, HashSet<String>>,
    broken: bool,
    decode_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
}

impl MockGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `user` a member of `room`, creating the room if needed.
    pub fn member(mut self, room: &str, user: &str) -> Self {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(user.to_string());
        self
    }

    /// Declare a room with no members.
    pub fn room(mut self, room: &str) -> Self {
        self.rooms.entry(room.to_string()).or_default();
        self
    }

    /// Make every membership lookup fail.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// Build an `AccessGate` backed by this mock; keep the returned `Arc` to
    /// inspect call counts.
    pub fn into_access_gate(self) -> (AccessGate, Arc<MockGate>) {
        let mock = Arc::new(self);
        (AccessGate::new(mock.clone(), mock.clone()), mock)
    }
}

/// Token accepted by [`MockGate`].
pub fn mock_token(user: &str, device: &str) -> String {
    format!("{user}:{device}")
}

#[async_trait]
impl TokenDecoder for MockGate {
    async fn decode_token(&self, token: &str) -> Result<Identity, AuthError> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        let (user, device) = token.split_once(':').ok_or(AuthError)?;
        if user.is_empty() || device.is_empty() {
            return Err(AuthError);
        }
        Ok(Identity {
            user_id: UserId::from(user),
            device_id: DeviceId::from(device),
        })
    }
}

#[async_trait]
impl MembershipDirectory for MockGate {
    async fn is_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool, LookupError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(LookupError::Backend("mock directory unavailable".to_string()));
        }
        let members = self
            .rooms
            .get(room_id.as_str())
            .ok_or(LookupError::RoomNotFound)?;
        Ok(members.contains(user_id.as_str()))
    }
}
