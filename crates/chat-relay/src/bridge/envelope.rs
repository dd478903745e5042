//! Canonical message envelope and its backbone framing.
//!
//! Wire shape of an envelope (also what members receive):
//!
//! ```json
//! {"room_id":"r1","user_id":"u1","device_id":"d1","text":"hi","timestamp":1718000000000}
//! ```
//!
//! On the backbone the envelope travels inside a [`BackboneFrame`] that adds
//! the id of the originating relay instance.

use crate::errors::BackboneError;
use common::types::{DeviceId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// One chat message, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    room_id: RoomId,
    user_id: UserId,
    device_id: DeviceId,
    text: String,
    /// Milliseconds since the Unix epoch, assigned by the relay.
    timestamp: i64,
}

impl MessageEnvelope {
    #[must_use]
    pub fn new(
        room_id: RoomId,
        user_id: UserId,
        device_id: DeviceId,
        text: String,
        timestamp: i64,
    ) -> Self {
        Self {
            room_id,
            user_id,
            device_id,
            text,
            timestamp,
        }
    }

    /// Tag an inbound frame with its sender and the current time.
    #[must_use]
    pub fn stamped_now(room_id: RoomId, user_id: UserId, device_id: DeviceId, text: String) -> Self {
        Self::new(
            room_id,
            user_id,
            device_id,
            text,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// JSON text sent to members.
    ///
    /// # Errors
    ///
    /// `BackboneError::Codec` if serialization fails.
    pub fn to_json(&self) -> Result<String, BackboneError> {
        serde_json::to_string(self).map_err(|e| BackboneError::Codec(e.to_string()))
    }
}

/// Envelope plus the relay instance that published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneFrame {
    pub origin: String,
    pub envelope: MessageEnvelope,
}

impl BackboneFrame {
    /// # Errors
    ///
    /// `BackboneError::Codec` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, BackboneError> {
        serde_json::to_vec(self).map_err(|e| BackboneError::Codec(e.to_string()))
    }

    /// # Errors
    ///
    /// `BackboneError::Codec` for anything that is not a well-formed frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, BackboneError> {
        serde_json::from_slice(bytes).map_err(|e| BackboneError::Codec(e.to_string()))
    }
}
