//! Room membership backed by Redis sets.
//!
//! # Key Patterns
//!
//! - `<prefix>:room:<room_id>:members` - SET of user ids. The room exists
//!   iff the key exists.

use super::{LookupError, MembershipDirectory};
use async_trait::async_trait;
use common::types::{RoomId, UserId};
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::{error, instrument, warn};

/// Cheap to clone; the multiplexed connection is shared.
#[derive(Clone)]
pub struct RedisMembershipDirectory {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisMembershipDirectory {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// `LookupError::Backend` if the URL is invalid or Redis is unreachable.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, LookupError> {
        // Do not log the URL: it may carry credentials.
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "relay.gate", error = %e, "Failed to open Redis client");
            LookupError::Backend(format!("Failed to open Redis client: {e}"))
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "relay.gate", error = %e, "Failed to connect to Redis");
                LookupError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;
        Ok(Self::from_connection(connection, prefix))
    }

    #[must_use]
    pub fn from_connection(connection: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn members_key(&self, room_id: &RoomId) -> String {
        members_key(&self.prefix, room_id)
    }
}

fn members_key(prefix: &str, room_id: &RoomId) -> String {
    format!("{prefix}:room:{room_id}:members")
}

#[async_trait]
impl MembershipDirectory for RedisMembershipDirectory {
    #[instrument(skip_all, name = "relay.gate.is_member", fields(room_id = %room_id))]
    async fn is_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool, LookupError> {
        let key = self.members_key(room_id);
        let mut conn = self.connection.clone();

        let (exists, member): (bool, bool) = redis::pipe()
            .exists(&key)
            .sismember(&key, user_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "relay.gate", error = %e, "Membership lookup failed");
                LookupError::Backend(e.to_string())
            })?;

        if !exists {
            return Err(LookupError::RoomNotFound);
        }
        Ok(member)
    }
}
