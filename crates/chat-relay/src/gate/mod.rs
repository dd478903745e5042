//! Admission control.
//!
//! [`AccessGate`] turns a bearer token and a room id into an [`Admission`]
//! or an [`AdmissionError`]. It runs strictly in order, authenticate then
//! authorize, and allocates nothing connection-related; the caller creates
//! the connection only after `admit` succeeds.
//!
//! - [`jwt`] - HS256 user-token decoder
//! - [`membership`] - Redis-backed membership directory

pub mod jwt;
pub mod membership;

pub use jwt::JwtTokenDecoder;
pub use membership::RedisMembershipDirectory;

use crate::errors::AdmissionError;
use async_trait::async_trait;
use common::types::{DeviceId, RoomId, UserId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

/// Token rejected. Deliberately carries no detail.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid or expired token")]
pub struct AuthError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Membership lookup failed: {0}")]
    Backend(String),
}

/// Decodes a bearer token into an identity.
#[async_trait]
pub trait TokenDecoder: Send + Sync {
    async fn decode_token(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Answers whether a user belongs to a room.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// # Errors
    ///
    /// `LookupError::RoomNotFound` if the room does not exist,
    /// `LookupError::Backend` if the lookup itself failed.
    async fn is_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool, LookupError>;
}

/// An admitted request: who, and into which room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub identity: Identity,
    pub room_id: RoomId,
}

#[derive(Clone)]
pub struct AccessGate {
    decoder: Arc<dyn TokenDecoder>,
    directory: Arc<dyn MembershipDirectory>,
}

impl AccessGate {
    pub fn new(decoder: Arc<dyn TokenDecoder>, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self { decoder, directory }
    }

    /// # Errors
    ///
    /// `AdmissionError::Unauthorized` for a missing or rejected token.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AdmissionError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AdmissionError::Unauthorized)?;

        self.decoder.decode_token(token).await.map_err(|_| {
            debug!(target: "relay.gate", "Token rejected");
            AdmissionError::Unauthorized
        })
    }

    /// # Errors
    ///
    /// `Forbidden` if not a member, `NotFound` if the room does not exist,
    /// `Internal` if the lookup failed.
    pub async fn authorize(&self, user_id: &UserId, room_id: &RoomId) -> Result<(), AdmissionError> {
        match self.directory.is_member(room_id, user_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AdmissionError::Forbidden),
            Err(LookupError::RoomNotFound) => Err(AdmissionError::NotFound),
            Err(LookupError::Backend(e)) => Err(AdmissionError::Internal(e)),
        }
    }

    /// Authenticate, then authorize.
    ///
    /// # Errors
    ///
    /// The first failing step's error; authorization is never attempted
    /// for an unauthenticated request.
    #[instrument(skip_all, name = "relay.gate.admit", fields(room_id = %room_id))]
    pub async fn admit(
        &self,
        token: Option<&str>,
        room_id: &RoomId,
    ) -> Result<Admission, AdmissionError> {
        let identity = self.authenticate(token).await?;
        self.authorize(&identity.user_id, room_id).await?;
        debug!(
            target: "relay.gate",
            room_id = %room_id,
            user_id = %identity.user_id,
            "Admitted"
        );
        Ok(Admission {
            identity,
            room_id: room_id.clone(),
        })
    }
}
