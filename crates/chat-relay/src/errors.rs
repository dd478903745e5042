//! Chat relay error types.
//!
//! Errors are split by containment boundary:
//!
//! - [`AdmissionError`] rejects a request before any connection exists and
//!   maps to an HTTP status on the upgrade response.
//! - [`TransportError`] is local to one connection and only ever triggers
//!   that connection's teardown.
//! - [`BackboneError`] covers publish/subscribe failures against the pub/sub
//!   backbone; it is logged and never tears down a connection.
//!
//! Internal details are logged server-side but not exposed to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Admission failure, raised by the access gate or the duplicate policy.
///
/// Maps to HTTP status codes:
/// - `Unauthorized`: 401
/// - `Forbidden`: 403
/// - `NotFound`: 404
/// - `Conflict`: 409
/// - `Internal`: 500
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Missing, invalid or expired credential.
    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated user is not a member of the room.
    #[error("Forbidden")]
    Forbidden,

    /// Room does not exist.
    #[error("Room not found")]
    NotFound,

    /// User already holds a live connection in the room and the duplicate
    /// policy rejects a second one.
    #[error("Already connected to room")]
    Conflict,

    /// Membership lookup or other collaborator failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Returns the HTTP status code for this error (for metrics recording).
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::Unauthorized => 401,
            AdmissionError::Forbidden => 403,
            AdmissionError::NotFound => 404,
            AdmissionError::Conflict => 409,
            AdmissionError::Internal(_) => 500,
        }
    }

    /// Bounded label for the admissions metric.
    #[must_use]
    pub fn outcome_label(&self) -> &'static str {
        match self {
            AdmissionError::Unauthorized => "unauthorized",
            AdmissionError::Forbidden => "forbidden",
            AdmissionError::NotFound => "not_found",
            AdmissionError::Conflict => "conflict",
            AdmissionError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: &'static str,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AdmissionError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "The access token is invalid or expired",
            ),
            AdmissionError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Not a member of this room",
            ),
            AdmissionError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", "Room not found"),
            AdmissionError::Conflict => (
                StatusCode::CONFLICT,
                "CONFLICT",
                "Already connected to this room",
            ),
            AdmissionError::Internal(err) => {
                // Log actual error server-side, return generic message to client
                tracing::error!(target: "relay.gate", error = %err, "Admission check failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred",
                )
            }
        };

        let body = Json(ErrorResponse {
            error: ErrorDetail { code, message },
        });

        (status, body).into_response()
    }
}

/// Failure on one connection's transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport is already closed.
    #[error("Transport closed")]
    Closed,

    /// Read or write failed.
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// Peer violated the framing protocol.
    #[error("Transport protocol error: {0}")]
    Protocol(String),
}

/// Failure talking to the pub/sub backbone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackboneError {
    /// Publishing a message failed.
    #[error("Backbone publish failed: {0}")]
    Publish(String),

    /// Establishing a subscription failed.
    #[error("Backbone subscribe failed: {0}")]
    Subscribe(String),

    /// A message could not be encoded or decoded.
    #[error("Backbone codec error: {0}")]
    Codec(String),
}

/// Top-level service error used during startup.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backbone error.
    #[error(transparent)]
    Backbone(#[from] BackboneError),

    /// Membership directory error.
    #[error("Membership directory error: {0}")]
    Membership(String),

    /// Listener or server I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl RelayError {
    /// HTTP-style status code for metrics and logs.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Config(_) => 500,
            RelayError::Backbone(_) | RelayError::Membership(_) | RelayError::Io(_) => 503,
        }
    }
}
