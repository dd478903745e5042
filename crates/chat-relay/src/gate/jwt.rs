//! HS256 user-token decoder.

use super::{AuthError, Identity, TokenDecoder};
use async_trait::async_trait;
use common::jwt::decode_user_token;
use common::secret::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

/// Verifies user tokens signed with a shared HS256 secret.
pub struct JwtTokenDecoder {
    secret: SecretString,
    clock_skew: Duration,
}

impl JwtTokenDecoder {
    #[must_use]
    pub fn new(secret: SecretString, clock_skew: Duration) -> Self {
        Self { secret, clock_skew }
    }
}

#[async_trait]
impl TokenDecoder for JwtTokenDecoder {
    async fn decode_token(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = decode_user_token(
            token,
            self.secret.expose_secret().as_bytes(),
            self.clock_skew,
        )
        .map_err(|e| {
            debug!(target: "relay.gate", reason = ?e, "User token rejected");
            AuthError
        })?;

        if claims.sub.is_empty() || claims.device_id.is_empty() {
            debug!(target: "relay.gate", "User token missing subject or device");
            return Err(AuthError);
        }

        Ok(Identity {
            user_id: claims.user_id(),
            device_id: claims.device_id(),
        })
    }
}
