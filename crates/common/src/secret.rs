//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used by the relay. `SecretString`
//! implements `Debug` with redaction, so a config struct that holds the JWT
//! signing secret or a Redis URL with credentials can derive or print
//! `Debug` without leaking them. Values are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let jwt_secret = SecretString::from("hs256-signing-secret");
//! assert!(!format!("{jwt_secret:?}").contains("hs256"));
//! assert_eq!(jwt_secret.expose_secret(), "hs256-signing-secret");
//! ```
//!
//! Use `SecretString` for:
//! - The user token signing secret
//! - Redis URLs (may embed `:password@`)
//! - Bearer tokens held past the admission check

pub use secrecy::{ExposeSecret, SecretString};
