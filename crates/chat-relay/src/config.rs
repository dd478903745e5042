//! Relay configuration.
//!
//! Loaded from environment variables. Secrets are held as `SecretString`
//! and redacted in `Debug` output.

use crate::bridge::TopicStrategy;
use crate::hub::{DuplicatePolicy, DEFAULT_OUTBOUND_QUEUE_CAPACITY};
use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default listener for WebSocket upgrades and health endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default prefix for backbone topics and membership keys.
pub const DEFAULT_TOPIC_PREFIX: &str = "chat";

/// Inbound text frames larger than this are dropped.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024;

pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 10;

const DEFAULT_INSTANCE_ID_PREFIX: &str = "relay";

/// Which backbone carries messages between instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackboneKind {
    #[default]
    Redis,
    /// In-process only; a single relay instance.
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,

    /// Identity of this instance on the backbone.
    pub instance_id: String,

    /// HS256 secret for user tokens.
    pub jwt_secret: SecretString,

    /// Tolerance for `iat` in the future.
    pub jwt_clock_skew: Duration,

    pub backbone: BackboneKind,

    /// Redis URL for the backbone and the membership directory.
    pub redis_url: SecretString,

    pub topic_strategy: TopicStrategy,

    pub topic_prefix: String,

    /// Per-connection outbound queue capacity, at least 1.
    pub outbound_queue_capacity: usize,

    pub duplicate_policy: DuplicatePolicy,

    pub max_frame_bytes: usize,

    pub shutdown_grace: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("instance_id", &self.instance_id)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_clock_skew", &self.jwt_clock_skew)
            .field("backbone", &self.backbone)
            .field("redis_url", &"[REDACTED]")
            .field("topic_strategy", &self.topic_strategy)
            .field("topic_prefix", &self.topic_prefix)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("duplicate_policy", &self.duplicate_policy)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` for an absent required variable, `InvalidValue` for
    /// anything that does not parse or is out of range.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = SecretString::from(required(vars, "RELAY_JWT_SECRET")?);
        let redis_url = SecretString::from(required(vars, "REDIS_URL")?);

        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let instance_id = vars
            .get("RELAY_INSTANCE_ID")
            .cloned()
            .unwrap_or_else(generate_instance_id);

        let clock_skew_seconds: u64 = parsed(
            vars,
            "RELAY_JWT_CLOCK_SKEW_SECONDS",
            DEFAULT_CLOCK_SKEW.as_secs(),
        )?;
        if clock_skew_seconds > MAX_CLOCK_SKEW.as_secs() {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_JWT_CLOCK_SKEW_SECONDS must be at most {}, got {clock_skew_seconds}",
                MAX_CLOCK_SKEW.as_secs()
            )));
        }

        let backbone = match vars.get("RELAY_BACKBONE").map(|s| s.trim().to_ascii_lowercase()) {
            None => BackboneKind::default(),
            Some(kind) if kind == "redis" => BackboneKind::Redis,
            Some(kind) if kind == "memory" => BackboneKind::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "RELAY_BACKBONE must be 'redis' or 'memory', got '{other}'"
                )))
            }
        };

        let topic_strategy = match vars.get("RELAY_TOPIC_STRATEGY") {
            None => TopicStrategy::default(),
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("RELAY_TOPIC_STRATEGY: {e}")))?,
        };

        let topic_prefix = vars
            .get("RELAY_TOPIC_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
        if topic_prefix.is_empty() {
            return Err(ConfigError::InvalidValue(
                "RELAY_TOPIC_PREFIX must not be empty".to_string(),
            ));
        }

        let outbound_queue_capacity: usize = parsed(
            vars,
            "RELAY_OUTBOUND_QUEUE_CAPACITY",
            DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        )?;
        if outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_OUTBOUND_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }

        let duplicate_policy = match vars
            .get("RELAY_DUPLICATE_POLICY")
            .map(|s| s.trim().to_ascii_lowercase())
        {
            None => DuplicatePolicy::default(),
            Some(policy) if policy == "replace" => DuplicatePolicy::Replace,
            Some(policy) if policy == "reject" => DuplicatePolicy::Reject,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "RELAY_DUPLICATE_POLICY must be 'replace' or 'reject', got '{other}'"
                )))
            }
        };

        let max_frame_bytes: usize = parsed(vars, "RELAY_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?;
        if max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_MAX_FRAME_BYTES must be at least 1".to_string(),
            ));
        }

        let shutdown_grace_seconds: u64 = parsed(
            vars,
            "RELAY_SHUTDOWN_GRACE_SECONDS",
            DEFAULT_SHUTDOWN_GRACE_SECONDS,
        )?;

        Ok(Config {
            bind_address,
            instance_id,
            jwt_secret,
            jwt_clock_skew: Duration::from_secs(clock_skew_seconds),
            backbone,
            redis_url,
            topic_strategy,
            topic_prefix,
            outbound_queue_capacity,
            duplicate_policy,
            max_frame_bytes,
            shutdown_grace: Duration::from_secs(shutdown_grace_seconds),
        })
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parsed<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}='{raw}': {e}"))),
    }
}

fn generate_instance_id() -> String {
    let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let short_suffix = suffix.get(..8).unwrap_or("00000000");
    format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
}
