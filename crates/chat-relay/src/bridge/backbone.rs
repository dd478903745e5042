//! Pub/sub backbone abstraction and topic naming.
//!
//! The backbone is treated as an opaque at-most-once transport: a publish
//! that returns `Ok` may still never be delivered, and a subscriber that
//! falls behind may lose messages.

use crate::errors::BackboneError;
use async_trait::async_trait;
use common::types::RoomId;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Receives messages for one subscription.
#[async_trait]
pub trait BackboneHandler: Send + Sync + 'static {
    async fn on_message(&self, topic: &str, payload: Vec<u8>);
}

/// A pub/sub transport shared by every relay instance.
#[async_trait]
pub trait Backbone: Send + Sync + 'static {
    /// Publish `payload` on `topic`.
    ///
    /// # Errors
    ///
    /// `BackboneError::Publish` if the backbone refused or was unreachable.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackboneError>;

    /// Start delivering `topic` to `handler` until the returned
    /// [`Subscription`] is cancelled or dropped.
    ///
    /// Not async: subscriptions are opened from room lifecycle callbacks that
    /// run under the registry lock. Implementations spawn their receive task
    /// and return immediately.
    ///
    /// # Errors
    ///
    /// `BackboneError::Subscribe` if the subscription cannot be set up.
    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BackboneHandler>,
    ) -> Result<Subscription, BackboneError>;

    /// Probe the backbone. Defaults to healthy.
    ///
    /// # Errors
    ///
    /// Returns the probe failure.
    async fn health_check(&self) -> Result<(), BackboneError> {
        Ok(())
    }
}

/// Resolves once a subscription is actually receiving.
#[derive(Debug, Clone)]
pub struct SubscriptionReady(watch::Receiver<bool>);

impl SubscriptionReady {
    /// Already receiving.
    #[must_use]
    pub fn ready() -> Self {
        let (_signal, ready) = watch::channel(true);
        Self(ready)
    }

    /// Not yet receiving; fires when the returned signal is marked.
    #[must_use]
    pub fn pending() -> (ReadySignal, Self) {
        let (signal, ready) = watch::channel(false);
        (ReadySignal(signal), Self(ready))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until receiving. False if the subscription ended first.
    pub async fn wait(mut self) -> bool {
        self.0.wait_for(|ready| *ready).await.is_ok()
    }
}

/// Marks a [`SubscriptionReady`]. Dropping it unmarked means the
/// subscription never came up.
#[derive(Debug)]
pub struct ReadySignal(watch::Sender<bool>);

impl ReadySignal {
    pub fn mark(&self) {
        self.0.send_replace(true);
    }
}

/// Live subscription; cancelled on drop.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    cancel: CancellationToken,
    ready: SubscriptionReady,
}

impl Subscription {
    /// A subscription that is receiving as soon as it is returned.
    #[must_use]
    pub fn new(topic: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            topic: topic.into(),
            cancel,
            ready: SubscriptionReady::ready(),
        }
    }

    /// Replace the readiness of a subscription set up in the background.
    #[must_use]
    pub fn with_ready(mut self, ready: SubscriptionReady) -> Self {
        self.ready = ready;
        self
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn ready(&self) -> SubscriptionReady {
        self.ready.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How rooms map to backbone topics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TopicStrategy {
    /// One topic per room; subscriptions follow room lifecycle.
    #[default]
    PerRoom,
    /// One topic for every room; consumers filter by room id.
    Shared,
}

impl FromStr for TopicStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-room" | "per_room" => Ok(TopicStrategy::PerRoom),
            "shared" => Ok(TopicStrategy::Shared),
            other => Err(format!("unknown topic strategy '{other}'")),
        }
    }
}

/// Topic names for a strategy and prefix.
///
/// - per-room: `<prefix>:room:<room_id>`
/// - shared: `<prefix>:messages`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    strategy: TopicStrategy,
    prefix: String,
}

impl TopicScheme {
    #[must_use]
    pub fn new(strategy: TopicStrategy, prefix: impl Into<String>) -> Self {
        Self {
            strategy,
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> TopicStrategy {
        self.strategy
    }

    /// Topic a message for `room_id` is published on.
    #[must_use]
    pub fn topic_for(&self, room_id: &RoomId) -> String {
        match self.strategy {
            TopicStrategy::PerRoom => self.room_topic(room_id),
            TopicStrategy::Shared => self.shared_topic(),
        }
    }

    #[must_use]
    pub fn room_topic(&self, room_id: &RoomId) -> String {
        format!("{}:room:{}", self.prefix, room_id)
    }

    #[must_use]
    pub fn shared_topic(&self) -> String {
        format!("{}:messages", self.prefix)
    }
}
