//! Couples local hubs to the backbone.
//!
//! `publish` delivers to local members first (excluding the sender), then
//! hands the envelope to the backbone wrapped in a [`BackboneFrame`] carrying
//! this instance's id. `consume` drops frames this instance originated, since
//! their local delivery already happened, and broadcasts everything else to
//! the local hub with no exclusion.

use super::backbone::{
    Backbone, BackboneHandler, Subscription, SubscriptionReady, TopicScheme, TopicStrategy,
};
use super::envelope::{BackboneFrame, MessageEnvelope};
use crate::errors::BackboneError;
use crate::hub::{BroadcastReport, HubRegistry, RoomLifecycle};
use crate::observability::metrics;
use async_trait::async_trait;
use common::types::RoomId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, error, info, instrument, warn};

/// What `consume` did with a backbone message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Broadcast to the local hub.
    Delivered(BroadcastReport),
    /// No local members in the envelope's room.
    NoLocalRoom,
    /// Published by this instance; already delivered locally.
    OwnOrigin,
    /// Not a valid frame.
    Malformed,
}

pub struct MessageBridge {
    instance_id: String,
    registry: Arc<HubRegistry>,
    backbone: Arc<dyn Backbone>,
    topics: TopicScheme,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    me: Weak<MessageBridge>,
}

impl std::fmt::Debug for MessageBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBridge")
            .field("instance_id", &self.instance_id)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Backbone handler that holds the bridge weakly so subscription tasks do
/// not keep it alive.
struct BridgeInbox {
    bridge: Weak<MessageBridge>,
}

#[async_trait]
impl BackboneHandler for BridgeInbox {
    async fn on_message(&self, _topic: &str, payload: Vec<u8>) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.consume(&payload).await;
        }
    }
}

impl MessageBridge {
    pub fn new(
        instance_id: impl Into<String>,
        registry: Arc<HubRegistry>,
        backbone: Arc<dyn Backbone>,
        topics: TopicScheme,
    ) -> Arc<Self> {
        let instance_id = instance_id.into();
        Arc::new_cyclic(|me| Self {
            instance_id,
            registry,
            backbone,
            topics,
            subscriptions: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Hook the bridge into room lifecycle and open the shared subscription
    /// when using the shared topic strategy.
    ///
    /// The returned readiness fires once the shared subscription is
    /// receiving. Per-room topics subscribe on demand, so it is ready at once.
    ///
    /// # Errors
    ///
    /// `BackboneError::Subscribe` if the shared subscription fails.
    pub fn start(&self) -> Result<SubscriptionReady, BackboneError> {
        let observer: Weak<dyn RoomLifecycle> = self.me.clone();
        if !self.registry.set_lifecycle(observer) {
            warn!(target: "relay.bridge", "Room lifecycle observer already installed");
        }

        let ready = match self.topics.strategy() {
            TopicStrategy::Shared => self.open_subscription(self.topics.shared_topic())?,
            TopicStrategy::PerRoom => SubscriptionReady::ready(),
        };

        info!(
            target: "relay.bridge",
            instance_id = %self.instance_id,
            strategy = ?self.topics.strategy(),
            "Message bridge started"
        );
        Ok(ready)
    }

    /// Cancel every backbone subscription.
    pub fn shutdown(&self) {
        let mut subscriptions = self.lock_subscriptions();
        let count = subscriptions.len();
        subscriptions.clear();
        debug!(target: "relay.bridge", count, "Backbone subscriptions cancelled");
    }

    /// Topics currently subscribed.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.lock_subscriptions().keys().cloned().collect()
    }

    /// Deliver `envelope` to local members other than its sender, then
    /// publish it to the backbone.
    ///
    /// Returns the local broadcast tally.
    ///
    /// # Errors
    ///
    /// `BackboneError` if encoding or publishing failed. Local delivery has
    /// already happened by then; callers log and carry on.
    #[instrument(
        skip_all,
        name = "relay.bridge.publish",
        fields(room_id = %envelope.room_id(), user_id = %envelope.user_id())
    )]
    pub async fn publish(&self, envelope: MessageEnvelope) -> Result<BroadcastReport, BackboneError> {
        let payload: Arc<str> = Arc::from(envelope.to_json()?);

        let local = match self.registry.get(envelope.room_id()).await {
            Some(hub) => hub.broadcast(payload, Some(envelope.user_id())).await,
            None => BroadcastReport::default(),
        };

        let topic = self.topics.topic_for(envelope.room_id());
        let frame = BackboneFrame {
            origin: self.instance_id.clone(),
            envelope,
        }
        .encode()?;

        match self.backbone.publish(&topic, frame).await {
            Ok(()) => {
                metrics::record_backbone_publish("success");
                Ok(local)
            }
            Err(e) => {
                metrics::record_backbone_publish("error");
                warn!(target: "relay.bridge", topic = %topic, error = %e, "Backbone publish failed");
                Err(e)
            }
        }
    }

    /// Handle one message from the backbone.
    pub async fn consume(&self, payload: &[u8]) -> ConsumeOutcome {
        let frame = match BackboneFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_backbone_consume("malformed");
                warn!(target: "relay.bridge", error = %e, "Dropping malformed backbone message");
                return ConsumeOutcome::Malformed;
            }
        };

        if frame.origin == self.instance_id {
            metrics::record_backbone_consume("skipped");
            return ConsumeOutcome::OwnOrigin;
        }

        let envelope = frame.envelope;
        let Some(hub) = self.registry.get(envelope.room_id()).await else {
            metrics::record_backbone_consume("skipped");
            return ConsumeOutcome::NoLocalRoom;
        };

        let payload = match envelope.to_json() {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                metrics::record_backbone_consume("malformed");
                warn!(target: "relay.bridge", error = %e, "Failed to re-encode envelope");
                return ConsumeOutcome::Malformed;
            }
        };

        let report = hub.broadcast(payload, None).await;
        metrics::record_backbone_consume("success");
        debug!(
            target: "relay.bridge",
            room_id = %envelope.room_id(),
            origin = %frame.origin,
            delivered = report.delivered,
            "Delivered backbone message"
        );
        ConsumeOutcome::Delivered(report)
    }

    fn open_subscription(&self, topic: String) -> Result<SubscriptionReady, BackboneError> {
        let handler = Arc::new(BridgeInbox {
            bridge: self.me.clone(),
        });
        let subscription = self.backbone.subscribe(&topic, handler)?;
        let ready = subscription.ready();
        self.lock_subscriptions().insert(topic, subscription);
        Ok(ready)
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RoomLifecycle for MessageBridge {
    fn room_opened(&self, room_id: &RoomId) {
        if self.topics.strategy() != TopicStrategy::PerRoom {
            return;
        }
        let topic = self.topics.room_topic(room_id);
        if let Err(e) = self.open_subscription(topic) {
            // Local delivery keeps working; cross-instance delivery for this
            // room is lost until it is reopened.
            error!(
                target: "relay.bridge",
                room_id = %room_id,
                error = %e,
                "Failed to subscribe to room topic"
            );
        }
    }

    fn room_closed(&self, room_id: &RoomId) {
        if self.topics.strategy() != TopicStrategy::PerRoom {
            return;
        }
        let topic = self.topics.room_topic(room_id);
        if self.lock_subscriptions().remove(&topic).is_some() {
            debug!(target: "relay.bridge", room_id = %room_id, "Room topic unsubscribed");
        }
    }
}
