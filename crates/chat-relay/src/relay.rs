//! Wires the gate, hubs and bridge into one service.
//!
//! Control flow for one session:
//!
//! 1. [`Relay::admit`] authenticates and authorizes the request and applies
//!    the duplicate policy, before any connection exists.
//! 2. The transport is upgraded and [`Relay::serve`] registers a new
//!    [`Connection`] and runs it.
//! 3. Every inbound frame becomes a [`MessageEnvelope`] handed to
//!    [`MessageBridge::publish`].
//! 4. When the connection ends it leaves its hub.

use crate::bridge::{Backbone, MessageBridge, MessageEnvelope, TopicScheme, TopicStrategy};
use crate::config::{Config, DEFAULT_MAX_FRAME_BYTES, DEFAULT_TOPIC_PREFIX};
use crate::errors::{AdmissionError, RelayError};
use crate::gate::{AccessGate, Admission};
use crate::hub::{
    Connection, ConnectionHandle, ConnectionIdentity, DuplicatePolicy, HubRegistry,
    InboundHandler, DEFAULT_OUTBOUND_QUEUE_CAPACITY,
};
use crate::observability::{metrics, HealthState};
use crate::transport::{FrameReader, FrameWriter};
use async_trait::async_trait;
use common::types::RoomId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for a [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub instance_id: String,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub topics: TopicScheme,
}

impl RelayOptions {
    /// Defaults for everything but the instance id.
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            duplicate_policy: DuplicatePolicy::default(),
            topics: TopicScheme::new(TopicStrategy::default(), DEFAULT_TOPIC_PREFIX),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            queue_capacity: config.outbound_queue_capacity,
            max_frame_bytes: config.max_frame_bytes,
            duplicate_policy: config.duplicate_policy,
            topics: TopicScheme::new(config.topic_strategy, config.topic_prefix.clone()),
        }
    }
}

pub struct Relay {
    options: RelayOptions,
    gate: AccessGate,
    registry: Arc<HubRegistry>,
    bridge: Arc<MessageBridge>,
    health: Arc<HealthState>,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(options: RelayOptions, gate: AccessGate, backbone: Arc<dyn Backbone>) -> Arc<Self> {
        let registry = Arc::new(HubRegistry::new(options.duplicate_policy));
        let bridge = MessageBridge::new(
            options.instance_id.clone(),
            Arc::clone(&registry),
            backbone,
            options.topics.clone(),
        );
        Arc::new(Self {
            options,
            gate,
            registry,
            bridge,
            health: Arc::new(HealthState::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the bridge and report ready once its backbone subscription is
    /// receiving.
    ///
    /// # Errors
    ///
    /// `RelayError::Backbone` if the backbone subscription fails.
    pub fn start(&self) -> Result<(), RelayError> {
        let ready = self.bridge.start()?;
        if ready.is_ready() {
            announce_ready(&self.health, &self.options.instance_id);
            return Ok(());
        }

        debug!(target: "relay.hub", "Waiting for backbone subscription");
        let health = Arc::clone(&self.health);
        let instance_id = self.options.instance_id.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {}
                subscribed = ready.wait() => {
                    if subscribed {
                        announce_ready(&health, &instance_id);
                    } else {
                        warn!(
                            target: "relay.hub",
                            "Backbone subscription ended before it was established"
                        );
                    }
                }
            }
        });
        Ok(())
    }

    /// Stop accepting traffic and tear down every connection.
    pub fn shutdown(&self) {
        self.health.begin_draining();
        self.shutdown.cancel();
        self.bridge.shutdown();
    }

    #[must_use]
    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HubRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn bridge(&self) -> &Arc<MessageBridge> {
        &self.bridge
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    /// Parent of every connection's close signal.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Admission checks for a connect request.
    ///
    /// # Errors
    ///
    /// Any [`AdmissionError`]; `Conflict` when the user is already connected
    /// to the room and the duplicate policy is `Reject`.
    pub async fn admit(
        &self,
        token: Option<&str>,
        room_id: &RoomId,
    ) -> Result<Admission, AdmissionError> {
        let result = self.check_admission(token, room_id).await;
        match &result {
            Ok(_) => metrics::record_admission("admitted"),
            Err(e) => {
                debug!(
                    target: "relay.gate",
                    room_id = %room_id,
                    outcome = e.outcome_label(),
                    "Admission refused"
                );
                metrics::record_admission(e.outcome_label());
            }
        }
        result
    }

    async fn check_admission(
        &self,
        token: Option<&str>,
        room_id: &RoomId,
    ) -> Result<Admission, AdmissionError> {
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::Internal("relay is shutting down".to_string()));
        }

        let admission = self.gate.admit(token, room_id).await?;

        if self.options.duplicate_policy == DuplicatePolicy::Reject
            && self
                .registry
                .contains_user(room_id, &admission.identity.user_id)
                .await
        {
            return Err(AdmissionError::Conflict);
        }

        Ok(admission)
    }

    /// Register and run a connection for an admitted request.
    ///
    /// Returns when the connection has closed.
    pub async fn serve<R, W>(self: &Arc<Self>, admission: Admission, reader: R, writer: W)
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let identity = ConnectionIdentity {
            user_id: admission.identity.user_id,
            device_id: admission.identity.device_id,
            room_id: admission.room_id,
        };
        let connection = Connection::new(
            identity,
            self.options.queue_capacity,
            &self.shutdown,
            reader,
            writer,
        );

        match self.registry.join(connection.handle().clone()).await {
            Ok(_) => {
                let handler = Arc::clone(self) as Arc<dyn InboundHandler>;
                connection.run(handler).await;
            }
            Err(error) => {
                // Lost a race with a concurrent connect under the reject policy.
                info!(
                    target: "relay.hub",
                    room_id = %connection.handle().room_id(),
                    user_id = %connection.handle().user_id(),
                    error = %error,
                    "Duplicate connection closed after upgrade"
                );
                connection.discard().await;
            }
        }
    }

    fn accepts(&self, sender: &ConnectionHandle, frame: &str) -> bool {
        if frame.trim().is_empty() {
            debug!(
                target: "relay.connection",
                connection_id = %sender.id(),
                "Dropping empty frame"
            );
            return false;
        }
        if frame.len() > self.options.max_frame_bytes {
            debug!(
                target: "relay.connection",
                connection_id = %sender.id(),
                frame_bytes = frame.len(),
                max_frame_bytes = self.options.max_frame_bytes,
                "Dropping oversized frame"
            );
            return false;
        }
        true
    }
}

#[async_trait]
impl InboundHandler for Relay {
    async fn on_frame(&self, sender: &ConnectionHandle, frame: String) {
        if !self.accepts(sender, &frame) {
            return;
        }

        let envelope = MessageEnvelope::stamped_now(
            sender.room_id().clone(),
            sender.user_id().clone(),
            sender.device_id().clone(),
            frame,
        );

        // Backbone failures cost this one message at most; the connection stays up.
        if let Err(e) = self.bridge.publish(envelope).await {
            warn!(
                target: "relay.bridge",
                connection_id = %sender.id(),
                room_id = %sender.room_id(),
                error = %e,
                "Message not distributed to other instances"
            );
        }
    }

    async fn on_closed(&self, connection: &ConnectionHandle) {
        self.registry.leave(connection).await;
    }
}

fn announce_ready(health: &HealthState, instance_id: &str) {
    health.mark_backbone_ready();
    info!(target: "relay.hub", instance_id = %instance_id, "Relay ready");
}
