//! Redis pub/sub backbone.
//!
//! Publishing goes through one multiplexed connection, cloned per call.
//! Every subscription owns a dedicated pub/sub connection in its own task
//! and reconnects with capped exponential backoff if the connection drops.
//! Messages published while a subscription is reconnecting are lost, which
//! is within the at-most-once contract.
//!
//! A subscription reports ready after its first successful `SUBSCRIBE`.

use super::backbone::{Backbone, BackboneHandler, ReadySignal, Subscription, SubscriptionReady};
use crate::errors::BackboneError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Redis-backed [`Backbone`]. Cheap to clone.
#[derive(Clone)]
pub struct RedisBackbone {
    client: Client,
    publisher: MultiplexedConnection,
}

impl RedisBackbone {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// `BackboneError::Subscribe` if the URL is invalid or Redis is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, BackboneError> {
        // Do not log the URL: it may carry credentials.
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "relay.bridge.redis", error = %e, "Failed to open Redis client");
            BackboneError::Subscribe(format!("Failed to open Redis client: {e}"))
        })?;

        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "relay.bridge.redis", error = %e, "Failed to connect to Redis");
                BackboneError::Subscribe(format!("Failed to connect to Redis: {e}"))
            })?;

        info!(target: "relay.bridge.redis", "Connected to Redis backbone");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackboneError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| BackboneError::Publish(e.to_string()))?;
        debug!(target: "relay.bridge.redis", topic = %topic, receivers, "Published");
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BackboneHandler>,
    ) -> Result<Subscription, BackboneError> {
        let cancel = CancellationToken::new();
        let (signal, ready) = SubscriptionReady::pending();
        tokio::spawn(subscription_task(
            self.client.clone(),
            topic.to_string(),
            handler,
            signal,
            cancel.clone(),
        ));
        Ok(Subscription::new(topic, cancel).with_ready(ready))
    }

    async fn health_check(&self) -> Result<(), BackboneError> {
        let mut conn = self.publisher.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BackboneError::Publish(format!("Redis ping failed: {e}")))?;
        Ok(())
    }
}

#[instrument(skip_all, name = "relay.bridge.redis.subscription", fields(topic = %topic))]
async fn subscription_task(
    client: Client,
    topic: String,
    handler: Arc<dyn BackboneHandler>,
    ready: ReadySignal,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let session = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            session = run_session(&client, &topic, handler.as_ref(), &ready, &cancel) => session,
        };

        match session {
            // Cancelled while receiving.
            Ok(()) => break,
            Err(e) => {
                warn!(
                    target: "relay.bridge.redis",
                    topic = %topic,
                    error = %e,
                    retry_in_secs = backoff.as_secs(),
                    "Subscription lost, reconnecting"
                );
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    debug!(target: "relay.bridge.redis", topic = %topic, "Subscription ended");
}

/// One pub/sub connection's lifetime. Returns `Ok` only when cancelled.
async fn run_session(
    client: &Client,
    topic: &str,
    handler: &dyn BackboneHandler,
    ready: &ReadySignal,
    cancel: &CancellationToken,
) -> Result<(), BackboneError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BackboneError::Subscribe(e.to_string()))?;
    pubsub
        .subscribe(topic)
        .await
        .map_err(|e| BackboneError::Subscribe(e.to_string()))?;

    ready.mark();
    debug!(target: "relay.bridge.redis", topic = %topic, "Subscribed");

    let mut messages = pubsub.on_message();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            next = messages.next() => next,
        };
        let Some(msg) = next else {
            return Err(BackboneError::Subscribe("pub/sub stream closed".to_string()));
        };
        handler
            .on_message(topic, msg.get_payload_bytes().to_vec())
            .await;
    }
}
