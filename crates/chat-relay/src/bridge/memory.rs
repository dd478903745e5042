//! In-process backbone.
//!
//! Used for single-instance deployments (`RELAY_BACKBONE=memory`) and for
//! tests that run several relays in one process. Each subscriber gets its
//! own bounded queue; a full queue drops the message for that subscriber,
//! matching the at-most-once contract of a real pub/sub system.

use super::backbone::{Backbone, BackboneHandler, Subscription};
use crate::errors::BackboneError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct Subscriber {
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

struct Inner {
    capacity: usize,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

/// Cheaply cloneable in-memory pub/sub; clones share topics.
#[derive(Clone)]
pub struct InMemoryBackbone {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackbone {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackbone {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).map_or(0, |subs| {
            subs.iter().filter(|s| !s.cancel.is_cancelled()).count()
        })
    }
}

#[async_trait]
impl Backbone for InMemoryBackbone {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackboneError> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(subscribers) = topics.get_mut(topic) else {
            return Ok(());
        };

        subscribers.retain(|s| !s.cancel.is_cancelled() && !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.tx.try_send(payload.clone()).is_err() {
                warn!(target: "relay.bridge", topic = %topic, "Subscriber lagging, message dropped");
            }
        }
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BackboneHandler>,
    ) -> Result<Subscription, BackboneError> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.inner.capacity);
        let cancel = CancellationToken::new();

        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                tx,
                cancel: cancel.clone(),
            });

        let task_cancel = cancel.clone();
        let task_topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => break,
                    payload = rx.recv() => match payload {
                        Some(payload) => handler.on_message(&task_topic, payload).await,
                        None => break,
                    },
                }
            }
            debug!(target: "relay.bridge", topic = %task_topic, "In-memory subscription ended");
        });

        Ok(Subscription::new(topic, cancel))
    }
}
