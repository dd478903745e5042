//! Backbones for failure-path tests.

use async_trait::async_trait;
use chat_relay::bridge::{
    Backbone, BackboneHandler, InMemoryBackbone, ReadySignal, Subscription, SubscriptionReady,
};
use chat_relay::errors::BackboneError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory backbone whose publishes can be switched to fail.
///
/// Subscriptions always succeed, so consume-side delivery keeps working.
#[derive(Clone, Default)]
pub struct FlakyBackbone {
    inner: InMemoryBackbone,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl FlakyBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backbone for FlakyBackbone {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackboneError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackboneError::Publish("backbone unavailable".to_string()));
        }
        self.inner.publish(topic, payload).await
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BackboneHandler>,
    ) -> Result<Subscription, BackboneError> {
        self.inner.subscribe(topic, handler)
    }
}

/// Backbone that records every publish and delivers nothing.
#[derive(Clone, Default)]
pub struct RecordingBackbone {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(topic, payload)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Topics in publish order.
    pub fn topics(&self) -> Vec<String> {
        self.published().into_iter().map(|(topic, _)| topic).collect()
    }
}

#[async_trait]
impl Backbone for RecordingBackbone {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackboneError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        _handler: Arc<dyn BackboneHandler>,
    ) -> Result<Subscription, BackboneError> {
        Ok(Subscription::new(topic, Default::default()))
    }
}

/// Backbone whose publishes never complete, like a partitioned Redis.
#[derive(Clone, Default)]
pub struct StalledBackbone {
    inner: InMemoryBackbone,
    attempts: Arc<AtomicUsize>,
}

impl StalledBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backbone for StalledBackbone {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BackboneError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BackboneHandler>,
    ) -> Result<Subscription, BackboneError> {
        self.inner.subscribe(topic, handler)
    }
}

/// In-memory backbone whose subscriptions only report ready once the test
/// says so, like a Redis that accepts connections but has not yet
/// confirmed `SUBSCRIBE`.
#[derive(Clone, Default)]
pub struct SlowSubscribeBackbone {
    inner: InMemoryBackbone,
    pending: Arc<Mutex<Vec<ReadySignal>>>,
}

impl SlowSubscribeBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every subscription opened so far as receiving.
    pub fn complete_subscriptions(&self) {
        for signal in self.pending.lock().unwrap().drain(..) {
            signal.mark();
        }
    }

    /// End every pending subscription without it coming up.
    pub fn abandon_subscriptions(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[async_trait]
impl Backbone for SlowSubscribeBackbone {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackboneError> {
        self.inner.publish(topic, payload).await
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BackboneHandler>,
    ) -> Result<Subscription, BackboneError> {
        let (signal, ready) = SubscriptionReady::pending();
        self.pending.lock().unwrap().push(signal);
        Ok(self.inner.subscribe(topic, handler)?.with_ready(ready))
    }
}
