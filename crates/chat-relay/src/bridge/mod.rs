//! Cross-instance message distribution.
//!
//! - [`envelope`] - `MessageEnvelope` and backbone framing
//! - [`backbone`] - `Backbone` trait, subscriptions, topic naming
//! - [`memory`] - in-process backbone
//! - [`redis`] - Redis pub/sub backbone
//! - [`message_bridge`] - `MessageBridge`, publish and consume

pub mod backbone;
pub mod envelope;
pub mod memory;
pub mod message_bridge;
pub mod redis;

pub use backbone::{
    Backbone, BackboneHandler, ReadySignal, Subscription, SubscriptionReady, TopicScheme,
    TopicStrategy,
};
pub use envelope::{BackboneFrame, MessageEnvelope};
pub use memory::InMemoryBackbone;
pub use message_bridge::{ConsumeOutcome, MessageBridge};
pub use redis::RedisBackbone;
