//! Delivery across relay instances sharing one backbone.

use chat_relay::bridge::{
    BackboneFrame, ConsumeOutcome, InMemoryBackbone, MessageEnvelope, TopicScheme, TopicStrategy,
};
use chat_relay::relay::{Relay, RelayOptions};
use common::types::DeviceId;
use relay_test_utils::{
    connect_client, eventually, relay_with_options, room, user, FlakyBackbone, MockGate,
    RecordingBackbone, SlowSubscribeBackbone,
};
use std::sync::Arc;
use std::time::Duration;

fn gate() -> MockGate {
    MockGate::new()
        .member("r1", "alice")
        .member("r1", "bob")
        .member("r1", "carol")
        .member("r2", "dave")
}

fn options(instance_id: &str, strategy: TopicStrategy) -> RelayOptions {
    let mut options = RelayOptions::new(instance_id);
    options.topics = TopicScheme::new(strategy, "chat");
    options
}

fn pair(backbone: &InMemoryBackbone, strategy: TopicStrategy) -> (Arc<Relay>, Arc<Relay>) {
    let (gate_a, _) = gate().into_access_gate();
    let (gate_b, _) = gate().into_access_gate();
    (
        relay_with_options(options("relay-a", strategy), gate_a, backbone.clone()),
        relay_with_options(options("relay-b", strategy), gate_b, backbone.clone()),
    )
}

async fn assert_cross_instance_delivery(strategy: TopicStrategy) {
    let backbone = InMemoryBackbone::new();
    let (relay_a, relay_b) = pair(&backbone, strategy);

    let mut alice = connect_client(&relay_a, "r1", "alice").await;
    let mut carol = connect_client(&relay_a, "r1", "carol").await;
    let mut bob = connect_client(&relay_b, "r1", "bob").await;

    alice.peer.send_text("hi from a");

    let remote = bob.peer.recv_json().await.expect("bob receives across instances");
    assert_eq!(remote["text"], "hi from a");
    assert_eq!(remote["user_id"], "alice");

    let local = carol.peer.recv_json().await.expect("carol receives locally");
    assert_eq!(local["text"], "hi from a");

    // Give the backbone round trip a chance to produce duplicates.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.peer.try_recv().is_none(), "sender never gets its own message");
    assert!(carol.peer.try_recv().is_none(), "no duplicate via the backbone");
    assert!(bob.peer.try_recv().is_none(), "exactly once across instances");
}

#[tokio::test]
async fn test_cross_instance_delivery_per_room_topics() {
    assert_cross_instance_delivery(TopicStrategy::PerRoom).await;
}

#[tokio::test]
async fn test_cross_instance_delivery_shared_topic() {
    assert_cross_instance_delivery(TopicStrategy::Shared).await;
}

/// Under the shared topic every instance sees every room's traffic and
/// ignores rooms it has no members in.
#[tokio::test]
async fn test_shared_topic_ignores_rooms_without_local_members() {
    let backbone = InMemoryBackbone::new();
    let (relay_a, relay_b) = pair(&backbone, TopicStrategy::Shared);

    let dave = connect_client(&relay_a, "r2", "dave").await;
    let mut bob = connect_client(&relay_b, "r1", "bob").await;

    dave.peer.send_text("only r2");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(bob.peer.try_recv().is_none());
    assert!(relay_b.registry().get(&room("r2")).await.is_none());
}

/// Per-room subscriptions follow the room: opened with the first local
/// member, cancelled with the last.
#[tokio::test]
async fn test_per_room_subscription_follows_room_lifetime() {
    let backbone = InMemoryBackbone::new();
    let (relay_a, _relay_b) = pair(&backbone, TopicStrategy::PerRoom);
    let topic = "chat:room:r1";

    assert_eq!(backbone.subscriber_count(topic), 0);

    let alice = connect_client(&relay_a, "r1", "alice").await;
    assert_eq!(backbone.subscriber_count(topic), 1);
    assert_eq!(relay_a.bridge().subscribed_topics(), vec![topic.to_string()]);

    alice.peer.hang_up();
    alice.task.await.unwrap();

    let backbone = &backbone;
    assert!(eventually(|| async move { backbone.subscriber_count(topic) == 0 }).await);
    assert!(relay_a.bridge().subscribed_topics().is_empty());
}

#[tokio::test]
async fn test_publish_uses_topic_for_strategy() {
    for (strategy, expected) in [
        (TopicStrategy::PerRoom, "chat:room:r1"),
        (TopicStrategy::Shared, "chat:messages"),
    ] {
        let backbone = RecordingBackbone::new();
        let (gate, _) = gate().into_access_gate();
        let relay = relay_with_options(options("relay-a", strategy), gate, backbone.clone());

        let alice = connect_client(&relay, "r1", "alice").await;
        alice.peer.send_text("hello");

        let recorded = &backbone;
        assert!(eventually(|| async move { !recorded.published().is_empty() }).await);
        assert_eq!(backbone.topics(), vec![expected.to_string()]);

        let (_, payload) = backbone.published().remove(0);
        let frame = BackboneFrame::decode(&payload).unwrap();
        assert_eq!(frame.origin, "relay-a");
        assert_eq!(frame.envelope.text(), "hello");
        assert_eq!(frame.envelope.device_id(), &DeviceId::from("device-1"));
    }
}

/// A backbone outage costs cross-instance delivery only; local members still
/// receive and the sender stays connected.
#[tokio::test]
async fn test_backbone_failure_keeps_local_delivery() {
    let backbone = FlakyBackbone::new();
    backbone.set_failing(true);
    let (gate, _) = gate().into_access_gate();
    let relay = relay_with_options(
        options("relay-a", TopicStrategy::PerRoom),
        gate,
        backbone.clone(),
    );

    let alice = connect_client(&relay, "r1", "alice").await;
    let mut bob = connect_client(&relay, "r1", "bob").await;

    alice.peer.send_text("during outage");
    let frame = bob.peer.recv_json().await.expect("local delivery survives");
    assert_eq!(frame["text"], "during outage");
    let flaky = &backbone;
    assert!(eventually(|| async move { flaky.publish_attempts() == 1 }).await);

    backbone.set_failing(false);
    alice.peer.send_text("after recovery");
    let frame = bob.peer.recv_json().await.expect("still connected");
    assert_eq!(frame["text"], "after recovery");
    assert!(relay.registry().contains_user(&room("r1"), &user("alice")).await);
}

#[tokio::test]
async fn test_consume_outcomes() {
    let backbone = InMemoryBackbone::new();
    let (relay_a, _relay_b) = pair(&backbone, TopicStrategy::Shared);
    let _alice = connect_client(&relay_a, "r1", "alice").await;

    let envelope = |room_id: &str| {
        MessageEnvelope::new(
            room(room_id),
            user("bob"),
            DeviceId::from("phone"),
            "hey".to_string(),
            1_718_000_000_000,
        )
    };
    let frame = |origin: &str, room_id: &str| {
        BackboneFrame {
            origin: origin.to_string(),
            envelope: envelope(room_id),
        }
        .encode()
        .unwrap()
    };

    let bridge = relay_a.bridge();
    assert!(matches!(
        bridge.consume(&frame("relay-b", "r1")).await,
        ConsumeOutcome::Delivered(report) if report.delivered == 1
    ));
    assert!(matches!(
        bridge.consume(&frame("relay-a", "r1")).await,
        ConsumeOutcome::OwnOrigin
    ));
    assert!(matches!(
        bridge.consume(&frame("relay-b", "elsewhere")).await,
        ConsumeOutcome::NoLocalRoom
    ));
    assert!(matches!(
        bridge.consume(b"{not json").await,
        ConsumeOutcome::Malformed
    ));
}

/// The relay only reports ready once the shared subscription is receiving.
#[tokio::test]
async fn test_ready_waits_for_shared_subscription() {
    let backbone = SlowSubscribeBackbone::new();
    let (gate, _) = gate().into_access_gate();
    let relay = relay_with_options(
        options("relay-a", TopicStrategy::Shared),
        gate,
        backbone.clone(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!relay.health().is_ready());

    backbone.complete_subscriptions();
    let relay = &relay;
    assert!(eventually(|| async move { relay.health().is_ready() }).await);
}

#[tokio::test(start_paused = true)]
async fn test_never_ready_when_shared_subscription_fails() {
    let backbone = SlowSubscribeBackbone::new();
    let (gate, _) = gate().into_access_gate();
    let relay = relay_with_options(
        options("relay-a", TopicStrategy::Shared),
        gate,
        backbone.clone(),
    );

    backbone.abandon_subscriptions();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!relay.health().is_ready());
}

#[tokio::test]
async fn test_per_room_relay_ready_at_start() {
    let (gate, _) = gate().into_access_gate();
    let relay = relay_with_options(
        options("relay-a", TopicStrategy::PerRoom),
        gate,
        SlowSubscribeBackbone::new(),
    );
    assert!(relay.health().is_ready());
}
