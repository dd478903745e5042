//! Fan-out behavior of a single relay instance.
//!
//! Covers exclusion of the sender, independence of outbound queues, and the
//! guarantees that hold after a member leaves.

use chat_relay::bridge::InMemoryBackbone;
use chat_relay::hub::{
    CloseReason, Connection, ConnectionHub, ConnectionIdentity, ConnectionState, DuplicatePolicy,
};
use chat_relay::relay::RelayOptions;
use common::types::DeviceId;
use relay_test_utils::{
    connect_client, eventually, mock_transport, relay_with, relay_with_options, room,
    stalled_transport, user, wait_for_members, MockGate, MockPeer, MockReader, MockWriter,
    StalledBackbone,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn member(
    room_id: &str,
    user_id: &str,
    capacity: usize,
    parent: &CancellationToken,
) -> (Connection<MockReader, MockWriter>, MockPeer) {
    let (reader, writer, peer) = mock_transport();
    let identity = ConnectionIdentity {
        user_id: user(user_id),
        device_id: DeviceId::from("device-1"),
        room_id: room(room_id),
    };
    (Connection::new(identity, capacity, parent, reader, writer), peer)
}

fn three_member_gate() -> MockGate {
    MockGate::new()
        .member("r1", "u1")
        .member("r1", "u2")
        .member("r1", "u3")
        .member("r1", "u4")
}

// ============================================================================
// Hub-level broadcast
// ============================================================================

/// Broadcast excluding A reaches B and C, never A.
#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let parent = CancellationToken::new();
    let hub = ConnectionHub::new(room("r1"), DuplicatePolicy::Replace);
    let (a, _pa) = member("r1", "a", 8, &parent);
    let (b, _pb) = member("r1", "b", 8, &parent);
    let (c, _pc) = member("r1", "c", 8, &parent);
    for conn in [&a, &b, &c] {
        hub.register(conn.handle().clone()).await.unwrap();
    }

    let report = hub.broadcast(Arc::from("hello"), Some(&user("a"))).await;

    assert_eq!(report.delivered, 2);
    assert_eq!(a.handle().queued(), 0, "sender must not receive its own message");
    assert_eq!(b.handle().queued(), 1);
    assert_eq!(c.handle().queued(), 1);
}

/// Room r1: u1 saturated at capacity 2, u2 and u3 healthy. Broadcasting
/// "hello" excluding u1 leaves u1 untouched and reaches u2 and u3 once each.
#[tokio::test]
async fn test_saturated_member_does_not_block_others() {
    let parent = CancellationToken::new();
    let hub = ConnectionHub::new(room("r1"), DuplicatePolicy::Replace);
    let (u1, _p1) = member("r1", "u1", 2, &parent);
    let (u2, _p2) = member("r1", "u2", 8, &parent);
    let (u3, _p3) = member("r1", "u3", 8, &parent);
    for conn in [&u1, &u2, &u3] {
        hub.register(conn.handle().clone()).await.unwrap();
    }

    // Saturate u1.
    hub.broadcast(Arc::from("fill-1"), Some(&user("u2"))).await;
    hub.broadcast(Arc::from("fill-2"), Some(&user("u2"))).await;
    let overflow = hub.broadcast(Arc::from("fill-3"), Some(&user("u2"))).await;
    assert_eq!(overflow.dropped, 1, "u1 is full");
    assert_eq!(overflow.delivered, 1, "u3 still receives");
    assert_eq!(u1.handle().queued(), 2);

    let report = hub.broadcast(Arc::from("hello"), Some(&user("u1"))).await;

    assert_eq!(report.delivered, 2);
    assert_eq!(report.dropped, 0);
    assert_eq!(u1.handle().queued(), 2, "excluded member's queue is unchanged");
    assert_eq!(u2.handle().queued(), 1);
    assert_eq!(u3.handle().queued(), 4);
    assert_eq!(u1.handle().dropped(), 1);
}

/// Saturation drops for the slow member only; the broadcast still reports
/// delivery to everyone else.
#[tokio::test]
async fn test_full_queue_drops_for_that_member_only() {
    let parent = CancellationToken::new();
    let hub = ConnectionHub::new(room("r1"), DuplicatePolicy::Replace);
    let (slow, _ps) = member("r1", "slow", 1, &parent);
    let (c, _pc) = member("r1", "c", 8, &parent);
    let (d, _pd) = member("r1", "d", 8, &parent);
    for conn in [&slow, &c, &d] {
        hub.register(conn.handle().clone()).await.unwrap();
    }

    let first = hub.broadcast(Arc::from("one"), None).await;
    let second = hub.broadcast(Arc::from("two"), None).await;

    assert_eq!(first.delivered, 3);
    assert_eq!(second.delivered, 2);
    assert_eq!(second.dropped, 1);
    assert_eq!(c.handle().queued(), 2);
    assert_eq!(d.handle().queued(), 2);
}

/// After unregister nothing more is delivered, and a second close has no
/// further effect.
#[tokio::test]
async fn test_unregister_stops_delivery_and_close_is_idempotent() {
    let parent = CancellationToken::new();
    let hub = ConnectionHub::new(room("r1"), DuplicatePolicy::Replace);
    let (a, _pa) = member("r1", "a", 8, &parent);
    let (b, _pb) = member("r1", "b", 8, &parent);
    hub.register(a.handle().clone()).await.unwrap();
    hub.register(b.handle().clone()).await.unwrap();

    assert!(hub.unregister(b.handle()).await);
    let report = hub.broadcast(Arc::from("after"), None).await;

    assert_eq!(report.delivered, 1);
    assert_eq!(b.handle().queued(), 0);
    assert_ne!(b.handle().state(), ConnectionState::Open);

    assert!(!b.handle().close(CloseReason::Removed), "already closed");
    assert!(!hub.unregister(b.handle()).await, "already removed");
    assert_eq!(hub.len().await, 1);
}

// ============================================================================
// Relay-level fan-out
// ============================================================================

/// Frames from one member arrive at the others in send order, and never echo.
#[tokio::test]
async fn test_relay_fans_out_in_order() {
    let (gate, _mock) = three_member_gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let mut u1 = connect_client(&relay, "r1", "u1").await;
    let mut u2 = connect_client(&relay, "r1", "u2").await;
    let mut u3 = connect_client(&relay, "r1", "u3").await;

    for text in ["first", "second", "third"] {
        u1.peer.send_text(text);
    }

    for receiver in [&mut u2, &mut u3] {
        for expected in ["first", "second", "third"] {
            let frame = receiver.peer.recv_json().await.expect("frame expected");
            assert_eq!(frame["text"], expected);
            assert_eq!(frame["user_id"], "u1");
            assert_eq!(frame["room_id"], "r1");
        }
    }
    assert!(u1.peer.try_recv().is_none(), "no echo to the sender");
}

/// A stalled member does not hold up delivery to the rest of the room.
#[tokio::test]
async fn test_relay_stalled_member_does_not_block_room() {
    let (gate, _mock) = three_member_gate().into_access_gate();
    let mut options = RelayOptions::new("relay-a");
    options.queue_capacity = 2;
    let relay = relay_with_options(options, gate, InMemoryBackbone::new());

    let sender = connect_client(&relay, "r1", "u1").await;
    let mut healthy = connect_client(&relay, "r1", "u3").await;

    // u2 connects on a transport whose writes never complete.
    let admission = relay
        .admit(Some("u2:device-1"), &room("r1"))
        .await
        .unwrap();
    let (reader, writer, stalled) = stalled_transport();
    let served = Arc::clone(&relay);
    tokio::spawn(async move { served.serve(admission, reader, writer).await });
    assert!(wait_for_members(&relay, "r1", 3).await);

    for i in 0..10 {
        sender.peer.send_text(&format!("m{i}"));
        let frame = healthy.peer.recv_json().await.expect("healthy member keeps up");
        assert_eq!(frame["text"], format!("m{i}"));
    }

    let stalled_handle = relay
        .registry()
        .get(&room("r1"))
        .await
        .unwrap()
        .member(&user("u2"))
        .await
        .unwrap();
    // Every frame was either written, queued or dropped; nothing blocked.
    assert!(stalled.write_attempts() <= 1);
    assert_eq!(stalled_handle.queued(), 2);
    assert_eq!(
        stalled.write_attempts() + stalled_handle.queued() + stalled_handle.dropped() as usize,
        10
    );
}

/// A member that hangs up is removed from the room and the empty room is
/// reclaimed.
#[tokio::test]
async fn test_hang_up_unregisters_and_reclaims_room() {
    let (gate, _mock) = three_member_gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let a = connect_client(&relay, "r1", "u1").await;
    let b = connect_client(&relay, "r1", "u2").await;

    a.peer.hang_up();
    a.task.await.unwrap();
    assert!(a.peer.is_closed());
    assert!(wait_for_members(&relay, "r1", 1).await);

    b.peer.hang_up();
    b.task.await.unwrap();
    assert_eq!(relay.registry().room_count().await, 0);
}

/// Shutting the relay down closes every connection.
#[tokio::test]
async fn test_shutdown_closes_all_connections() {
    let (gate, _mock) = three_member_gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let a = connect_client(&relay, "r1", "u1").await;
    let b = connect_client(&relay, "r1", "u2").await;

    relay.shutdown();

    a.task.await.unwrap();
    b.task.await.unwrap();
    assert!(a.peer.is_closed());
    assert!(b.peer.is_closed());
    assert_eq!(relay.registry().connection_count(), 0);
    assert!(!relay.health().is_ready());
}

/// A publish that never returns must not pin the sender's connection open.
#[tokio::test]
async fn test_close_ends_connection_with_stalled_backbone() {
    let (gate, _mock) = three_member_gate().into_access_gate();
    let backbone = StalledBackbone::new();
    let relay = relay_with(gate, backbone.clone(), "relay-a");

    let alice = connect_client(&relay, "r1", "u1").await;
    let mut bob = connect_client(&relay, "r1", "u2").await;

    alice.peer.send_text("hello");
    let frame = bob.peer.recv_json().await.expect("local delivery precedes publish");
    assert_eq!(frame["text"], "hello");
    let stalled = &backbone;
    assert!(eventually(|| async move { stalled.publish_attempts() == 1 }).await);

    let handle = relay
        .registry()
        .get(&room("r1"))
        .await
        .unwrap()
        .member(&user("u1"))
        .await
        .unwrap();
    assert!(handle.close(CloseReason::Removed));

    tokio::time::timeout(Duration::from_secs(1), alice.task)
        .await
        .expect("connection ends despite the pending publish")
        .unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert!(!relay.registry().contains_user(&room("r1"), &user("u1")).await);
    assert!(wait_for_members(&relay, "r1", 1).await);
}
