//! Admission: credentials, membership and the duplicate connection policy.

use chat_relay::bridge::InMemoryBackbone;
use chat_relay::errors::AdmissionError;
use chat_relay::gate::{AccessGate, JwtTokenDecoder};
use chat_relay::hub::{ConnectionState, DuplicatePolicy};
use chat_relay::relay::RelayOptions;
use common::jwt::DEFAULT_CLOCK_SKEW;
use common::secret::SecretString;
use relay_test_utils::{
    connect_client, connect_device, mint_user_token, relay_with, relay_with_options, room, user,
    MockGate, TEST_JWT_SECRET,
};
use std::sync::Arc;

fn gate() -> MockGate {
    MockGate::new()
        .member("r1", "alice")
        .member("r1", "bob")
        .room("empty-room")
}

// ============================================================================
// Credential and membership checks
// ============================================================================

/// A syntactically invalid token is refused before any lookup, and nothing
/// is allocated for it.
#[tokio::test]
async fn test_invalid_token_rejected_without_allocation() {
    let (gate, mock) = gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let result = relay.admit(Some("not-a-token"), &room("r1")).await;

    assert!(matches!(result, Err(AdmissionError::Unauthorized)));
    assert_eq!(mock.decode_calls(), 1);
    assert_eq!(mock.lookup_calls(), 0, "membership never consulted");
    assert_eq!(relay.registry().room_count().await, 0);
    assert_eq!(relay.registry().connection_count(), 0);
}

#[tokio::test]
async fn test_missing_token_rejected_without_decoding() {
    let (gate, mock) = gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let result = relay.admit(None, &room("r1")).await;

    assert!(matches!(result, Err(AdmissionError::Unauthorized)));
    assert_eq!(mock.decode_calls(), 0);
    assert_eq!(mock.lookup_calls(), 0);
}

#[tokio::test]
async fn test_membership_outcomes() {
    let (gate, _mock) = gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let admitted = relay.admit(Some("alice:phone"), &room("r1")).await.unwrap();
    assert_eq!(admitted.identity.user_id, user("alice"));
    assert_eq!(admitted.room_id, room("r1"));

    assert!(matches!(
        relay.admit(Some("mallory:phone"), &room("r1")).await,
        Err(AdmissionError::Forbidden)
    ));
    assert!(matches!(
        relay.admit(Some("alice:phone"), &room("empty-room")).await,
        Err(AdmissionError::Forbidden)
    ));
    assert!(matches!(
        relay.admit(Some("alice:phone"), &room("no-such-room")).await,
        Err(AdmissionError::NotFound)
    ));
}

#[tokio::test]
async fn test_directory_failure_is_internal_error() {
    let (gate, _mock) = gate().broken().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let result = relay.admit(Some("alice:phone"), &room("r1")).await;

    let err = result.unwrap_err();
    assert!(matches!(err, AdmissionError::Internal(_)));
    assert_eq!(err.status_code(), 500);
}

#[tokio::test]
async fn test_admission_refused_while_shutting_down() {
    let (gate, mock) = gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    relay.shutdown();
    let result = relay.admit(Some("alice:phone"), &room("r1")).await;

    assert!(matches!(result, Err(AdmissionError::Internal(_))));
    assert_eq!(mock.decode_calls(), 0);
}

// ============================================================================
// Real token decoder
// ============================================================================

fn jwt_gate() -> AccessGate {
    let directory = Arc::new(gate());
    let decoder = Arc::new(JwtTokenDecoder::new(
        SecretString::from(TEST_JWT_SECRET),
        DEFAULT_CLOCK_SKEW,
    ));
    AccessGate::new(decoder, directory)
}

#[tokio::test]
async fn test_signed_token_admitted() {
    let relay = relay_with(jwt_gate(), InMemoryBackbone::new(), "relay-a");
    let token = mint_user_token(TEST_JWT_SECRET, "bob", "tablet", 600);

    let admission = relay.admit(Some(&token), &room("r1")).await.unwrap();

    assert_eq!(admission.identity.user_id, user("bob"));
    assert_eq!(admission.identity.device_id.as_str(), "tablet");
}

#[tokio::test]
async fn test_expired_or_foreign_token_rejected() {
    let relay = relay_with(jwt_gate(), InMemoryBackbone::new(), "relay-a");

    let expired = mint_user_token(TEST_JWT_SECRET, "bob", "tablet", -60);
    assert!(matches!(
        relay.admit(Some(&expired), &room("r1")).await,
        Err(AdmissionError::Unauthorized)
    ));

    let foreign = mint_user_token("some-other-secret-some-other-secret", "bob", "tablet", 600);
    assert!(matches!(
        relay.admit(Some(&foreign), &room("r1")).await,
        Err(AdmissionError::Unauthorized)
    ));
}

// ============================================================================
// Duplicate connection policy
// ============================================================================

/// Under `Replace` a second connection for the same user takes over and the
/// first one is closed.
#[tokio::test]
async fn test_replace_policy_closes_previous_connection() {
    let (gate, _mock) = gate().into_access_gate();
    let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");

    let first = connect_device(&relay, "r1", "alice", "laptop").await;
    let first_handle = relay
        .registry()
        .get(&room("r1"))
        .await
        .unwrap()
        .member(&user("alice"))
        .await
        .unwrap();

    let mut second = connect_device(&relay, "r1", "alice", "phone").await;
    first.task.await.unwrap();

    assert!(first.peer.is_closed());
    assert_eq!(first_handle.state(), ConnectionState::Closed);
    assert_eq!(relay.registry().connection_count(), 1);

    // The late unregister of the first connection must not evict the second.
    let bob = connect_client(&relay, "r1", "bob").await;
    bob.peer.send_text("still there?");
    let frame = second.peer.recv_json().await.expect("replacement receives");
    assert_eq!(frame["text"], "still there?");
}

/// Under `Reject` a second connection is refused with 409 until the first
/// one leaves.
#[tokio::test]
async fn test_reject_policy_refuses_second_connection() {
    let (gate, _mock) = gate().into_access_gate();
    let mut options = RelayOptions::new("relay-a");
    options.duplicate_policy = DuplicatePolicy::Reject;
    let relay = relay_with_options(options, gate, InMemoryBackbone::new());

    let first = connect_device(&relay, "r1", "alice", "laptop").await;

    let err = relay
        .admit(Some("alice:phone"), &room("r1"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::Conflict));
    assert_eq!(err.status_code(), 409);

    first.peer.hang_up();
    first.task.await.unwrap();

    let second = relay.admit(Some("alice:phone"), &room("r1")).await;
    assert!(second.is_ok(), "admitted once the first connection is gone");
}

/// Two admissions that both pass the duplicate check race to register; the
/// loser is closed without ever joining the room.
#[tokio::test]
async fn test_reject_policy_race_discards_loser() {
    let (gate, _mock) = gate().into_access_gate();
    let mut options = RelayOptions::new("relay-a");
    options.duplicate_policy = DuplicatePolicy::Reject;
    let relay = relay_with_options(options, gate, InMemoryBackbone::new());

    let late = relay.admit(Some("alice:phone"), &room("r1")).await.unwrap();
    let _winner = connect_device(&relay, "r1", "alice", "laptop").await;

    let (reader, writer, peer) = relay_test_utils::mock_transport();
    relay.serve(late, reader, writer).await;

    assert!(peer.is_closed());
    let hub = relay.registry().get(&room("r1")).await.unwrap();
    assert_eq!(
        hub.member(&user("alice")).await.unwrap().device_id().as_str(),
        "laptop"
    );
}
