//! Identifiers, tokens and wiring helpers shared by the integration tests.

use crate::mock_gate::mock_token;
use crate::mock_transport::{mock_transport, MockPeer};
use chat_relay::bridge::Backbone;
use chat_relay::gate::AccessGate;
use chat_relay::relay::{Relay, RelayOptions};
use common::jwt::UserClaims;
use common::types::{RoomId, UserId};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Secret used by tests that exercise the real JWT decoder.
pub const TEST_JWT_SECRET: &str = "relay-test-secret-relay-test-secret";

pub fn room(id: &str) -> RoomId {
    RoomId::from(id)
}

pub fn user(id: &str) -> UserId {
    UserId::from(id)
}

/// Mint an HS256 user token that expires `ttl_secs` from now.
///
/// A negative `ttl_secs` produces an already expired token.
pub fn mint_user_token(secret: &str, sub: &str, device_id: &str, ttl_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = UserClaims::new(sub.to_string(), device_id.to_string(), now + ttl_secs, now);
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding should not fail")
}

/// Build and start a relay with default options.
pub fn relay_with(gate: AccessGate, backbone: impl Backbone, instance_id: &str) -> Arc<Relay> {
    relay_with_options(RelayOptions::new(instance_id), gate, backbone)
}

/// Build and start a relay with explicit options.
pub fn relay_with_options(
    options: RelayOptions,
    gate: AccessGate,
    backbone: impl Backbone,
) -> Arc<Relay> {
    let relay = Relay::new(options, gate, Arc::new(backbone));
    relay.start().expect("relay should start");
    relay
}

/// Poll `check` every 10ms until it returns true, giving up after 2s.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `room_id` on `relay` holds exactly `count` connections.
pub async fn wait_for_members(relay: &Arc<Relay>, room_id: &str, count: usize) -> bool {
    let room_id = room(room_id);
    eventually(|| {
        let relay = Arc::clone(relay);
        let room_id = room_id.clone();
        async move {
            match relay.registry().get(&room_id).await {
                Some(hub) => hub.len().await == count,
                None => count == 0,
            }
        }
    })
    .await
}

/// A client connected through a mock transport.
pub struct TestClient {
    pub peer: MockPeer,
    pub task: JoinHandle<()>,
}

/// Admit `user_id` into `room_id` with a mock token and serve it on a mock
/// transport. Returns once the connection is registered.
///
/// Panics if admission is refused.
pub async fn connect_client(relay: &Arc<Relay>, room_id: &str, user_id: &str) -> TestClient {
    connect_device(relay, room_id, user_id, "device-1").await
}

pub async fn connect_device(
    relay: &Arc<Relay>,
    room_id: &str,
    user_id: &str,
    device_id: &str,
) -> TestClient {
    let token = mock_token(user_id, device_id);
    let admission = relay
        .admit(Some(&token), &room(room_id))
        .await
        .unwrap_or_else(|e| panic!("{user_id} should be admitted to {room_id}: {e}"));

    let (reader, writer, peer) = mock_transport();
    let served = Arc::clone(relay);
    let task = tokio::spawn(async move { served.serve(admission, reader, writer).await });

    let room_id = room(room_id);
    let user_id = user(user_id);
    let registered = eventually(|| {
        let relay = Arc::clone(relay);
        let room_id = room_id.clone();
        let user_id = user_id.clone();
        async move {
            match relay.registry().get(&room_id).await {
                Some(hub) => hub
                    .member(&user_id)
                    .await
                    .is_some_and(|handle| handle.device_id().as_str() == device_id),
                None => false,
            }
        }
    })
    .await;
    assert!(registered, "{user_id} never registered in {room_id}");

    TestClient { peer, task }
}
