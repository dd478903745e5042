//! End-to-end tests over a real listener and WebSocket client.

use chat_relay::bridge::InMemoryBackbone;
use chat_relay::gate::{AccessGate, JwtTokenDecoder};
use common::jwt::DEFAULT_CLOCK_SKEW;
use common::secret::SecretString;
use futures::{SinkExt, StreamExt};
use relay_test_utils::{
    mint_user_token, relay_with, wait_for_members, MockGate, TestRelayServer, TEST_JWT_SECRET,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(instance_id: &str, backbone: InMemoryBackbone) -> TestRelayServer {
    let directory = Arc::new(
        MockGate::new()
            .member("r1", "alice")
            .member("r1", "bob")
            .room("r2"),
    );
    let decoder = Arc::new(JwtTokenDecoder::new(
        SecretString::from(TEST_JWT_SECRET),
        DEFAULT_CLOCK_SKEW,
    ));
    let relay = relay_with(AccessGate::new(decoder, directory), backbone, instance_id);
    TestRelayServer::spawn(relay)
        .await
        .expect("test server should start")
}

fn token(user: &str) -> String {
    mint_user_token(TEST_JWT_SECRET, user, "browser", 600)
}

async fn next_text(client: &mut Client) -> Option<String> {
    let read = async {
        while let Some(message) = client.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .ok()
        .flatten()
}

fn rejected_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {other}"),
    }
}

#[tokio::test]
async fn test_websocket_round_trip() -> Result<(), anyhow::Error> {
    let server = spawn_server("relay-a", InMemoryBackbone::new()).await;

    let (mut alice, _) = connect_async(server.ws_url("r1", &token("alice"))).await?;
    let (mut bob, _) = connect_async(server.ws_url("r1", &token("bob"))).await?;
    assert!(wait_for_members(server.relay(), "r1", 2).await);

    alice.send(Message::Text("hello bob".to_string())).await?;

    let received = next_text(&mut bob).await.expect("bob should receive");
    let envelope: serde_json::Value = serde_json::from_str(&received)?;
    assert_eq!(envelope["room_id"], "r1");
    assert_eq!(envelope["user_id"], "alice");
    assert_eq!(envelope["device_id"], "browser");
    assert_eq!(envelope["text"], "hello bob");
    assert!(envelope["timestamp"].as_i64().is_some());

    Ok(())
}

#[tokio::test]
async fn test_bearer_header_accepted() -> Result<(), anyhow::Error> {
    let server = spawn_server("relay-a", InMemoryBackbone::new()).await;

    let mut request = server.ws_url_anonymous("r1").into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", token("alice")).parse()?);

    let (_alice, _) = connect_async(request).await?;
    assert!(wait_for_members(server.relay(), "r1", 1).await);

    Ok(())
}

#[tokio::test]
async fn test_rejections_map_to_http_status() {
    let server = spawn_server("relay-a", InMemoryBackbone::new()).await;

    let missing = connect_async(server.ws_url_anonymous("r1")).await.unwrap_err();
    assert_eq!(rejected_status(missing), 401);

    let garbage = connect_async(server.ws_url("r1", "garbage")).await.unwrap_err();
    assert_eq!(rejected_status(garbage), 401);

    let forbidden = connect_async(server.ws_url("r2", &token("alice")))
        .await
        .unwrap_err();
    assert_eq!(rejected_status(forbidden), 403);

    let not_found = connect_async(server.ws_url("nowhere", &token("alice")))
        .await
        .unwrap_err();
    assert_eq!(rejected_status(not_found), 404);

    assert_eq!(server.relay().registry().connection_count(), 0);
}

#[tokio::test]
async fn test_client_close_leaves_room() -> Result<(), anyhow::Error> {
    let server = spawn_server("relay-a", InMemoryBackbone::new()).await;

    let (mut alice, _) = connect_async(server.ws_url("r1", &token("alice"))).await?;
    assert!(wait_for_members(server.relay(), "r1", 1).await);

    alice.close(None).await?;

    assert!(wait_for_members(server.relay(), "r1", 0).await);
    assert_eq!(server.relay().registry().room_count().await, 0);
    Ok(())
}

/// Two servers on one backbone behave like one room.
#[tokio::test]
async fn test_websocket_across_instances() -> Result<(), anyhow::Error> {
    let backbone = InMemoryBackbone::new();
    let server_a = spawn_server("relay-a", backbone.clone()).await;
    let server_b = spawn_server("relay-b", backbone).await;

    let (mut alice, _) = connect_async(server_a.ws_url("r1", &token("alice"))).await?;
    let (mut bob, _) = connect_async(server_b.ws_url("r1", &token("bob"))).await?;
    assert!(wait_for_members(server_a.relay(), "r1", 1).await);
    assert!(wait_for_members(server_b.relay(), "r1", 1).await);

    bob.send(Message::Text("over the backbone".to_string())).await?;

    let received = next_text(&mut alice).await.expect("alice should receive");
    let envelope: serde_json::Value = serde_json::from_str(&received)?;
    assert_eq!(envelope["user_id"], "bob");
    assert_eq!(envelope["text"], "over the backbone");

    Ok(())
}
