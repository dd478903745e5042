//! axum WebSocket adapter and the `GET /rooms/{room_id}/ws` upgrade route.
//!
//! The bearer token comes from `Authorization: Bearer <jwt>` or, for
//! browsers that cannot set headers on a WebSocket, `?token=<jwt>`. The
//! header wins when both are present.

use super::{FrameReader, FrameWriter};
use crate::errors::TransportError;
use crate::relay::Relay;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use common::types::RoomId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Receiving half of an upgraded socket.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

/// Sending half of an upgraded socket.
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into frame reader and writer.
#[must_use]
pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader { stream }, WsWriter { sink })
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Binary(data)) => {
                    debug!(
                        target: "relay.transport.ws",
                        bytes = data.len(),
                        "Ignoring binary frame"
                    );
                }
                // Pings are answered by the WebSocket layer.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.to_owned()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// Bearer token from the `Authorization` header, if well formed.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Admit, then upgrade.
///
/// Admission runs before the upgrade is accepted, so a rejected request gets
/// a plain HTTP error and no connection is ever created. An admitted request
/// that is not a WebSocket upgrade gets 426.
pub async fn websocket_handler(
    State(relay): State<Arc<Relay>>,
    Path(room_id): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let room_id = RoomId::from(room_id);
    let token = bearer_token(&headers).or(params.token.as_deref());

    let admission = match relay.admit(token, &room_id).await {
        Ok(admission) => admission,
        Err(e) => return e.into_response(),
    };

    let Some(upgrade) = upgrade else {
        return StatusCode::UPGRADE_REQUIRED.into_response();
    };

    upgrade.on_upgrade(move |socket| async move {
        let (reader, writer) = split(socket);
        relay.serve(admission, reader, writer).await;
    })
}
