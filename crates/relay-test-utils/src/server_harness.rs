//! Test server harness for end-to-end testing
//!
//! Provides `TestRelayServer` for serving a relay on a real listener.

use chat_relay::relay::Relay;
use chat_relay::routes;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A relay served over HTTP on a random local port.
///
/// # Example
/// ```rust,ignore
/// let (gate, _mock) = MockGate::new().member("r1", "alice").into_access_gate();
/// let relay = relay_with(gate, InMemoryBackbone::new(), "relay-a");
/// let server = TestRelayServer::spawn(relay).await?;
///
/// let (socket, _) = tokio_tungstenite::connect_async(server.ws_url("r1", "alice:phone")).await?;
/// ```
pub struct TestRelayServer {
    addr: SocketAddr,
    relay: Arc<Relay>,
    _handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Serve `relay` on 127.0.0.1 with an unregistered metrics recorder.
    pub async fn spawn(relay: Arc<Relay>) -> Result<Self, anyhow::Error> {
        // build_recorder() leaves the global recorder alone, so several
        // servers can coexist in one test binary.
        let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = routes::build_routes(Arc::clone(&relay), prometheus_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            relay,
            _handle: handle,
        })
    }

    /// Base HTTP URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL for `room_id`, with `token` in the query string.
    pub fn ws_url(&self, room_id: &str, token: &str) -> String {
        format!("ws://{}/rooms/{}/ws?token={}", self.addr, room_id, token)
    }

    /// WebSocket URL for `room_id` without credentials.
    pub fn ws_url_anonymous(&self, room_id: &str) -> String {
        format!("ws://{}/rooms/{}/ws", self.addr, room_id)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        self.relay.shutdown();
        self._handle.abort();
    }
}
