//! HTTP surface of the relay.
//!
//! - `GET /rooms/:room_id/ws` - WebSocket upgrade
//! - `GET /health`, `GET /ready` - probes
//! - `GET /metrics` - Prometheus text

use crate::observability::health_router;
use crate::relay::Relay;
use crate::transport::websocket::websocket_handler;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the relay's router.
pub fn build_routes(relay: Arc<Relay>, prometheus_handle: PrometheusHandle) -> Router {
    let health = health_router(Arc::clone(relay.health()));

    let metrics = Router::new().route(
        "/metrics",
        get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    Router::new()
        .route("/rooms/:room_id/ws", get(websocket_handler))
        .with_state(relay)
        .merge(health)
        .merge(metrics)
        .layer(TraceLayer::new_for_http())
}
