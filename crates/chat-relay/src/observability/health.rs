//! Liveness and readiness probes.
//!
//! - `GET /health` answers 200 while the process is running.
//! - `GET /ready` answers 200 only when the backbone subscription is up and
//!   the relay is not draining for shutdown; 503 otherwise.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Probe state shared between the relay and the health router.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    backbone_ready: AtomicBool,
    draining: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            backbone_ready: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    /// Record that the backbone subscription has been established.
    pub fn mark_backbone_ready(&self) {
        self.backbone_ready.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness; new upgrades should go elsewhere.
    pub fn begin_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.backbone_ready.load(Ordering::SeqCst) && !self.draining.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
