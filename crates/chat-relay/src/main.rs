//! Chat Relay
//!
//! Real-time delivery backend for chat rooms. Serves WebSocket sessions on
//! `GET /rooms/:room_id/ws` and fans messages out across instances over a
//! pub/sub backbone.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the backbone (Redis or in-memory) and membership directory
//! 4. Build the relay and start the message bridge
//! 5. Bind the listener and serve
//! 6. On SIGINT/SIGTERM: stop readiness, close all connections, drain

#![warn(clippy::pedantic)]

use chat_relay::bridge::{Backbone, InMemoryBackbone, RedisBackbone};
use chat_relay::config::{BackboneKind, Config};
use chat_relay::errors::RelayError;
use chat_relay::gate::{AccessGate, JwtTokenDecoder, RedisMembershipDirectory};
use chat_relay::observability::init_metrics_recorder;
use chat_relay::relay::{Relay, RelayOptions};
use chat_relay::routes::build_routes;
use common::secret::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Chat Relay");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        backbone = ?config.backbone,
        topic_strategy = ?config.topic_strategy,
        duplicate_policy = ?config.duplicate_policy,
        outbound_queue_capacity = config.outbound_queue_capacity,
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let backbone: Arc<dyn Backbone> = match config.backbone {
        BackboneKind::Redis => {
            info!("Connecting to Redis backbone...");
            let backbone = RedisBackbone::connect(config.redis_url.expose_secret())
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to connect to Redis backbone");
                    e
                })?;
            Arc::new(backbone)
        }
        BackboneKind::Memory => {
            warn!("Using in-memory backbone; messages will not reach other instances");
            Arc::new(InMemoryBackbone::new())
        }
    };

    backbone.health_check().await.map_err(|e| {
        error!(error = %e, "Backbone health check failed");
        e
    })?;

    let directory = RedisMembershipDirectory::connect(
        config.redis_url.expose_secret(),
        config.topic_prefix.clone(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to connect membership directory");
        RelayError::Membership(e.to_string())
    })?;

    let gate = AccessGate::new(
        Arc::new(JwtTokenDecoder::new(
            config.jwt_secret.clone(),
            config.jwt_clock_skew,
        )),
        Arc::new(directory),
    );

    let relay = Relay::new(RelayOptions::from_config(&config), gate, backbone);
    relay.start().map_err(|e| {
        error!(error = %e, "Failed to start message bridge");
        e
    })?;

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    // Bind before spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        RelayError::Io(format!("Failed to bind {addr}: {e}"))
    })?;
    info!(addr = %addr, "Listener bound successfully");

    let app = build_routes(Arc::clone(&relay), prometheus_handle);
    let server_token = CancellationToken::new();
    let server_shutdown = server_token.clone();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("Chat Relay running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Connection close signals are children of the relay's token.
    relay.shutdown();
    server_token.cancel();

    if tokio::time::timeout(config.shutdown_grace, server).await.is_err() {
        warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "HTTP server did not drain within the grace period"
        );
    }

    info!(
        remaining_connections = relay.registry().connection_count(),
        "Chat Relay shutdown complete"
    );
    Ok(())
}

/// `LOG_FORMAT=json` switches to JSON lines; otherwise human-readable.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chat_relay=debug,tower_http=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed; without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
