//! Presence Coordinator
//!
//! Presence and media-session signaling server.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000, path `/ws`)
//! - HTTP server for health endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the media engine client
//! 4. Configure the engine router and start the coordinator
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling server
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pc_service::actors::{ActorMetrics, CoordinatorActor, CoordinatorConfig};
use pc_service::config::Config;
use pc_service::media::http_engine::HttpMediaEngine;
use pc_service::media::MediaEngine;
use pc_service::observability::metrics::init_metrics_recorder;
use pc_service::observability::{health_router, HealthState};
use pc_service::signaling::{signaling_router, SignalingState};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for the coordinator to release all sessions.
const COORDINATOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Presence Coordinator");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        media_engine_url = %config.media_engine_url,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        max_connections = config.max_connections,
        engine_request_timeout_ms = config.engine_request_timeout.as_millis(),
        consumer_resume_delay_ms = config.consumer_resume_delay.as_millis(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let engine = HttpMediaEngine::new(
        config.media_engine_url.clone(),
        config.media_engine_token.clone(),
        config.engine_request_timeout,
    )
    .map_err(|e| {
        error!(error = %e, "Failed to create media engine client");
        e
    })?;
    let engine: Arc<dyn MediaEngine> = Arc::new(engine);

    // Configures the engine router before the actor is spawned
    info!("Configuring media engine router...");
    let actor_metrics = ActorMetrics::new();
    let (coordinator, coordinator_task) = CoordinatorActor::start(
        CoordinatorConfig::from_config(&config),
        engine,
        Arc::clone(&actor_metrics),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to configure media engine router");
        e
    })?;
    info!("Coordinator started");

    // Servers stop when the coordinator's token is cancelled
    let shutdown_token = coordinator.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(SignalingState {
        coordinator: coordinator.clone(),
        metrics: Arc::clone(&actor_metrics),
    });

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Presence Coordinator running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    // Cancels the servers and every connection, then releases all sessions
    coordinator.cancel();

    match tokio::time::timeout(COORDINATOR_SHUTDOWN_TIMEOUT, coordinator_task).await {
        Ok(Ok(())) => info!("Coordinator stopped cleanly"),
        Ok(Err(e)) => {
            if e.is_panic() {
                actor_metrics.record_panic(pc_service::actors::ActorType::Coordinator);
            }
            warn!(error = %e, "Coordinator task failed during shutdown");
        }
        Err(_) => warn!("Coordinator shutdown timed out"),
    }

    info!("Presence Coordinator shutdown complete");
    Ok(())
}

/// Install the tracing subscriber. `PC_LOG_FORMAT=json` switches to JSON
/// output.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pc_service=debug,tower_http=debug".into());

    let json = std::env::var("PC_LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

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
