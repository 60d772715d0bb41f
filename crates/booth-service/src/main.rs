//! Booth Service
//!
//! Realtime booth rotation server.
//!
//! # Servers
//!
//! - WebSocket endpoint `/ws` for clients (default: 0.0.0.0:6042)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the Redis store and event bus
//! 4. Load the user directory
//! 5. Build scheduler, waitlist, auth registry and connection registry
//! 6. Recover the persisted booth play
//! 7. Start health and realtime servers, mark ready
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use booth_service::auth::TokenAuthRegistry;
use booth_service::booth::BoothScheduler;
use booth_service::bus::EventBus;
use booth_service::config::Config;
use booth_service::connections::{ConnectionRegistryHandle, RegistryContext};
use booth_service::directory::{MemoryDirectory, UserDirectory};
use booth_service::observability::{health_router, init_metrics_recorder, HealthState};
use booth_service::redis::{RedisEventBus, RedisStore};
use booth_service::server::realtime_router;
use booth_service::store::StateStore;
use booth_service::waitlist::WaitlistQueue;
use common::secret::ExposeSecret;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booth_service=debug,booth=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Booth Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        bus_channel = %config.bus_channel,
        grace_period_secs = config.tuning.grace_period.as_secs(),
        lost_queue_capacity = config.tuning.lost_queue_capacity,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    info!("Connecting to Redis...");
    let store: Arc<dyn StateStore> = Arc::new(
        RedisStore::new(config.redis_url.expose_secret())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?,
    );
    let bus: Arc<dyn EventBus> = Arc::new(
        RedisEventBus::connect(
            config.redis_url.expose_secret(),
            &config.bus_channel,
            shutdown_token.child_token(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect event bus");
            e
        })?,
    );
    info!("Redis connection established");

    let directory: Arc<dyn UserDirectory> = Arc::new(match &config.directory_seed {
        Some(path) => {
            info!(path = %path, "Loading user directory seed");
            MemoryDirectory::from_seed_file(path)?
        }
        None => MemoryDirectory::new(),
    });

    let booth = BoothScheduler::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&directory),
        config.tuning.advance_lock_ttl,
        shutdown_token.child_token(),
    );
    let waitlist = Arc::new(WaitlistQueue::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&directory),
        Arc::clone(&booth),
    ));
    let auth = TokenAuthRegistry::new(Arc::clone(&store), config.tuning.auth_token_ttl);

    let registry = ConnectionRegistryHandle::spawn(
        RegistryContext {
            instance_id: config.instance_id.clone(),
            tuning: config.tuning,
            store: Arc::clone(&store),
            bus: Arc::clone(&bus),
            directory: Arc::clone(&directory),
            auth,
            booth: Arc::clone(&booth),
            waitlist,
        },
        shutdown_token.child_token(),
    );
    health_state.attach_registry(registry.clone());
    info!("Connection registry started");

    booth.recover().await.map_err(|e| {
        error!(error = %e, "Failed to recover booth state");
        e
    })?;

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let ws_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await.map_err(|e| {
        error!(error = %e, addr = %ws_addr, "Failed to bind realtime server");
        format!("Failed to bind realtime server to {ws_addr}: {e}")
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

    let ws_shutdown_token = shutdown_token.child_token();
    let ws_app = realtime_router(registry.clone());
    tokio::spawn(async move {
        info!(addr = %ws_addr, "Realtime server starting");
        let server = axum::serve(ws_listener, ws_app).with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("Realtime server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Realtime server failed");
        }
    });

    health_state.set_ready();
    info!("Booth Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Propagates to the registry, timers, bus subscriber and servers
    shutdown_token.cancel();

    // Give tasks time to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Booth Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
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
