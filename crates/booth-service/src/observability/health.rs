//! Liveness and readiness endpoints.
//!
//! - `GET /health` - the process is up
//! - `GET /ready` - startup recovery finished and the connection registry
//!   is running; the body carries its connection counts
//!
//! `/metrics` is merged onto the same router in `main` from the Prometheus
//! handle.

use crate::connections::ConnectionRegistryHandle;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Readiness inputs shared between `main` and the HTTP handlers.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Cleared again when shutdown begins so the load balancer drains us.
    recovered: AtomicBool,
    registry: OnceLock<ConnectionRegistryHandle>,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `registry`; `/ready` fails once its actor is cancelled.
    /// Only the first registry attached is kept.
    pub fn attach_registry(&self, registry: ConnectionRegistryHandle) {
        let _ = self.registry.set(registry);
    }

    /// Booth recovery is done.
    pub fn set_ready(&self) {
        self.recovered.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.recovered.store(false, Ordering::SeqCst);
    }

    fn live_registry(&self) -> Option<&ConnectionRegistryHandle> {
        if !self.recovered.load(Ordering::SeqCst) {
            return None;
        }
        self.registry.get().filter(|r| !r.is_cancelled())
    }
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let Some(registry) = state.live_registry() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match registry.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => {
            warn!(target: "booth.registry", error = %e, "Readiness probe could not reach registry");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
