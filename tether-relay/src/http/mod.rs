//! HTTP endpoints for tether-relay.
//!
//! Provides health checks, metrics, and the WebSocket endpoint that primaries
//! and mirrors connect through.

pub mod health;
mod metrics;
mod ws;

use crate::server::Relay;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(Extension(relay))
}
