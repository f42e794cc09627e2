//! Health check endpoints.
//!
//! Provides endpoints for monitoring server health and readiness.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Server status
    pub status: &'static str,
    /// Server version
    pub version: &'static str,
}

/// Liveness probe - server is running
///
/// GET /health/live
async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    /// Number of uploads currently in flight
    pub open_sessions: usize,
}

/// Readiness probe - server can accept requests
///
/// GET /health/ready
async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        status: "ready",
        open_sessions: state.sessions.len(),
    })
}

/// Create health check routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
}
