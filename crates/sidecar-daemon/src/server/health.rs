//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

pub(super) async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.connection_count(),
    })
}
