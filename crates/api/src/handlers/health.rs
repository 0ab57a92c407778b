//! Process health endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    nodes_healthy: usize,
    nodes_total: usize,
    version: &'static str,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (nodes_healthy, nodes_total) = state.registry.counts().await;
    Json(HealthResponse {
        status: "ok",
        nodes_healthy,
        nodes_total,
        version: env!("CARGO_PKG_VERSION"),
    })
}
