//! Fleet asset catalog endpoints.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /assets/models -- loadable models with per-node availability.
pub async fn list_models(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let catalog = state.pool.assets().await;
    let models: Vec<serde_json::Value> = catalog
        .models
        .iter()
        .map(|(name, nodes)| {
            serde_json::json!({
                "filename": name,
                "available_on": nodes,
            })
        })
        .collect();
    Ok(Json(DataResponse { data: models }))
}

/// GET /assets/adapters -- loadable adapters with per-node availability.
pub async fn list_adapters(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let catalog = state.pool.assets().await;
    let adapters: Vec<serde_json::Value> = catalog
        .adapters
        .iter()
        .map(|(name, nodes)| {
            serde_json::json!({
                "filename": name,
                "available_on": nodes,
            })
        })
        .collect();
    Ok(Json(DataResponse { data: adapters }))
}
