//! Node inventory endpoints.

use axum::extract::{Path, State};
use axum::Json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /nodes -- full inventory with runtime state.
pub async fn list_nodes(State(state): State<AppState>) -> AppResult<impl axum::response::IntoResponse> {
    let nodes = state.registry.snapshot().await;
    Ok(Json(DataResponse { data: nodes }))
}

/// GET /nodes/{id} -- one node; 404 when unknown.
pub async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> AppResult<impl axum::response::IntoResponse> {
    let node = state.registry.get(&node_id).await?;
    Ok(Json(DataResponse { data: node }))
}
