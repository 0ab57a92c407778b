//! Session lifecycle endpoints.

use atelier_core::error::CoreError;
use atelier_core::types::FlowKind;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub flow_kind: FlowKind,
    #[serde(default)]
    pub initial_config: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct GenerationListQuery {
    pub stage: Option<u32>,
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(input): Json<CreateSessionRequest>,
) -> AppResult<impl IntoResponse> {
    let session = state
        .store
        .create_session(input.flow_kind, input.initial_config)
        .await;
    tracing::info!(session_id = %session.id, flow_kind = ?session.flow_kind, "Session created");
    Ok((StatusCode::CREATED, Json(DataResponse { data: session })))
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let session = state
        .store
        .session(&session_id)
        .await
        .ok_or(CoreError::NotFound {
            entity: "session",
            id: session_id,
        })?;
    Ok(Json(DataResponse { data: session }))
}

/// GET /sessions/{id}/generations?stage=N
pub async fn list_session_generations(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<GenerationListQuery>,
) -> AppResult<impl IntoResponse> {
    if state.store.session(&session_id).await.is_none() {
        return Err(CoreError::NotFound {
            entity: "session",
            id: session_id,
        }
        .into());
    }
    let generations = state.store.list_generations(&session_id, query.stage).await;
    Ok(Json(DataResponse { data: generations }))
}

/// DELETE /sessions/{id}
///
/// Cancels the session's in-flight jobs, then removes the session and its
/// generations.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    if state.store.session(&session_id).await.is_none() {
        return Err(CoreError::NotFound {
            entity: "session",
            id: session_id,
        }
        .into());
    }

    state.executor.cancel_session(&session_id).await;
    let removed = state
        .store
        .delete_session(&session_id)
        .await
        .unwrap_or_default();

    tracing::info!(session_id = %session_id, generations = removed.len(), "Session deleted");
    Ok(Json(DataResponse {
        data: serde_json::json!({
            "deleted": session_id,
            "generations_removed": removed.len(),
        }),
    }))
}
