//! Template metadata endpoint.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /templates -- manifest metadata for every loaded template.
pub async fn list_templates(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: state.templates.entries().to_vec(),
    }))
}
