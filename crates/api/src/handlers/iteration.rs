//! Feedback endpoints driving the iteration funnel.

use atelier_core::types::GenerationId;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::controller::{Feedback, FeedbackAction};
use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub session_id: String,
    pub action: FeedbackAction,
    #[serde(default)]
    pub selected_ids: Vec<GenerationId>,
    #[serde(default)]
    pub rejected_ids: Vec<GenerationId>,
    #[serde(default)]
    pub feedback_text: Option<String>,
    /// Free-form overrides merged into the next stage's parameters by the
    /// caller; echoed through untouched.
    #[serde(default)]
    pub parameter_adjustments: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RejectAllRequest {
    pub session_id: String,
    pub stage: u32,
    #[serde(default)]
    pub rejected_ids: Vec<GenerationId>,
    #[serde(default)]
    pub feedback_text: Option<String>,
}

/// POST /iterate -- feedback on the current stage; returns the next-stage
/// plan.
pub async fn iterate(
    State(state): State<AppState>,
    Json(input): Json<FeedbackRequest>,
) -> AppResult<impl IntoResponse> {
    if input.action == FeedbackAction::RejectAll {
        return Err(AppError::BadRequest(
            "use /iterate/reject-all for reject_all".to_string(),
        ));
    }
    if input.selected_ids.is_empty() {
        return Err(AppError::BadRequest(
            "at least one selected generation is required".to_string(),
        ));
    }

    let mut plan = state
        .controller
        .feedback(Feedback {
            session_id: input.session_id,
            action: input.action,
            selected_ids: input.selected_ids,
            rejected_ids: input.rejected_ids,
            feedback_text: input.feedback_text,
        })
        .await?;

    // Caller-supplied parameter adjustments win over the stage profile.
    if let Some(adjustments) = &input.parameter_adjustments {
        if let Ok(merged) = merge_params(&plan.parameters, adjustments) {
            plan.parameters = merged;
        }
    }

    Ok(Json(DataResponse { data: plan }))
}

/// POST /iterate/reject-all -- record the whole stage as rejected without
/// advancing.
pub async fn reject_all(
    State(state): State<AppState>,
    Json(input): Json<RejectAllRequest>,
) -> AppResult<impl IntoResponse> {
    let outcome = state
        .controller
        .reject_all(
            &input.session_id,
            input.stage,
            &input.rejected_ids,
            input.feedback_text,
        )
        .await?;

    Ok(Json(DataResponse {
        data: serde_json::json!({
            "recorded": outcome.recorded > 0,
            "count": outcome.recorded,
            "rationale": outcome.rationale,
        }),
    }))
}

/// Overlay adjustment keys onto a parameter bundle via JSON merge.
fn merge_params(
    base: &atelier_core::types::GenerationParams,
    adjustments: &serde_json::Value,
) -> Result<atelier_core::types::GenerationParams, serde_json::Error> {
    let mut value = serde_json::to_value(base)?;
    if let (Some(target), Some(overlay)) = (value.as_object_mut(), adjustments.as_object()) {
        for (k, v) in overlay {
            target.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(value)
}
