//! Preference learning endpoints: stats, recommendations, export/import.

use atelier_core::error::CoreError;
use atelier_core::preference::PreferenceExport;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RecommendModelQuery {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct RecommendAdaptersQuery {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_adapter_count")]
    pub count: usize,
}

fn default_adapter_count() -> usize {
    3
}

/// GET /preferences/stats
pub async fn stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: state.preferences.stats_summary(),
    }))
}

/// GET /preferences/recommend/model?prompt=...
///
/// Candidates come from the fleet's asset catalog; with an empty catalog the
/// family default is the only candidate.
pub async fn recommend_model(
    State(state): State<AppState>,
    Query(query): Query<RecommendModelQuery>,
) -> AppResult<impl IntoResponse> {
    let mut candidates = state.pool.assets().await.model_names();
    if candidates.is_empty() {
        candidates.push(
            atelier_core::template::TemplateEngine::default_model(
                atelier_core::types::ModelFamily::Sdxl,
            )
            .to_string(),
        );
    }

    let (model, confidence) = state
        .preferences
        .recommend_model(&query.prompt, &candidates)
        .unwrap_or((String::new(), 0.0));

    Ok(Json(DataResponse {
        data: serde_json::json!({
            "model": model,
            "confidence": confidence,
        }),
    }))
}

/// GET /preferences/recommend/adapters?prompt=...&model=...&count=N
pub async fn recommend_adapters(
    State(state): State<AppState>,
    Query(query): Query<RecommendAdaptersQuery>,
) -> AppResult<impl IntoResponse> {
    let candidates = state.pool.assets().await.adapter_names();
    let recommendations: Vec<serde_json::Value> = state
        .preferences
        .recommend_adapters(&query.prompt, &query.model, &candidates, query.count)
        .into_iter()
        .map(|(adapter, score)| serde_json::json!({ "adapter": adapter, "score": score }))
        .collect();

    Ok(Json(DataResponse {
        data: recommendations,
    }))
}

/// GET /preferences/export
pub async fn export(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(state.preferences.export()))
}

/// POST /preferences/import
///
/// Replaces the engine state atomically; partially-decoded input is
/// rejected.
pub async fn import(
    State(state): State<AppState>,
    body: String,
) -> AppResult<impl IntoResponse> {
    let export: PreferenceExport = serde_json::from_str(&body)
        .map_err(|e| CoreError::CorruptExport(format!("undecodable export: {e}")))?;
    state.preferences.import(export)?;
    Ok(Json(DataResponse {
        data: serde_json::json!({ "imported": true }),
    }))
}
