//! Generation endpoints: single, batch, status, and the artifact proxy.

use atelier_core::error::CoreError;
use atelier_core::types::{
    AdapterSpec, GenerationId, GenerationParams, ModelFamily, NodeId, TaskClass,
};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::executor::{BatchSpec, JobSpec};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_family")]
    pub model_family: ModelFamily,
    #[serde(default = "default_task_class")]
    pub task_class: TaskClass,
    #[serde(flatten)]
    pub params: GenerationParams,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    #[serde(default)]
    pub source_generation_id: Option<GenerationId>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub preferred_node: Option<NodeId>,
}

fn default_family() -> ModelFamily {
    ModelFamily::Sdxl
}

fn default_task_class() -> TaskClass {
    TaskClass::Standard
}

#[derive(Debug, Deserialize)]
pub struct BatchGenerateRequest {
    #[serde(flatten)]
    pub base: GenerateRequest,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_seed_start")]
    pub seed_start: i64,
    #[serde(default)]
    pub explore_models: bool,
    #[serde(default)]
    pub auto_adapters: bool,
}

fn default_count() -> u32 {
    4
}

fn default_seed_start() -> i64 {
    -1
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub id: String,
    pub session_id: String,
    pub status: String,
    pub node_id: Option<String>,
}

/// POST /generate -- queue a single image generation.
pub async fn generate(
    State(state): State<AppState>,
    Json(input): Json<GenerateRequest>,
) -> AppResult<impl IntoResponse> {
    let row = state
        .executor
        .submit_single(JobSpec {
            session_id: input.session_id,
            task_class: input.task_class,
            model_family: input.model_family,
            prompt: input.prompt,
            negative_prompt: input.negative_prompt,
            model: input.model,
            adapters: input.adapters,
            params: input.params,
            source_generation_id: input.source_generation_id,
            template: input.template,
            preferred_node: input.preferred_node,
        })
        .await?;

    Ok(Json(DataResponse {
        data: GenerateResponse {
            id: row.id,
            session_id: row.session_id,
            status: row.status.to_string(),
            node_id: row.node_id,
        },
    }))
}

/// POST /generate/batch -- queue a batch distributed across the fleet.
pub async fn generate_batch(
    State(state): State<AppState>,
    Json(input): Json<BatchGenerateRequest>,
) -> AppResult<impl IntoResponse> {
    if input.count == 0 {
        return Err(crate::error::AppError::BadRequest(
            "count must be at least 1".to_string(),
        ));
    }

    let submission = state
        .executor
        .submit_batch(BatchSpec {
            session_id: input.base.session_id,
            task_class: input.base.task_class,
            model_family: input.base.model_family,
            prompt: input.base.prompt,
            negative_prompt: input.base.negative_prompt,
            model: input.base.model,
            adapters: input.base.adapters,
            params: input.base.params,
            source_generation_id: input.base.source_generation_id,
            count: input.count,
            seed_start: input.seed_start,
            explore_models: input.explore_models,
            auto_adapters: input.auto_adapters,
        })
        .await?;

    Ok(Json(DataResponse {
        data: serde_json::json!({
            "batch_id": submission.batch_id,
            "total_count": submission.total,
            "allocation": submission.allocation,
        }),
    }))
}

/// GET /generate/{id} -- current state plus outputs when complete.
pub async fn get_generation(
    State(state): State<AppState>,
    Path(generation_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let generation = state
        .store
        .generation(&generation_id)
        .await
        .ok_or(CoreError::NotFound {
            entity: "generation",
            id: generation_id,
        })?;
    Ok(Json(DataResponse { data: generation }))
}

/// GET /generate/{id}/artifact -- stream the completed image from the
/// owning worker.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(generation_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let generation = state
        .store
        .generation(&generation_id)
        .await
        .ok_or_else(|| CoreError::NotFound {
            entity: "generation",
            id: generation_id.clone(),
        })?;
    let artifact = generation.artifact.ok_or(CoreError::NotFound {
        entity: "artifact",
        id: generation_id,
    })?;

    let api = state.pool.api(&artifact.node_id).await?;
    let bytes = api
        .fetch_artifact(&artifact.filename, &artifact.subfolder, &artifact.folder_type)
        .await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        bytes,
    ))
}
