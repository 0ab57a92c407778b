//! Job executor: single-image and batch orchestration.
//!
//! The executor glues routing, templating, the worker pool, the store, and
//! the aggregator together: it places jobs on nodes, tracks queue depths,
//! registers correlations, supervises the per-job poll loop, and emits
//! terminal events. Failures are local to one job; a batch closes when every
//! member reaches a terminal state, even if all failed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use atelier_core::error::{CoreError, CoreResult};
use atelier_core::preference::PreferenceEngine;
use atelier_core::routing;
use atelier_core::template::TemplateEngine;
use atelier_core::types::{
    AdapterSpec, ArtifactRef, BatchId, GenerationId, GenerationParams, GenerationStatus,
    ModelFamily, NodeId, NodeSnapshot, SessionId, TaskClass, Tier,
};
use atelier_worker::history::{poll_until_complete, POLL_DEADLINE, POLL_INTERVAL};
use atelier_worker::pool::WorkerPool;
use rand::Rng;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Aggregator, SessionEvent};
use crate::registry::Registry;
use crate::store::{BatchRow, GenerationRow, Store};

/// Steps cap applied when a job lands on a draft-tier node.
const DRAFT_TIER_MAX_STEPS: u32 = 12;
/// Dimension cap applied when a job lands on a draft-tier node.
const DRAFT_TIER_MAX_DIM: u32 = 512;

/// Strength bounds for auto-selected adapters.
const AUTO_ADAPTER_MIN_STRENGTH: f64 = 0.5;
const AUTO_ADAPTER_MAX_STRENGTH: f64 = 0.8;
/// At most this many adapters are auto-attached per job.
const AUTO_ADAPTER_COUNT: usize = 3;

/// Specification of one generation job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub session_id: SessionId,
    pub task_class: TaskClass,
    pub model_family: ModelFamily,
    pub prompt: String,
    pub negative_prompt: String,
    /// Concrete model filename; the family default when absent.
    pub model: Option<String>,
    pub adapters: Vec<AdapterSpec>,
    pub params: GenerationParams,
    pub source_generation_id: Option<GenerationId>,
    /// Explicit template override; auto-selected when absent.
    pub template: Option<String>,
    pub preferred_node: Option<NodeId>,
}

/// Specification of a batch of generations.
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub session_id: SessionId,
    pub task_class: TaskClass,
    pub model_family: ModelFamily,
    pub prompt: String,
    pub negative_prompt: String,
    pub model: Option<String>,
    pub adapters: Vec<AdapterSpec>,
    pub params: GenerationParams,
    pub source_generation_id: Option<GenerationId>,
    pub count: u32,
    /// `-1` picks a random base seed; member seeds are `base + index`.
    pub seed_start: i64,
    pub explore_models: bool,
    pub auto_adapters: bool,
}

/// Outcome of batch submission, echoed to the caller.
#[derive(Debug, Clone)]
pub struct BatchSubmission {
    pub batch_id: BatchId,
    pub total: u32,
    pub allocation: BTreeMap<NodeId, u32>,
}

/// Orchestrates generation jobs across the fleet.
pub struct JobExecutor {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    templates: Arc<TemplateEngine>,
    store: Arc<Store>,
    aggregator: Arc<Aggregator>,
    preferences: Arc<PreferenceEngine>,
    session_cancels: RwLock<HashMap<SessionId, CancellationToken>>,
    cancel: CancellationToken,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        templates: Arc<TemplateEngine>,
        store: Arc<Store>,
        aggregator: Arc<Aggregator>,
        preferences: Arc<PreferenceEngine>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            pool,
            templates,
            store,
            aggregator,
            preferences,
            session_cancels: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Submit a single generation. Returns the queued job record with its
    /// assigned node; the job itself runs in the background.
    pub async fn submit_single(self: &Arc<Self>, spec: JobSpec) -> CoreResult<GenerationRow> {
        let session = self
            .store
            .session(&spec.session_id)
            .await
            .ok_or_else(|| CoreError::NotFound {
                entity: "session",
                id: spec.session_id.clone(),
            })?;

        let capability = routing::required_capability(spec.task_class, spec.model_family);
        let snapshot = self.registry.snapshot().await;
        let ranked = routing::rank_candidates(
            spec.task_class,
            capability,
            &snapshot,
            spec.preferred_node.as_deref(),
        )?;
        let node = ranked
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Internal("router returned an empty ranking".to_string()))?;

        let template_name = self.resolve_template(&spec)?;
        let row = self
            .spawn_job(spec, session.current_stage, node, template_name, None)
            .await;

        self.store
            .update_session_iteration(&row.session_id, session.phase.on_submit(), None)
            .await;

        Ok(row)
    }

    /// Submit a batch: allocate across the ranked candidates, optionally
    /// explore models and auto-select adapters, then run each member through
    /// the single-job path with consecutive seeds.
    pub async fn submit_batch(self: &Arc<Self>, spec: BatchSpec) -> CoreResult<BatchSubmission> {
        let session = self
            .store
            .session(&spec.session_id)
            .await
            .ok_or_else(|| CoreError::NotFound {
                entity: "session",
                id: spec.session_id.clone(),
            })?;

        let capability = routing::required_capability(spec.task_class, spec.model_family);
        let snapshot = self.registry.snapshot().await;
        let ranked = routing::rank_candidates(spec.task_class, capability, &snapshot, None)?;

        let node_counts = routing::split_evenly(spec.count, ranked.len());
        let mut allocation = BTreeMap::new();
        for (node, count) in ranked.iter().zip(&node_counts) {
            if *count > 0 {
                allocation.insert(node.id.clone(), *count);
            }
        }

        let model_assignments = self.assign_models(&spec).await;
        let adapter_assignments = self.assign_adapters(&spec, &model_assignments).await;

        // Validate template selection up front so a bad request fails fast
        // instead of producing N failed jobs.
        for (model, adapters) in model_assignments.iter().zip(&adapter_assignments) {
            let probe = JobSpec {
                session_id: spec.session_id.clone(),
                task_class: spec.task_class,
                model_family: spec.model_family,
                prompt: spec.prompt.clone(),
                negative_prompt: spec.negative_prompt.clone(),
                model: Some(model.clone()),
                adapters: adapters.clone(),
                params: spec.params.clone(),
                source_generation_id: spec.source_generation_id.clone(),
                template: None,
                preferred_node: None,
            };
            self.resolve_template(&probe)?;
        }

        let base_seed = resolve_seed(spec.seed_start);
        let batch_id = uuid::Uuid::new_v4().to_string();
        self.store
            .create_batch(BatchRow {
                id: batch_id.clone(),
                session_id: spec.session_id.clone(),
                stage: session.current_stage,
                total: spec.count,
                completed: 0,
                failed: 0,
                allocation: allocation.clone(),
                closed: false,
                created_at: chrono::Utc::now(),
            })
            .await;

        let mut index: u32 = 0;
        for (node, count) in ranked.iter().zip(&node_counts) {
            for _ in 0..*count {
                let slot = index as usize % model_assignments.len();
                let member = JobSpec {
                    session_id: spec.session_id.clone(),
                    task_class: spec.task_class,
                    model_family: spec.model_family,
                    prompt: spec.prompt.clone(),
                    negative_prompt: spec.negative_prompt.clone(),
                    model: Some(model_assignments[slot].clone()),
                    adapters: adapter_assignments[slot].clone(),
                    params: GenerationParams {
                        seed: base_seed + index as i64,
                        ..spec.params.clone()
                    },
                    source_generation_id: spec.source_generation_id.clone(),
                    template: None,
                    preferred_node: None,
                };
                let template_name = self.resolve_template(&member)?;
                self.spawn_job(
                    member,
                    session.current_stage,
                    node.clone(),
                    template_name,
                    Some(batch_id.clone()),
                )
                .await;
                index += 1;
            }
        }

        self.store
            .update_session_iteration(&spec.session_id, session.phase.on_submit(), None)
            .await;

        tracing::info!(
            batch_id = %batch_id,
            total = spec.count,
            nodes = allocation.len(),
            models = model_assignments.len(),
            "Batch submitted",
        );

        Ok(BatchSubmission {
            batch_id,
            total: spec.count,
            allocation,
        })
    }

    /// Cancel every in-flight job of a session.
    ///
    /// The poll loops observe the token and terminate their jobs as
    /// `failed(cancelled)`; cancellation toward the workers is best effort.
    pub async fn cancel_session(&self, session_id: &str) {
        if let Some(token) = self.session_cancels.write().await.remove(session_id) {
            token.cancel();
        }

        for generation in self.store.list_generations(session_id, None).await {
            if generation.status.is_terminal() {
                continue;
            }
            if let (Some(node_id), Some(worker_job_id)) =
                (&generation.node_id, &generation.worker_job_id)
            {
                if let Err(e) = self.pool.cancel_job(node_id, worker_job_id).await {
                    tracing::debug!(
                        generation_id = %generation.id,
                        error = %e,
                        "Best-effort worker cancel failed",
                    );
                }
            }
        }
    }

    // ---- model / adapter selection ----

    /// Models for a batch: the explicit model, or a preference-guided
    /// selection from the asset catalog when exploration is on.
    async fn assign_models(&self, spec: &BatchSpec) -> Vec<String> {
        let default_model = || TemplateEngine::default_model(spec.model_family).to_string();

        if let Some(model) = &spec.model {
            return vec![model.clone()];
        }
        if !spec.explore_models {
            return vec![default_model()];
        }

        let candidates = {
            let catalog = self.pool.assets().await;
            let names = catalog.model_names();
            if names.is_empty() {
                vec![default_model()]
            } else {
                names
            }
        };

        let (_, confidence) = self
            .preferences
            .recommend_model(&spec.prompt, &candidates)
            .unwrap_or_else(|| (default_model(), 0.0));

        let draft_stage = spec.task_class == TaskClass::Draft;
        let take = routing::exploration_model_count(confidence, draft_stage).min(candidates.len());
        let models: Vec<String> = self
            .preferences
            .score_models(&spec.prompt, &candidates)
            .into_iter()
            .take(take.max(1))
            .map(|(model, _)| model)
            .collect();

        tracing::info!(
            confidence,
            draft_stage,
            models = ?models,
            "Model exploration selection",
        );
        models
    }

    /// Adapters per model slot: the explicit list, or the top-scoring
    /// catalog adapters with strengths clipped into the safe band.
    async fn assign_adapters(
        &self,
        spec: &BatchSpec,
        models: &[String],
    ) -> Vec<Vec<AdapterSpec>> {
        if !spec.auto_adapters || !spec.adapters.is_empty() {
            return models.iter().map(|_| spec.adapters.clone()).collect();
        }

        let candidates = self.pool.assets().await.adapter_names();
        if candidates.is_empty() {
            return models.iter().map(|_| Vec::new()).collect();
        }

        models
            .iter()
            .map(|model| {
                self.preferences
                    .recommend_adapters(&spec.prompt, model, &candidates, AUTO_ADAPTER_COUNT)
                    .into_iter()
                    .map(|(name, score)| {
                        AdapterSpec::at_strength(
                            name,
                            score.clamp(AUTO_ADAPTER_MIN_STRENGTH, AUTO_ADAPTER_MAX_STRENGTH),
                        )
                    })
                    .collect()
            })
            .collect()
    }

    /// Resolve the template for a job, surfacing selection and adapter
    /// support errors at request time.
    fn resolve_template(&self, spec: &JobSpec) -> CoreResult<String> {
        let needs_img2img = spec.source_generation_id.is_some();
        let needs_adapters = !spec.adapters.is_empty();
        match &spec.template {
            Some(name) => {
                let entry = self
                    .templates
                    .entries()
                    .iter()
                    .find(|e| &e.name == name)
                    .ok_or_else(|| CoreError::NotFound {
                        entity: "template",
                        id: name.clone(),
                    })?;
                if needs_adapters && !entry.supports_adapters {
                    return Err(CoreError::UnsupportedAdapter(name.clone()));
                }
                Ok(name.clone())
            }
            None => self
                .templates
                .select(spec.model_family, needs_img2img, needs_adapters)
                .map(str::to_string),
        }
    }

    // ---- job lifecycle ----

    /// Create the job record and start its background run.
    async fn spawn_job(
        self: &Arc<Self>,
        spec: JobSpec,
        stage: u32,
        node: NodeSnapshot,
        template_name: String,
        batch_id: Option<BatchId>,
    ) -> GenerationRow {
        let generation_id = uuid::Uuid::new_v4().to_string();
        let seed = resolve_seed(spec.params.seed);

        let row = GenerationRow {
            id: generation_id.clone(),
            session_id: spec.session_id.clone(),
            stage,
            batch_id: batch_id.clone(),
            task_class: spec.task_class,
            model_family: spec.model_family,
            prompt: spec.prompt.clone(),
            negative_prompt: spec.negative_prompt.clone(),
            model: spec
                .model
                .clone()
                .unwrap_or_else(|| TemplateEngine::default_model(spec.model_family).to_string()),
            adapters: spec.adapters.clone(),
            params: GenerationParams {
                seed,
                ..spec.params.clone()
            },
            seed,
            node_id: Some(node.id.clone()),
            worker_job_id: None,
            status: GenerationStatus::Queued,
            error: None,
            artifact: None,
            elapsed_ms: None,
            created_at: chrono::Utc::now(),
        };
        self.store.insert_generation(row.clone()).await;

        let token = self.session_token(&spec.session_id).await.child_token();
        let executor = Arc::clone(self);
        let run_row = row.clone();
        tokio::spawn(async move {
            executor
                .run_generation(run_row, spec, node, template_name, token)
                .await;
        });

        row
    }

    /// The full background lifecycle of one job.
    async fn run_generation(
        self: Arc<Self>,
        row: GenerationRow,
        spec: JobSpec,
        node: NodeSnapshot,
        template_name: String,
        token: CancellationToken,
    ) {
        self.registry.bump_queue(&node.id, 1).await;
        let result = self
            .drive(&row, &spec, &node, &template_name, &token)
            .await;
        self.registry.bump_queue(&node.id, -1).await;

        match result {
            Ok((artifact, elapsed_ms)) => {
                self.store
                    .mark_complete(&row.id, artifact, row.seed, elapsed_ms)
                    .await;
                tracing::info!(
                    generation_id = %row.id,
                    node_id = %node.id,
                    elapsed_ms,
                    "Generation complete",
                );
                self.aggregator
                    .deliver(
                        &row.session_id,
                        SessionEvent::Complete {
                            generation_id: row.id.clone(),
                            artifact_url: format!("/generate/{}/artifact", row.id),
                            thumbnail_url: format!("/generate/{}/thumbnail", row.id),
                            seed: row.seed,
                            elapsed_ms,
                            node_id: node.id.clone(),
                        },
                    )
                    .await;
                self.finish_batch_member(&row, true).await;
            }
            Err(error) => {
                let cancelled =
                    token.is_cancelled() || matches!(error, CoreError::Cancelled);
                let reason = if cancelled {
                    "cancelled".to_string()
                } else {
                    error.to_string()
                };
                tracing::warn!(
                    generation_id = %row.id,
                    node_id = %node.id,
                    reason = %reason,
                    "Generation failed",
                );
                self.store.mark_failed(&row.id, &reason).await;

                // An already-submitted worker job may still be running; tell
                // the worker to drop it, best effort.
                if cancelled {
                    if let Some(worker_job_id) = self
                        .store
                        .generation(&row.id)
                        .await
                        .and_then(|g| g.worker_job_id)
                    {
                        let _ = self.pool.cancel_job(&node.id, &worker_job_id).await;
                    }
                }

                self.aggregator
                    .deliver(
                        &row.session_id,
                        SessionEvent::Error {
                            generation_id: row.id.clone(),
                            message: reason,
                        },
                    )
                    .await;
                self.finish_batch_member(&row, false).await;
            }
        }
    }

    /// Build, submit, and poll one job to completion.
    async fn drive(
        &self,
        row: &GenerationRow,
        spec: &JobSpec,
        node: &NodeSnapshot,
        template_name: &str,
        token: &CancellationToken,
    ) -> CoreResult<(ArtifactRef, u64)> {
        let values = self.template_values(row, spec, node).await?;
        let graph = self.templates.build(template_name, &values)?;
        let graph = self
            .templates
            .inject_adapters(template_name, graph, &spec.adapters)?;

        let started = std::time::Instant::now();
        let submission = self.pool.submit(&node.id, &graph).await?;
        let worker_job_id = submission.prompt_id;

        self.store.mark_dispatched(&row.id, &worker_job_id).await;
        self.aggregator
            .register(&worker_job_id, &row.id, &row.session_id, &node.id)
            .await?;

        let api = self.pool.api(&node.id).await?;
        let outputs =
            poll_until_complete(&api, &worker_job_id, POLL_DEADLINE, POLL_INTERVAL, token).await?;

        let first = outputs.into_iter().next().ok_or_else(|| {
            CoreError::RejectedByWorker("worker reported no image outputs".to_string())
        })?;

        Ok((
            ArtifactRef {
                node_id: node.id.clone(),
                filename: first.filename,
                subfolder: first.subfolder,
                folder_type: first.folder_type,
            },
            started.elapsed().as_millis() as u64,
        ))
    }

    /// Assemble the substitution values for a job's template build.
    async fn template_values(
        &self,
        row: &GenerationRow,
        spec: &JobSpec,
        node: &NodeSnapshot,
    ) -> CoreResult<HashMap<String, Value>> {
        let params = &row.params;
        let (mut steps, mut width, mut height) = (params.steps, params.width, params.height);
        if node.tier == Tier::Draft {
            steps = steps.min(DRAFT_TIER_MAX_STEPS);
            width = width.min(DRAFT_TIER_MAX_DIM);
            height = height.min(DRAFT_TIER_MAX_DIM);
        }

        let mut values: HashMap<String, Value> = HashMap::from([
            ("prompt".to_string(), Value::from(spec.prompt.clone())),
            (
                "negative_prompt".to_string(),
                Value::from(spec.negative_prompt.clone()),
            ),
            ("checkpoint".to_string(), Value::from(row.model.clone())),
            ("width".to_string(), Value::from(width)),
            ("height".to_string(), Value::from(height)),
            ("steps".to_string(), Value::from(steps)),
            ("cfg_scale".to_string(), Value::from(params.cfg_scale)),
            ("sampler".to_string(), Value::from(params.sampler.clone())),
            (
                "scheduler".to_string(),
                Value::from(params.scheduler.clone()),
            ),
            (
                "denoise_strength".to_string(),
                Value::from(params.denoise_strength),
            ),
            ("seed".to_string(), Value::from(row.seed)),
            (
                "filename_prefix".to_string(),
                Value::from(format!("atelier_{}_{}", row.session_id, row.id)),
            ),
        ]);

        // img2img: ship the source artifact to the target node's input store.
        if let Some(source_id) = &spec.source_generation_id {
            let source = self
                .store
                .generation(source_id)
                .await
                .ok_or_else(|| CoreError::NotFound {
                    entity: "generation",
                    id: source_id.clone(),
                })?;
            let artifact = source.artifact.ok_or_else(|| CoreError::NotFound {
                entity: "artifact",
                id: source_id.clone(),
            })?;

            let source_api = self.pool.api(&artifact.node_id).await?;
            let bytes = source_api
                .fetch_artifact(&artifact.filename, &artifact.subfolder, &artifact.folder_type)
                .await?;

            let target_api = self.pool.api(&node.id).await?;
            let uploaded = target_api
                .upload_image(&format!("{}_source.png", row.id), bytes)
                .await?;
            values.insert("source_image_filename".to_string(), Value::from(uploaded));
        }

        Ok(values)
    }

    /// Batch bookkeeping after one member went terminal.
    async fn finish_batch_member(&self, row: &GenerationRow, success: bool) {
        let Some(batch_id) = &row.batch_id else {
            return;
        };
        let Some(terminal) = self.store.note_batch_terminal(batch_id, success).await else {
            return;
        };

        self.aggregator
            .deliver(
                &row.session_id,
                SessionEvent::BatchProgress {
                    batch_id: batch_id.clone(),
                    completed: terminal.completed,
                    total: terminal.total,
                    latest_complete: success.then(|| row.id.clone()),
                },
            )
            .await;

        if terminal.closed_now {
            let elapsed_ms = self
                .store
                .batch(batch_id)
                .await
                .map(|b| {
                    (chrono::Utc::now() - b.created_at)
                        .num_milliseconds()
                        .max(0) as u64
                })
                .unwrap_or(0);
            self.aggregator
                .deliver(
                    &row.session_id,
                    SessionEvent::BatchComplete {
                        batch_id: batch_id.clone(),
                        total: terminal.total,
                        elapsed_ms,
                    },
                )
                .await;

            if let Some(session) = self.store.session(&row.session_id).await {
                self.store
                    .update_session_iteration(
                        &row.session_id,
                        session.phase.on_batch_complete(),
                        None,
                    )
                    .await;
            }
        }
    }

    /// The session's cancellation token, created on first use as a child of
    /// the process-wide token.
    async fn session_token(&self, session_id: &str) -> CancellationToken {
        let mut cancels = self.session_cancels.write().await;
        cancels
            .entry(session_id.to_string())
            .or_insert_with(|| self.cancel.child_token())
            .clone()
    }
}

/// Resolve `-1` to a uniformly random u32 seed.
fn resolve_seed(seed: i64) -> i64 {
    if seed == -1 {
        rand::rng().random::<u32>() as i64
    } else {
        seed
    }
}
