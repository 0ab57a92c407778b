//! In-memory store for sessions, generations, and batches.
//!
//! A single `RwLock` serializes state transitions; every mutator enforces
//! the forward-only job lifecycle. Generations never move between sessions
//! and batch counters only grow.

use std::collections::{BTreeMap, HashMap};

use atelier_core::iteration::StagePhase;
use atelier_core::types::{
    AdapterSpec, ArtifactRef, BatchId, FlowKind, GenerationId, GenerationParams, GenerationStatus,
    ModelFamily, NodeId, SessionId, TaskClass, Timestamp, WorkerJobId,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// One user session and its iteration state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub flow_kind: FlowKind,
    pub created_at: Timestamp,
    pub current_stage: u32,
    pub phase: StagePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    /// Free-form accumulator of the user's intent across feedback rounds.
    pub intent: Value,
}

/// One generation job.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRow {
    pub id: GenerationId,
    pub session_id: SessionId,
    pub stage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    pub task_class: TaskClass,
    pub model_family: ModelFamily,
    pub prompt: String,
    pub negative_prompt: String,
    /// Concrete model filename dispatched with the job.
    pub model: String,
    pub adapters: Vec<AdapterSpec>,
    pub params: GenerationParams,
    pub seed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_job_id: Option<WorkerJobId>,
    pub status: GenerationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub created_at: Timestamp,
}

/// One batch of generations submitted together.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRow {
    pub id: BatchId,
    pub session_id: SessionId,
    pub stage: u32,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub allocation: BTreeMap<NodeId, u32>,
    pub closed: bool,
    pub created_at: Timestamp,
}

/// Result of recording one terminal batch member.
#[derive(Debug, Clone, Copy)]
pub struct BatchTerminal {
    pub completed: u32,
    pub total: u32,
    /// True exactly once: on the call that closed the batch.
    pub closed_now: bool,
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<SessionId, SessionRow>,
    generations: HashMap<GenerationId, GenerationRow>,
    batches: HashMap<BatchId, BatchRow>,
}

/// Shared in-memory state.
#[derive(Default)]
pub struct Store {
    inner: RwLock<StoreInner>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- sessions ----

    pub async fn create_session(&self, flow_kind: FlowKind, config: Option<Value>) -> SessionRow {
        let session = SessionRow {
            id: uuid::Uuid::new_v4().to_string(),
            flow_kind,
            created_at: chrono::Utc::now(),
            current_stage: 0,
            phase: StagePhase::Configuring,
            config,
            intent: serde_json::json!({
                "preferences": [],
                "rejections": [],
                "pinned_traits": [],
            }),
        };
        self.inner
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        session
    }

    pub async fn session(&self, id: &str) -> Option<SessionRow> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    /// Remove a session with everything attached to it. Returns the ids of
    /// its generations so the caller can cancel in-flight work.
    pub async fn delete_session(&self, id: &str) -> Option<Vec<GenerationId>> {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(id)?;
        let generation_ids: Vec<GenerationId> = inner
            .generations
            .values()
            .filter(|g| g.session_id == id)
            .map(|g| g.id.clone())
            .collect();
        inner.generations.retain(|_, g| g.session_id != id);
        inner.batches.retain(|_, b| b.session_id != id);
        Some(generation_ids)
    }

    /// Apply a phase transition and optionally advance the stage.
    pub async fn update_session_iteration(
        &self,
        id: &str,
        phase: StagePhase,
        stage: Option<u32>,
    ) -> Option<SessionRow> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(id)?;
        session.phase = phase;
        if let Some(stage) = stage {
            session.current_stage = stage;
        }
        Some(session.clone())
    }

    /// Append an entry to one of the session's intent lists.
    pub async fn append_intent(&self, id: &str, list: &str, entry: Value) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(id) {
            if let Some(items) = session
                .intent
                .get_mut(list)
                .and_then(Value::as_array_mut)
            {
                items.push(entry);
            }
        }
    }

    // ---- generations ----

    pub async fn insert_generation(&self, generation: GenerationRow) {
        self.inner
            .write()
            .await
            .generations
            .insert(generation.id.clone(), generation);
    }

    pub async fn generation(&self, id: &str) -> Option<GenerationRow> {
        self.inner.read().await.generations.get(id).cloned()
    }

    /// Generations of a session, optionally filtered by stage, oldest first.
    pub async fn list_generations(
        &self,
        session_id: &str,
        stage: Option<u32>,
    ) -> Vec<GenerationRow> {
        let inner = self.inner.read().await;
        let mut rows: Vec<GenerationRow> = inner
            .generations
            .values()
            .filter(|g| g.session_id == session_id && stage.is_none_or(|s| g.stage == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows
    }

    /// queued -> dispatched, recording the worker-side job id.
    pub async fn mark_dispatched(&self, id: &str, worker_job_id: &str) -> bool {
        self.transition(id, GenerationStatus::Dispatched, |g| {
            g.worker_job_id = Some(worker_job_id.to_string());
        })
        .await
    }

    /// dispatched -> running, on the first progress event.
    pub async fn mark_running(&self, id: &str) -> bool {
        self.transition(id, GenerationStatus::Running, |_| {}).await
    }

    /// Any live state -> complete, with outputs.
    pub async fn mark_complete(
        &self,
        id: &str,
        artifact: ArtifactRef,
        seed: i64,
        elapsed_ms: u64,
    ) -> bool {
        self.transition(id, GenerationStatus::Complete, |g| {
            g.artifact = Some(artifact);
            g.seed = seed;
            g.elapsed_ms = Some(elapsed_ms);
        })
        .await
    }

    /// Any live state -> failed, with a reason.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> bool {
        self.transition(id, GenerationStatus::Failed, |g| {
            g.error = Some(reason.to_string());
        })
        .await
    }

    async fn transition<F>(&self, id: &str, to: GenerationStatus, apply: F) -> bool
    where
        F: FnOnce(&mut GenerationRow),
    {
        let mut inner = self.inner.write().await;
        let Some(generation) = inner.generations.get_mut(id) else {
            return false;
        };
        // Lifecycle is strictly forward; a terminal state never changes.
        if generation.status.is_terminal() || to.order() <= generation.status.order() {
            tracing::warn!(
                generation_id = id,
                from = %generation.status,
                to = %to,
                "Ignoring non-forward status transition",
            );
            return false;
        }
        generation.status = to;
        apply(generation);
        true
    }

    // ---- batches ----

    pub async fn create_batch(&self, batch: BatchRow) {
        self.inner
            .write()
            .await
            .batches
            .insert(batch.id.clone(), batch);
    }

    pub async fn batch(&self, id: &str) -> Option<BatchRow> {
        self.inner.read().await.batches.get(id).cloned()
    }

    /// Record one terminal batch member. The batch closes when every member
    /// has reached a terminal state, even if all failed.
    pub async fn note_batch_terminal(&self, id: &str, success: bool) -> Option<BatchTerminal> {
        let mut inner = self.inner.write().await;
        let batch = inner.batches.get_mut(id)?;
        if success {
            batch.completed += 1;
        } else {
            batch.failed += 1;
        }
        let closed_now = !batch.closed && batch.completed + batch.failed >= batch.total;
        if closed_now {
            batch.closed = true;
        }
        Some(BatchTerminal {
            completed: batch.completed,
            total: batch.total,
            closed_now,
        })
    }
}
