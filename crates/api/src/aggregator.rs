//! Progress aggregator: fan-in from all worker streams, fan-out to
//! per-session subscribers.
//!
//! Every event -- upstream progress from the worker pool and terminal events
//! from the executor -- flows through one bounded intake queue drained by a
//! single task. That single consumer gives each generation a total order:
//! progress is delivered in upstream order, terminals are delivered last,
//! and any progress frame that arrives after a terminal finds its
//! correlation gone and is discarded.
//!
//! Subscriber channels are bounded. Progress events are dropped when a
//! subscriber is saturated; `complete`, `error`, and `batch-complete` are
//! always delivered (awaiting space if needed). A subscriber whose channel
//! is closed is evicted; the rest keep receiving.

use std::collections::HashMap;
use std::sync::Arc;

use atelier_core::error::{CoreError, CoreResult};
use atelier_core::types::{BatchId, GenerationId, NodeId, SessionId, WorkerJobId};
use atelier_worker::events::WorkerEvent;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::store::Store;

/// Bound on the intake queue between producers and the fan-out task.
const INTAKE_CAPACITY: usize = 1024;

/// Bound on each session subscriber's channel.
const SUBSCRIBER_CAPACITY: usize = 64;

/// Normalized event delivered to session subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "progress")]
    Progress {
        generation_id: GenerationId,
        current_step: u32,
        total_steps: u32,
    },

    #[serde(rename = "complete")]
    Complete {
        generation_id: GenerationId,
        artifact_url: String,
        thumbnail_url: String,
        seed: i64,
        elapsed_ms: u64,
        node_id: NodeId,
    },

    #[serde(rename = "batch-progress")]
    BatchProgress {
        batch_id: BatchId,
        completed: u32,
        total: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        latest_complete: Option<GenerationId>,
    },

    #[serde(rename = "batch-complete")]
    BatchComplete {
        batch_id: BatchId,
        total: u32,
        elapsed_ms: u64,
    },

    #[serde(rename = "error")]
    Error {
        generation_id: GenerationId,
        message: String,
    },
}

impl SessionEvent {
    /// Critical events are never dropped under backpressure.
    fn is_critical(&self) -> bool {
        matches!(
            self,
            SessionEvent::Complete { .. }
                | SessionEvent::Error { .. }
                | SessionEvent::BatchComplete { .. }
        )
    }

    /// The generation this event terminates, if it is a terminal event.
    fn terminal_generation(&self) -> Option<&GenerationId> {
        match self {
            SessionEvent::Complete { generation_id, .. }
            | SessionEvent::Error { generation_id, .. } => Some(generation_id),
            _ => None,
        }
    }
}

/// Work items flowing through the intake queue.
#[derive(Debug)]
enum Intake {
    Upstream(WorkerEvent),
    Deliver {
        session_id: SessionId,
        event: SessionEvent,
    },
}

#[derive(Debug, Clone)]
struct Correlation {
    generation_id: GenerationId,
    session_id: SessionId,
    node_id: NodeId,
    /// Insertion order, used to attribute progress frames that arrive
    /// without a worker job id to the node's oldest live job.
    seq: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
}

#[derive(Default)]
struct AggregatorInner {
    correlations: HashMap<WorkerJobId, Correlation>,
    /// Every worker job id ever registered; enforces at-most-once
    /// correlation across the process lifetime.
    seen: std::collections::HashSet<WorkerJobId>,
    subscribers: HashMap<SessionId, Vec<Subscriber>>,
    next_seq: u64,
    next_subscriber_id: u64,
}

/// The fan-in/fan-out hub.
pub struct Aggregator {
    inner: RwLock<AggregatorInner>,
    intake_tx: mpsc::Sender<Intake>,
    store: Arc<Store>,
}

impl Aggregator {
    /// Create the aggregator. The returned receiver must be passed to
    /// [`Aggregator::run`].
    pub fn new(store: Arc<Store>) -> (Arc<Self>, AggregatorIntake) {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let aggregator = Arc::new(Self {
            inner: RwLock::new(AggregatorInner::default()),
            intake_tx,
            store,
        });
        (aggregator, AggregatorIntake { rx: intake_rx })
    }

    /// A sender that feeds upstream worker events into the intake queue.
    ///
    /// Handed to the worker pool; the pool's connection tasks block on it,
    /// so the workers' own queues bound upstream concurrency.
    pub fn upstream_sender(&self) -> mpsc::Sender<WorkerEvent> {
        let (tx, mut rx) = mpsc::channel::<WorkerEvent>(INTAKE_CAPACITY);
        let intake_tx = self.intake_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if intake_tx.send(Intake::Upstream(event)).await.is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Map a worker job id to its generation and session.
    ///
    /// Each worker job id may be registered at most once per process
    /// lifetime; a repeat is an internal error and is refused.
    pub async fn register(
        &self,
        worker_job_id: &str,
        generation_id: &str,
        session_id: &str,
        node_id: &str,
    ) -> CoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.seen.insert(worker_job_id.to_string()) {
            return Err(CoreError::Internal(format!(
                "worker job id '{worker_job_id}' registered twice"
            )));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.correlations.insert(
            worker_job_id.to_string(),
            Correlation {
                generation_id: generation_id.to_string(),
                session_id: session_id.to_string(),
                node_id: node_id.to_string(),
                seq,
            },
        );
        Ok(())
    }

    /// Subscribe to a session's event feed.
    pub async fn subscribe(&self, session_id: &str) -> (u64, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut inner = self.inner.write().await;
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner
            .subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Drop one subscriber from a session.
    pub async fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(subscribers) = inner.subscribers.get_mut(session_id) {
            subscribers.retain(|s| s.id != subscriber_id);
            if subscribers.is_empty() {
                inner.subscribers.remove(session_id);
            }
        }
    }

    /// Queue an event for delivery to a session's subscribers.
    ///
    /// Used by the executor for terminal and batch events, so they pass
    /// through the same ordered pipeline as upstream progress.
    pub async fn deliver(&self, session_id: &str, event: SessionEvent) {
        let _ = self
            .intake_tx
            .send(Intake::Deliver {
                session_id: session_id.to_string(),
                event,
            })
            .await;
    }

    /// Drain the intake queue until it closes or the token fires.
    pub async fn run(&self, intake: AggregatorIntake, cancel: CancellationToken) {
        let mut rx = intake.rx;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => {
                    match item {
                        Some(Intake::Upstream(event)) => self.handle_upstream(event).await,
                        Some(Intake::Deliver { session_id, event }) => {
                            if let Some(generation_id) = event.terminal_generation() {
                                self.finish_generation(generation_id).await;
                            }
                            self.emit(&session_id, event).await;
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::info!("Aggregator fan-out stopped");
    }

    async fn handle_upstream(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress {
                node_id,
                worker_job_id,
                current_step,
                total_steps,
            } => {
                let Some(correlation) = self.resolve(worker_job_id.as_deref(), &node_id).await
                else {
                    return;
                };
                // First progress for a dispatched job flips it to running.
                self.store.mark_running(&correlation.generation_id).await;
                self.emit(
                    &correlation.session_id,
                    SessionEvent::Progress {
                        generation_id: correlation.generation_id.clone(),
                        current_step,
                        total_steps,
                    },
                )
                .await;
            }
            WorkerEvent::ExecutionError {
                node_id,
                worker_job_id,
                message,
            } => {
                // The executor's poll loop is the terminal authority; the
                // stream-side error is informational.
                tracing::warn!(
                    node_id = %node_id,
                    worker_job_id = %worker_job_id,
                    error = %message,
                    "Worker stream reported an execution error",
                );
            }
            WorkerEvent::Executed { node_id, worker_job_id, .. } => {
                tracing::debug!(
                    node_id = %node_id,
                    worker_job_id = %worker_job_id,
                    "Worker node produced output",
                );
            }
            WorkerEvent::QueueDepth { node_id, remaining } => {
                tracing::trace!(node_id = %node_id, remaining, "Worker queue status");
            }
            WorkerEvent::Connected { node_id } => {
                tracing::info!(node_id = %node_id, "Worker event stream connected");
            }
            WorkerEvent::Disconnected { node_id } => {
                // Reconnection is silent toward subscribers.
                tracing::warn!(node_id = %node_id, "Worker event stream disconnected");
            }
        }
    }

    /// Find the correlation for a progress frame: by worker job id when
    /// present, otherwise the oldest live job on the emitting node.
    async fn resolve(&self, worker_job_id: Option<&str>, node_id: &str) -> Option<Correlation> {
        let inner = self.inner.read().await;
        match worker_job_id {
            Some(id) => inner.correlations.get(id).cloned(),
            None => inner
                .correlations
                .values()
                .filter(|c| c.node_id == node_id)
                .min_by_key(|c| c.seq)
                .cloned(),
        }
    }

    /// Remove the correlation for a generation that just went terminal, so
    /// later upstream frames for it are discarded.
    async fn finish_generation(&self, generation_id: &str) {
        let mut inner = self.inner.write().await;
        inner
            .correlations
            .retain(|_, c| c.generation_id != generation_id);
    }

    /// Send one event to every subscriber of a session.
    async fn emit(&self, session_id: &str, event: SessionEvent) {
        let subscribers: Vec<(u64, mpsc::Sender<SessionEvent>)> = {
            let inner = self.inner.read().await;
            match inner.subscribers.get(session_id) {
                Some(subs) => subs.iter().map(|s| (s.id, s.tx.clone())).collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, tx) in subscribers {
            if event.is_critical() {
                if tx.send(event.clone()).await.is_err() {
                    dead.push(id);
                }
            } else {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!(session_id, "Subscriber saturated, dropping progress");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            if let Some(subs) = inner.subscribers.get_mut(session_id) {
                subs.retain(|s| !dead.contains(&s.id));
                if subs.is_empty() {
                    inner.subscribers.remove(session_id);
                }
            }
        }
    }

    /// Number of live correlations, for tests and diagnostics.
    pub async fn live_correlations(&self) -> usize {
        self.inner.read().await.correlations.len()
    }
}

/// Receiver half of the intake queue, consumed by [`Aggregator::run`].
pub struct AggregatorIntake {
    rx: mpsc::Receiver<Intake>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GenerationRow;
    use atelier_core::types::{
        GenerationParams, GenerationStatus, ModelFamily, TaskClass,
    };

    async fn setup() -> (Arc<Store>, Arc<Aggregator>, CancellationToken) {
        let store = Arc::new(Store::new());
        let (aggregator, intake) = Aggregator::new(Arc::clone(&store));
        let cancel = CancellationToken::new();
        let run_aggregator = Arc::clone(&aggregator);
        let run_cancel = cancel.clone();
        tokio::spawn(async move { run_aggregator.run(intake, run_cancel).await });
        (store, aggregator, cancel)
    }

    fn generation(id: &str, session: &str) -> GenerationRow {
        GenerationRow {
            id: id.into(),
            session_id: session.into(),
            stage: 0,
            batch_id: None,
            task_class: TaskClass::Draft,
            model_family: ModelFamily::Sd15,
            prompt: "castle".into(),
            negative_prompt: String::new(),
            model: "base.safetensors".into(),
            adapters: vec![],
            params: GenerationParams::default(),
            seed: 1,
            node_id: Some("gpu-1".into()),
            worker_job_id: Some("wj-1".into()),
            status: GenerationStatus::Queued,
            error: None,
            artifact: None,
            elapsed_ms: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn progress(node: &str, job: Option<&str>, step: u32) -> WorkerEvent {
        WorkerEvent::Progress {
            node_id: node.into(),
            worker_job_id: job.map(str::to_string),
            current_step: step,
            total_steps: 20,
        }
    }

    #[tokio::test]
    async fn progress_routes_to_the_right_session_in_order() {
        let (store, aggregator, _cancel) = setup().await;
        store.insert_generation(generation("g1", "s1")).await;
        store.mark_dispatched("g1", "wj-1").await;
        aggregator.register("wj-1", "g1", "s1", "gpu-1").await.unwrap();

        let (_, mut rx) = aggregator.subscribe("s1").await;
        let upstream = aggregator.upstream_sender();
        for step in 1..=3 {
            upstream.send(progress("gpu-1", Some("wj-1"), step)).await.unwrap();
        }

        for expected in 1..=3 {
            match rx.recv().await.unwrap() {
                SessionEvent::Progress {
                    generation_id,
                    current_step,
                    ..
                } => {
                    assert_eq!(generation_id, "g1");
                    assert_eq!(current_step, expected);
                }
                other => panic!("expected Progress, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn first_progress_marks_the_job_running() {
        let (store, aggregator, _cancel) = setup().await;
        store.insert_generation(generation("g1", "s1")).await;
        store.mark_dispatched("g1", "wj-1").await;
        aggregator.register("wj-1", "g1", "s1", "gpu-1").await.unwrap();

        let (_, mut rx) = aggregator.subscribe("s1").await;
        let upstream = aggregator.upstream_sender();
        upstream.send(progress("gpu-1", Some("wj-1"), 1)).await.unwrap();
        rx.recv().await.unwrap();

        assert_eq!(
            store.generation("g1").await.unwrap().status,
            GenerationStatus::Running
        );
    }

    #[tokio::test]
    async fn progress_without_job_id_goes_to_the_nodes_oldest_job() {
        let (store, aggregator, _cancel) = setup().await;
        store.insert_generation(generation("g1", "s1")).await;
        let mut g2 = generation("g2", "s1");
        g2.worker_job_id = Some("wj-2".into());
        store.insert_generation(g2).await;
        aggregator.register("wj-1", "g1", "s1", "gpu-1").await.unwrap();
        aggregator.register("wj-2", "g2", "s1", "gpu-1").await.unwrap();

        let (_, mut rx) = aggregator.subscribe("s1").await;
        let upstream = aggregator.upstream_sender();
        upstream.send(progress("gpu-1", None, 5)).await.unwrap();

        match rx.recv().await.unwrap() {
            SessionEvent::Progress { generation_id, .. } => assert_eq!(generation_id, "g1"),
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_worker_job_id_is_refused_forever() {
        let (_store, aggregator, _cancel) = setup().await;
        aggregator.register("wj-1", "g1", "s1", "gpu-1").await.unwrap();
        assert!(aggregator.register("wj-1", "g2", "s1", "gpu-1").await.is_err());

        // Even after the first correlation is gone.
        aggregator.finish_generation("g1").await;
        assert_eq!(aggregator.live_correlations().await, 0);
        assert!(aggregator.register("wj-1", "g3", "s1", "gpu-1").await.is_err());
    }

    #[tokio::test]
    async fn no_progress_after_terminal() {
        let (store, aggregator, _cancel) = setup().await;
        store.insert_generation(generation("g1", "s1")).await;
        store.mark_dispatched("g1", "wj-1").await;
        aggregator.register("wj-1", "g1", "s1", "gpu-1").await.unwrap();

        let (_, mut rx) = aggregator.subscribe("s1").await;
        let upstream = aggregator.upstream_sender();

        upstream.send(progress("gpu-1", Some("wj-1"), 19)).await.unwrap();
        // Let the progress frame reach the intake queue before the terminal.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        aggregator
            .deliver(
                "s1",
                SessionEvent::Complete {
                    generation_id: "g1".into(),
                    artifact_url: "/generate/g1/artifact".into(),
                    thumbnail_url: "/generate/g1/thumbnail".into(),
                    seed: 42,
                    elapsed_ms: 900,
                    node_id: "gpu-1".into(),
                },
            )
            .await;
        // A stale progress frame arriving after the terminal event.
        upstream.send(progress("gpu-1", Some("wj-1"), 20)).await.unwrap();

        match rx.recv().await.unwrap() {
            SessionEvent::Progress { current_step, .. } => assert_eq!(current_step, 19),
            other => panic!("expected Progress, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            SessionEvent::Complete { generation_id, .. } => assert_eq!(generation_id, "g1"),
            other => panic!("expected Complete, got {other:?}"),
        }
        // The stale frame was discarded; nothing further arrives.
        let next = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
        assert!(next.is_err(), "expected silence after terminal, got {next:?}");
    }

    #[tokio::test]
    async fn dead_subscriber_is_evicted_and_others_keep_receiving() {
        let (store, aggregator, _cancel) = setup().await;
        store.insert_generation(generation("g1", "s1")).await;
        store.mark_dispatched("g1", "wj-1").await;
        aggregator.register("wj-1", "g1", "s1", "gpu-1").await.unwrap();

        let (_dead_id, dead_rx) = aggregator.subscribe("s1").await;
        let (_, mut live_rx) = aggregator.subscribe("s1").await;
        drop(dead_rx);

        let upstream = aggregator.upstream_sender();
        upstream.send(progress("gpu-1", Some("wj-1"), 1)).await.unwrap();

        match live_rx.recv().await.unwrap() {
            SessionEvent::Progress { current_step, .. } => assert_eq!(current_step, 1),
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn saturated_subscriber_drops_progress_but_never_terminals() {
        let (store, aggregator, _cancel) = setup().await;
        store.insert_generation(generation("g1", "s1")).await;
        store.mark_dispatched("g1", "wj-1").await;
        aggregator.register("wj-1", "g1", "s1", "gpu-1").await.unwrap();

        let (_, mut rx) = aggregator.subscribe("s1").await;
        let upstream = aggregator.upstream_sender();

        // Saturate the subscriber channel without draining it.
        for step in 0..(SUBSCRIBER_CAPACITY as u32 + 20) {
            upstream.send(progress("gpu-1", Some("wj-1"), step)).await.unwrap();
        }
        aggregator
            .deliver(
                "s1",
                SessionEvent::Error {
                    generation_id: "g1".into(),
                    message: "boom".into(),
                },
            )
            .await;

        // Drain: some progress events were dropped, the error was not.
        let mut saw_error = false;
        let mut progress_count = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await
        {
            match event {
                SessionEvent::Progress { .. } => progress_count += 1,
                SessionEvent::Error { .. } => {
                    saw_error = true;
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_error);
        assert!(progress_count <= SUBSCRIBER_CAPACITY);
    }
}
