//! Per-node worker connection pool.
//!
//! [`WorkerPool`] owns one long-lived connection task per node (connect ->
//! read frames -> forward events -> reconnect) plus a periodic asset-catalog
//! refresh. Job submission and cancellation go through the pooled HTTP
//! clients; parsed stream frames are forwarded as [`WorkerEvent`]s into the
//! channel handed to [`WorkerPool::start`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use atelier_core::error::{CoreError, CoreResult};
use atelier_core::types::{NodeConfig, NodeId};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_util::sync::CancellationToken;

use crate::api::{SubmitResponse, WorkerApi};
use crate::client::WorkerClient;
use crate::events::WorkerEvent;
use crate::messages::{parse_message, WorkerMessage};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Application-level keepalive interval on the event stream.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between asset-catalog refreshes.
const ASSET_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Union of the assets available across the fleet, with per-node
/// availability.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    pub models: BTreeMap<String, BTreeSet<NodeId>>,
    pub adapters: BTreeMap<String, BTreeSet<NodeId>>,
}

impl AssetCatalog {
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

/// Internal bookkeeping for one node.
struct ManagedNode {
    api: Arc<WorkerApi>,
    client_id: String,
    task_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

/// Manages persistent connections to every node in the inventory.
pub struct WorkerPool {
    nodes: RwLock<HashMap<NodeId, ManagedNode>>,
    assets: RwLock<AssetCatalog>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Connect to every node and start the asset refresher.
    ///
    /// `event_tx` receives every upstream event; when it closes, connection
    /// tasks wind down.
    pub async fn start(
        configs: &[NodeConfig],
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            assets: RwLock::new(AssetCatalog::default()),
            cancel: CancellationToken::new(),
        });

        for config in configs {
            pool.spawn_connection(config, event_tx.clone()).await;
        }

        let refresher = Arc::clone(&pool);
        let refresh_cancel = pool.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ASSET_REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = refresh_cancel.cancelled() => break,
                    _ = ticker.tick() => refresher.refresh_assets().await,
                }
            }
        });

        pool
    }

    /// The HTTP client for a node.
    pub async fn api(&self, node_id: &str) -> CoreResult<Arc<WorkerApi>> {
        let nodes = self.nodes.read().await;
        nodes
            .get(node_id)
            .map(|n| Arc::clone(&n.api))
            .ok_or_else(|| CoreError::NotFound {
                entity: "node",
                id: node_id.to_string(),
            })
    }

    /// Submit a job graph to a node, tagged with the node's stream client id
    /// so its events route back over our subscription.
    pub async fn submit(
        &self,
        node_id: &str,
        graph: &serde_json::Value,
    ) -> CoreResult<SubmitResponse> {
        let (api, client_id) = {
            let nodes = self.nodes.read().await;
            let managed = nodes.get(node_id).ok_or_else(|| CoreError::NotFound {
                entity: "node",
                id: node_id.to_string(),
            })?;
            (Arc::clone(&managed.api), managed.client_id.clone())
        };
        let response = api.submit(graph, &client_id).await?;
        tracing::info!(
            node_id,
            worker_job_id = %response.prompt_id,
            queue_number = response.number,
            "Job graph submitted",
        );
        Ok(response)
    }

    /// Ask a node to drop a queued job. Best effort; errors are returned but
    /// callers typically just log them.
    pub async fn cancel_job(&self, node_id: &str, worker_job_id: &str) -> CoreResult<()> {
        let api = self.api(node_id).await?;
        api.cancel(worker_job_id).await
    }

    /// Current snapshot of the fleet-wide asset catalog.
    pub async fn assets(&self) -> AssetCatalog {
        self.assets.read().await.clone()
    }

    /// Re-enumerate assets on every node and rebuild the catalog.
    pub async fn refresh_assets(&self) {
        let apis: Vec<(NodeId, Arc<WorkerApi>)> = {
            let nodes = self.nodes.read().await;
            nodes
                .iter()
                .map(|(id, n)| (id.clone(), Arc::clone(&n.api)))
                .collect()
        };

        let mut catalog = AssetCatalog::default();
        let fetches = apis.iter().map(|(id, api)| async move {
            (id.clone(), api.list_assets().await)
        });
        for (node_id, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(assets) => {
                    for model in assets.models {
                        catalog.models.entry(model).or_default().insert(node_id.clone());
                    }
                    for adapter in assets.adapters {
                        catalog
                            .adapters
                            .entry(adapter)
                            .or_default()
                            .insert(node_id.clone());
                    }
                }
                Err(e) => {
                    tracing::debug!(node_id = %node_id, error = %e, "Asset enumeration failed");
                }
            }
        }

        tracing::debug!(
            models = catalog.models.len(),
            adapters = catalog.adapters.len(),
            "Asset catalog refreshed",
        );
        *self.assets.write().await = catalog;
    }

    /// Gracefully stop every connection task.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker pool");
        self.cancel.cancel();

        let mut nodes = self.nodes.write().await;
        for (id, managed) in nodes.drain() {
            managed.cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await;
            tracing::debug!(node_id = %id, "Connection task stopped");
        }
    }

    /// Spawn the long-lived connect/process/reconnect task for one node.
    async fn spawn_connection(&self, config: &NodeConfig, event_tx: mpsc::Sender<WorkerEvent>) {
        let node_id = config.id.clone();
        // The stream subscription and HTTP submissions share one client id,
        // so the worker addresses job events at our subscription.
        let client_id = uuid::Uuid::new_v4().to_string();
        let client = WorkerClient::new(node_id.clone(), config.ws_url(), client_id.clone());
        let api = Arc::new(WorkerApi::new(config.api_url()));
        let node_cancel = self.cancel.child_token();

        let task_cancel = node_cancel.clone();
        let task_node_id = node_id.clone();
        let task_handle = tokio::spawn(async move {
            tracing::info!(node_id = %task_node_id, "Starting worker connection task");
            run_connection_loop(&client, &task_node_id, &event_tx, &task_cancel).await;
            tracing::info!(node_id = %task_node_id, "Worker connection task exited");
        });

        self.nodes.write().await.insert(
            node_id,
            ManagedNode {
                api,
                client_id,
                task_handle,
                cancel: node_cancel,
            },
        );
    }
}

/// Core connection loop: connect -> process frames -> reconnect.
///
/// Reconnection is internal: higher layers only observe
/// [`WorkerEvent::Connected`] / [`WorkerEvent::Disconnected`].
async fn run_connection_loop(
    client: &WorkerClient,
    node_id: &str,
    event_tx: &mpsc::Sender<WorkerEvent>,
    cancel: &CancellationToken,
) {
    let reconnect_config = ReconnectConfig::default();

    loop {
        let conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(node_id, error = %e, "Connection failed, entering backoff");
                match reconnect_loop(client, &reconnect_config, cancel).await {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        let _ = event_tx
            .send(WorkerEvent::Connected {
                node_id: node_id.to_string(),
            })
            .await;

        let mut ws_stream = conn.ws_stream;
        process_frames(&mut ws_stream, node_id, event_tx, cancel).await;

        let _ = event_tx
            .send(WorkerEvent::Disconnected {
                node_id: node_id.to_string(),
            })
            .await;

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!(node_id, "Event stream lost, entering backoff");
        match reconnect_loop(client, &reconnect_config, cancel).await {
            Some(_) => continue,
            None => return,
        }
    }
}

/// Read frames until the stream drops, forwarding parsed messages as events
/// and pinging the worker on the keepalive interval.
async fn process_frames(
    ws_stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    node_id: &str,
    event_tx: &mpsc::Sender<WorkerEvent>,
    cancel: &CancellationToken,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_stream.send(Message::Close(None)).await;
                return;
            }
            _ = keepalive.tick() => {
                if ws_stream.send(Message::Ping(Bytes::new())).await.is_err() {
                    tracing::debug!(node_id, "Keepalive ping failed");
                    return;
                }
            }
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = frame_to_event(node_id, &text) {
                            if event_tx.send(event).await.is_err() {
                                return; // the orchestrator side went away
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // Preview image frames; not forwarded.
                        tracing::trace!(node_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(node_id, ?frame, "Worker closed the event stream");
                        return;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::warn!(node_id, error = %e, "Event stream receive error");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

/// Map one parsed frame to a forwarded event, if the orchestrator cares.
fn frame_to_event(node_id: &str, text: &str) -> Option<WorkerEvent> {
    let message = match parse_message(text) {
        Ok(message) => message,
        Err(e) => {
            // Unknown message kinds are tolerated and discarded.
            tracing::trace!(node_id, error = %e, "Discarding unrecognized frame");
            return None;
        }
    };

    match message {
        WorkerMessage::Progress(data) => Some(WorkerEvent::Progress {
            node_id: node_id.to_string(),
            worker_job_id: data.prompt_id,
            current_step: data.value,
            total_steps: data.max,
        }),
        WorkerMessage::Executed(data) => Some(WorkerEvent::Executed {
            node_id: node_id.to_string(),
            worker_job_id: data.prompt_id,
            output: data.output,
        }),
        WorkerMessage::ExecutionError(data) => Some(WorkerEvent::ExecutionError {
            node_id: node_id.to_string(),
            worker_job_id: data.prompt_id,
            message: data.exception_message,
        }),
        WorkerMessage::Status(data) => Some(WorkerEvent::QueueDepth {
            node_id: node_id.to_string(),
            remaining: data.status.exec_info.queue_remaining,
        }),
        WorkerMessage::ExecutionStart(data) => {
            tracing::debug!(node_id, worker_job_id = %data.prompt_id, "Execution started");
            None
        }
        WorkerMessage::Executing(data) => {
            if data.node.is_none() {
                tracing::debug!(
                    node_id,
                    worker_job_id = %data.prompt_id,
                    "Execution finished (completion confirmed via history)",
                );
            }
            None
        }
        WorkerMessage::ExecutionCached(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_frames_become_progress_events() {
        let text = r#"{"type":"progress","data":{"value":4,"max":20,"prompt_id":"p1"}}"#;
        match frame_to_event("gpu-1", text) {
            Some(WorkerEvent::Progress {
                node_id,
                worker_job_id,
                current_step,
                total_steps,
            }) => {
                assert_eq!(node_id, "gpu-1");
                assert_eq!(worker_job_id.as_deref(), Some("p1"));
                assert_eq!(current_step, 4);
                assert_eq!(total_steps, 20);
            }
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn status_frames_become_queue_depth_events() {
        let text = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}}}}"#;
        assert!(matches!(
            frame_to_event("gpu-1", text),
            Some(WorkerEvent::QueueDepth { remaining: 2, .. })
        ));
    }

    #[test]
    fn unknown_frames_are_discarded() {
        assert!(frame_to_event("gpu-1", r#"{"type":"novelty","data":{}}"#).is_none());
        assert!(frame_to_event("gpu-1", "garbage").is_none());
    }

    #[test]
    fn bookkeeping_frames_are_not_forwarded() {
        let start = r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#;
        assert!(frame_to_event("gpu-1", start).is_none());
        let done = r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#;
        assert!(frame_to_event("gpu-1", done).is_none());
    }
}
