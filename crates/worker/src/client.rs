//! WebSocket client for a single worker node's event stream.
//!
//! [`WorkerClient`] holds the connection configuration; calling
//! [`WorkerClient::connect`] establishes a live [`WorkerConnection`].

use atelier_core::error::{CoreError, CoreResult};
use atelier_core::types::NodeId;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Configuration handle for one worker's event stream.
pub struct WorkerClient {
    node_id: NodeId,
    ws_url: String,
    client_id: String,
}

/// A live WebSocket connection to a worker.
pub struct WorkerConnection {
    /// Node this connection belongs to.
    pub node_id: NodeId,
    /// Unique client id sent during the handshake, so the worker can address
    /// messages back to this subscriber.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WorkerClient {
    /// Create a client targeting one worker's WebSocket endpoint.
    ///
    /// * `ws_url` - full event stream URL, e.g. `ws://host:8188/ws`.
    /// * `client_id` - shared with HTTP submissions so the worker addresses
    ///   job events at this subscription.
    pub fn new(node_id: NodeId, ws_url: String, client_id: String) -> Self {
        Self {
            node_id,
            ws_url,
            client_id,
        }
    }

    /// A client with a freshly generated id (UUID v4).
    pub fn with_generated_id(node_id: NodeId, ws_url: String) -> Self {
        Self::new(node_id, ws_url, uuid::Uuid::new_v4().to_string())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the worker's event stream, identifying as this client.
    pub async fn connect(&self) -> CoreResult<WorkerConnection> {
        let client_id = self.client_id.clone();
        let url = format!("{}?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            CoreError::Transport(format!(
                "failed to connect to worker at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            node_id = %self.node_id,
            client_id = %client_id,
            "Connected to worker event stream at {}",
            self.ws_url,
        );

        Ok(WorkerConnection {
            node_id: self.node_id.clone(),
            client_id,
            ws_stream,
        })
    }
}
