//! REST client for a worker's HTTP endpoints.
//!
//! Wraps job submission, cancellation, history retrieval, artifact download,
//! source-image upload, asset enumeration, and the status probe. Every call
//! carries an explicit timeout matching the orchestrator's deadlines.

use std::time::Duration;

use atelier_core::error::{CoreError, CoreResult};
use serde::Deserialize;
use serde_json::Value;

/// Timeout for job-graph submission.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for a single history poll.
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for artifact downloads.
pub const ARTIFACT_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for the health probe.
pub const STATS_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for asset enumeration.
pub const ASSETS_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for a single worker node.
pub struct WorkerApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response from the worker's submit endpoint after queuing a job graph.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Worker-assigned job identifier.
    pub prompt_id: String,
    /// Position in the worker's execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Models and adapters loadable on one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerAssets {
    pub models: Vec<String>,
    pub adapters: Vec<String>,
}

impl WorkerApi {
    /// Create an API client for a worker.
    ///
    /// * `api_url` - base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling across
    /// nodes).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a job graph for execution.
    ///
    /// A transport failure is [`CoreError::Transport`]; a non-2xx response or
    /// a validation error in the body is [`CoreError::RejectedByWorker`].
    pub async fn submit(&self, graph: &Value, client_id: &str) -> CoreResult<SubmitResponse> {
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;

        let status = response.status();
        let payload: Value = if status.is_success() {
            response.json().await.map_err(transport_err)?
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::RejectedByWorker(format!("{status}: {body}")));
        };

        if let Some(error) = payload.get("error") {
            return Err(CoreError::RejectedByWorker(error.to_string()));
        }

        serde_json::from_value(payload)
            .map_err(|e| CoreError::Transport(format!("malformed submit response: {e}")))
    }

    /// Ask the worker to drop a queued job, best effort.
    pub async fn cancel(&self, worker_job_id: &str) -> CoreResult<()> {
        let body = serde_json::json!({ "delete": [worker_job_id] });
        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Interrupt whatever the worker is executing right now.
    pub async fn interrupt(&self) -> CoreResult<()> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Fetch the history entry for a job, or `None` while the worker has
    /// nothing to report yet.
    pub async fn history(&self, worker_job_id: &str) -> CoreResult<Option<Value>> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, worker_job_id))
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;
        let response = ensure_success(response).await?;
        let payload: Value = response.json().await.map_err(transport_err)?;
        Ok(payload.get(worker_job_id).cloned())
    }

    /// Download a generated artifact.
    pub async fn fetch_artifact(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> CoreResult<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .timeout(ARTIFACT_TIMEOUT)
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ])
            .send()
            .await
            .map_err(transport_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::NotFound {
                entity: "artifact",
                id: filename.to_string(),
            });
        }
        let response = ensure_success(response).await?;
        let bytes = response.bytes().await.map_err(transport_err)?;
        Ok(bytes.to_vec())
    }

    /// Upload an image to the worker's input store (for img2img sources).
    ///
    /// Returns the filename the worker stored it under.
    pub async fn upload_image(&self, filename: &str, bytes: Vec<u8>) -> CoreResult<String> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")
            .map_err(|e| CoreError::Internal(format!("invalid upload mime: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .timeout(ARTIFACT_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(transport_err)?;
        let response = ensure_success(response).await?;
        let payload: Value = response.json().await.map_err(transport_err)?;
        Ok(payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(filename)
            .to_string())
    }

    /// Probe the worker's status endpoint. Success means the node is up.
    pub async fn system_stats(&self) -> CoreResult<()> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(STATS_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Enumerate the models and adapters loadable on this worker.
    ///
    /// Parses the worker's object-info document: loadable names are the
    /// first required-input choice list of the respective loader class.
    pub async fn list_assets(&self) -> CoreResult<WorkerAssets> {
        let response = self
            .client
            .get(format!("{}/object_info", self.api_url))
            .timeout(ASSETS_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;
        let response = ensure_success(response).await?;
        let info: Value = response.json().await.map_err(transport_err)?;

        Ok(WorkerAssets {
            models: choice_list(&info, "CheckpointLoaderSimple", "ckpt_name"),
            adapters: choice_list(&info, "LoraLoader", "lora_name"),
        })
    }
}

/// Extract a loader class's choice list from an object-info document.
fn choice_list(info: &Value, class_name: &str, input_name: &str) -> Vec<String> {
    info.get(class_name)
        .and_then(|c| c.get("input"))
        .and_then(|i| i.get("required"))
        .and_then(|r| r.get(input_name))
        .and_then(|v| v.get(0))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn transport_err(e: reqwest::Error) -> CoreError {
    CoreError::Transport(e.to_string())
}

/// Ensure a 2xx status, mapping failures to [`CoreError::Transport`] with
/// the body text preserved for debugging.
async fn ensure_success(response: reqwest::Response) -> CoreResult<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(CoreError::Transport(format!(
            "worker returned {status}: {body}"
        )));
    }
    Ok(response)
}
