//! History-entry decoding and completion polling.
//!
//! The worker's history endpoint is the source of truth for job completion:
//! an entry with image outputs means the job finished, an entry whose status
//! carries an execution error means it failed, anything else means it is
//! still running. [`poll_until_complete`] drives the endpoint at a bounded
//! interval until a terminal state or the deadline.

use std::time::Duration;

use atelier_core::error::{CoreError, CoreResult};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::WorkerApi;

/// Default interval between history polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default deadline from dispatch to completion.
pub const POLL_DEADLINE: Duration = Duration::from_secs(300);

/// One output image referenced by a completed history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputImage {
    pub filename: String,
    pub subfolder: String,
    pub folder_type: String,
}

/// Terminal-or-not interpretation of one history entry.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    Running,
    Complete(Vec<OutputImage>),
    Failed(String),
}

/// Interpret a raw history entry.
pub fn parse_history_entry(entry: &Value) -> HistoryStatus {
    // Failure: the status block carries an error flag or message.
    if let Some(status) = entry.get("status") {
        let errored = status.get("status_str").and_then(Value::as_str) == Some("error");
        if errored {
            let message = status
                .get("messages")
                .and_then(Value::as_array)
                .and_then(|msgs| {
                    msgs.iter().find_map(|m| {
                        let pair = m.as_array()?;
                        if pair.first()?.as_str()? == "execution_error" {
                            pair.get(1)?
                                .get("exception_message")?
                                .as_str()
                                .map(str::to_string)
                        } else {
                            None
                        }
                    })
                })
                .unwrap_or_else(|| "worker reported an execution error".to_string());
            return HistoryStatus::Failed(message);
        }
    }

    let images = collect_output_images(entry);
    if images.is_empty() {
        HistoryStatus::Running
    } else {
        HistoryStatus::Complete(images)
    }
}

/// Collect every image reference from an entry's node outputs.
fn collect_output_images(entry: &Value) -> Vec<OutputImage> {
    let mut images = Vec::new();
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return images;
    };
    for node_output in outputs.values() {
        let Some(node_images) = node_output.get("images").and_then(Value::as_array) else {
            continue;
        };
        for img in node_images {
            let Some(filename) = img.get("filename").and_then(Value::as_str) else {
                continue;
            };
            images.push(OutputImage {
                filename: filename.to_string(),
                subfolder: img
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                folder_type: img
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("output")
                    .to_string(),
            });
        }
    }
    images
}

/// Poll a job's history until it completes, fails, times out, or the
/// cancellation token fires.
///
/// Transient transport errors during polling are logged and retried until
/// the deadline; the event-stream may be down while HTTP still works (or
/// vice versa), and the deadline bounds the overall wait either way.
pub async fn poll_until_complete(
    api: &WorkerApi,
    worker_job_id: &str,
    deadline: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> CoreResult<Vec<OutputImage>> {
    let started = tokio::time::Instant::now();

    loop {
        if started.elapsed() >= deadline {
            return Err(CoreError::Timeout(deadline));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            result = api.history(worker_job_id) => {
                match result {
                    Ok(Some(entry)) => match parse_history_entry(&entry) {
                        HistoryStatus::Complete(images) => return Ok(images),
                        HistoryStatus::Failed(message) => {
                            return Err(CoreError::RejectedByWorker(message));
                        }
                        HistoryStatus::Running => {}
                    },
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            worker_job_id,
                            error = %e,
                            "History poll failed, retrying until deadline",
                        );
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
