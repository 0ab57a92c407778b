//! Exponential-backoff reconnection for worker event streams.
//!
//! When a node's event stream drops, the pool calls [`reconnect_loop`] to
//! keep retrying with growing delays until the connection is restored or the
//! [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{WorkerClient, WorkerConnection};

/// Tunable parameters for the backoff strategy.
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Next backoff delay, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Retry connecting to a worker with exponential backoff.
///
/// Returns `Some(connection)` once a connection succeeds, or `None` if the
/// token fires first. A successful connection resets nothing here -- the
/// caller restarts from [`ReconnectConfig::initial_delay`] on the next drop.
pub async fn reconnect_loop(
    client: &WorkerClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<WorkerConnection> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::info!(
            node_id = %client.node_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to worker",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(node_id = %client.node_id(), "Reconnect cancelled");
                return None;
            }
            result = client.connect() => {
                match result {
                    Ok(conn) => {
                        tracing::info!(node_id = %client.node_id(), attempt, "Reconnected to worker");
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(
                            node_id = %client.node_id(),
                            error = %e,
                            "Reconnect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
