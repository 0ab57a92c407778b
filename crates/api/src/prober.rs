//! Periodic health probing of every node in the registry.
//!
//! Each tick probes all nodes concurrently against their status endpoint
//! with a short timeout. A single failed probe marks the node unhealthy
//! until a later tick succeeds; there is no intra-tick retry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// Timeout for a single status probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Background health prober.
pub struct HealthProber {
    registry: Arc<Registry>,
    client: reqwest::Client,
    interval: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
            interval,
        }
    }

    /// Run the probe loop until the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Health prober started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Health prober shutting down");
                    break;
                }
                _ = ticker.tick() => self.probe_all().await,
            }
        }
    }

    /// Probe every node once, concurrently.
    pub async fn probe_all(&self) {
        let nodes = self.registry.snapshot().await;
        let probes = nodes.iter().map(|node| {
            let url = format!("{}/system_stats", node.api_url());
            let client = self.client.clone();
            let id = node.id.clone();
            async move {
                let started = std::time::Instant::now();
                let healthy = matches!(
                    client.get(&url).timeout(PROBE_TIMEOUT).send().await,
                    Ok(response) if response.status().is_success()
                );
                (id, healthy, started.elapsed().as_secs_f64() * 1000.0)
            }
        });

        for (node_id, healthy, latency_ms) in futures::future::join_all(probes).await {
            self.registry
                .update_health(&node_id, healthy, latency_ms)
                .await;
        }
    }
}
