//! Node registry: the canonical source of truth for inventory and runtime
//! health.
//!
//! One `RwLock` guards the whole map, so a snapshot always sees every field
//! of a node consistently. Writers are the health prober (`update_health`)
//! and the executor (`bump_queue`).

use std::collections::HashMap;

use atelier_core::error::{CoreError, CoreResult};
use atelier_core::types::{NodeConfig, NodeId, NodeSnapshot, CAPABILITY_TAGS};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct NodeState {
    config: NodeConfig,
    healthy: bool,
    last_latency_ms: f64,
    queue_depth: u32,
    health_transitions: u64,
}

impl NodeState {
    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            vram_gb: self.config.vram_gb,
            tier: self.config.tier,
            host: self.config.host.clone(),
            port: self.config.port,
            capabilities: self.config.capabilities.clone(),
            max_resolution: self.config.max_resolution,
            max_batch: self.config.max_batch,
            healthy: self.healthy,
            last_latency_ms: self.last_latency_ms,
            queue_depth: self.queue_depth,
            health_transitions: self.health_transitions,
        }
    }
}

/// Thread-safe node inventory with runtime state.
#[derive(Default)]
pub struct Registry {
    nodes: RwLock<HashMap<NodeId, NodeState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inventory atomically.
    ///
    /// Validates ids and capability tags before touching the current state;
    /// runtime fields carry over for node ids that persist across a reload.
    pub async fn load(&self, configs: Vec<NodeConfig>) -> CoreResult<()> {
        let mut incoming: HashMap<NodeId, NodeConfig> = HashMap::with_capacity(configs.len());
        for config in configs {
            if config.id.is_empty() {
                return Err(CoreError::Config("node with empty id".into()));
            }
            for tag in &config.capabilities {
                if !CAPABILITY_TAGS.contains(&tag.as_str()) {
                    return Err(CoreError::Config(format!(
                        "node '{}' declares unknown capability tag '{tag}'",
                        config.id
                    )));
                }
            }
            if incoming.insert(config.id.clone(), config).is_some() {
                return Err(CoreError::Config("duplicate node id in inventory".into()));
            }
        }

        let mut nodes = self.nodes.write().await;
        let mut next = HashMap::with_capacity(incoming.len());
        for (id, config) in incoming {
            let state = match nodes.remove(&id) {
                Some(existing) => NodeState { config, ..existing },
                None => {
                    tracing::info!(node_id = %id, tier = %config.tier, "Registered node");
                    NodeState {
                        config,
                        healthy: false,
                        last_latency_ms: 0.0,
                        queue_depth: 0,
                        health_transitions: 0,
                    }
                }
            };
            next.insert(id, state);
        }
        for id in nodes.keys() {
            tracing::info!(node_id = %id, "Node removed from inventory");
        }
        *nodes = next;
        Ok(())
    }

    /// A consistent snapshot of one node.
    pub async fn get(&self, node_id: &str) -> CoreResult<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        nodes
            .get(node_id)
            .map(NodeState::snapshot)
            .ok_or_else(|| CoreError::NotFound {
                entity: "node",
                id: node_id.to_string(),
            })
    }

    /// Healthy nodes carrying a capability tag.
    pub async fn capable(&self, tag: &str) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        let mut out: Vec<NodeSnapshot> = nodes
            .values()
            .filter(|n| n.healthy && n.config.capabilities.contains(tag))
            .map(NodeState::snapshot)
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// A consistent snapshot of every node, sorted by id.
    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        let mut out: Vec<NodeSnapshot> = nodes.values().map(NodeState::snapshot).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Record a probe result. Health transitions are counted and logged.
    pub async fn update_health(&self, node_id: &str, healthy: bool, latency_ms: f64) {
        let mut nodes = self.nodes.write().await;
        let Some(state) = nodes.get_mut(node_id) else {
            return;
        };
        if state.healthy != healthy {
            state.health_transitions += 1;
            if healthy {
                tracing::info!(node_id, latency_ms, "Node became healthy");
            } else {
                tracing::warn!(node_id, "Node became unhealthy");
            }
        }
        state.healthy = healthy;
        if healthy {
            state.last_latency_ms = latency_ms;
        }
    }

    /// Adjust a node's tracked queue depth by +1 or -1, saturating at zero.
    pub async fn bump_queue(&self, node_id: &str, delta: i32) {
        let mut nodes = self.nodes.write().await;
        if let Some(state) = nodes.get_mut(node_id) {
            state.queue_depth = state.queue_depth.saturating_add_signed(delta);
        }
    }

    /// (healthy, total) node counts for the health endpoint.
    pub async fn counts(&self) -> (usize, usize) {
        let nodes = self.nodes.read().await;
        let healthy = nodes.values().filter(|n| n.healthy).count();
        (healthy, nodes.len())
    }
}
