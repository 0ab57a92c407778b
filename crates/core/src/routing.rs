//! Task routing: tier- and capability-sensitive node selection.
//!
//! All functions here are pure over node snapshots; the registry supplies
//! the snapshots and the executor applies the results.

use crate::error::{CoreError, CoreResult};
use crate::types::{ModelFamily, NodeSnapshot, TaskClass};

/// Queue depth above which the top candidate is considered overloaded and
/// the router spills to the first candidate below the threshold.
pub const OVERFLOW_THRESHOLD: u32 = 3;

/// The capability tag a task needs, derived from its class and the requested
/// model family.
pub fn required_capability(task: TaskClass, family: ModelFamily) -> &'static str {
    match task {
        TaskClass::Upscale => "upscale",
        TaskClass::Flux => "flux_fp8",
        TaskClass::FluxQuality => "flux",
        _ => family.capability_tag(),
    }
}

/// Rank candidate nodes for a task.
///
/// Healthy nodes carrying `capability` are sorted by tier (descending for
/// quality-class tasks, ascending otherwise) with queue depth as the
/// secondary key and node id as a deterministic tiebreak. A healthy, capable
/// preferred node is moved to the head. Finally, an overloaded head spills
/// to the first candidate strictly below [`OVERFLOW_THRESHOLD`].
pub fn rank_candidates(
    task: TaskClass,
    capability: &str,
    nodes: &[NodeSnapshot],
    preferred: Option<&str>,
) -> CoreResult<Vec<NodeSnapshot>> {
    let mut candidates: Vec<NodeSnapshot> = nodes
        .iter()
        .filter(|n| n.healthy && n.capabilities.contains(capability))
        .cloned()
        .collect();

    if candidates.is_empty() {
        return Err(CoreError::NoCapableNode {
            task: task.to_string(),
            capability: capability.to_string(),
        });
    }

    if task.is_quality_class() {
        candidates.sort_by(|a, b| {
            b.tier
                .rank()
                .cmp(&a.tier.rank())
                .then(a.queue_depth.cmp(&b.queue_depth))
                .then_with(|| a.id.cmp(&b.id))
        });
    } else {
        candidates.sort_by(|a, b| {
            a.tier
                .rank()
                .cmp(&b.tier.rank())
                .then(a.queue_depth.cmp(&b.queue_depth))
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    if let Some(preferred) = preferred {
        if let Some(pos) = candidates.iter().position(|n| n.id == preferred) {
            let node = candidates.remove(pos);
            candidates.insert(0, node);
        }
    }

    if candidates[0].queue_depth > OVERFLOW_THRESHOLD {
        if let Some(pos) = candidates
            .iter()
            .position(|n| n.queue_depth < OVERFLOW_THRESHOLD)
        {
            if pos > 0 {
                let node = candidates.remove(pos);
                candidates.insert(0, node);
                tracing::debug!(
                    node_id = %candidates[0].id,
                    "Overflow spill promoted an idle node",
                );
            }
        }
    }

    Ok(candidates)
}

/// Divide `total` jobs among `slots` candidates in order: each slot gets
/// `total / slots`, and the remainder goes to the first slots.
pub fn split_evenly(total: u32, slots: usize) -> Vec<u32> {
    if slots == 0 {
        return Vec::new();
    }
    let base = total / slots as u32;
    let remainder = total as usize % slots;
    (0..slots)
        .map(|i| base + u32::from(i < remainder))
        .collect()
}

/// How many models a batch should explore, given the recommendation
/// confidence and whether this is the draft stage.
///
/// High confidence exploits the single best model -- except at the draft
/// stage, which always explores broadly.
pub fn exploration_model_count(confidence: f64, draft_stage: bool) -> usize {
    if confidence >= 0.5 && !draft_stage {
        1
    } else if (0.3..0.5).contains(&confidence) {
        2
    } else {
        3
    }
}
