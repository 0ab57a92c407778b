//! Normalized upstream events produced by the connection pool.
//!
//! These are the worker-side facts the orchestrator cares about, decoupled
//! from the wire format in [`crate::messages`]. The pool forwards them into
//! the aggregator's fan-in queue.

use atelier_core::types::{NodeId, WorkerJobId};

/// An event observed on one worker node's stream.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The event stream to a node was (re)established.
    Connected { node_id: NodeId },

    /// The event stream to a node was lost; reconnection is underway.
    Disconnected { node_id: NodeId },

    /// Step-level progress. `worker_job_id` may be absent on some workers.
    Progress {
        node_id: NodeId,
        worker_job_id: Option<WorkerJobId>,
        current_step: u32,
        total_steps: u32,
    },

    /// A graph node produced output (the terminal result still comes from
    /// history polling).
    Executed {
        node_id: NodeId,
        worker_job_id: WorkerJobId,
        output: serde_json::Value,
    },

    /// The worker reported an execution error for a job.
    ExecutionError {
        node_id: NodeId,
        worker_job_id: WorkerJobId,
        message: String,
    },

    /// The worker's internal queue depth changed.
    QueueDepth { node_id: NodeId, remaining: u32 },
}
