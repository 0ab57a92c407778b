//! Error taxonomy shared across the orchestrator.

use std::time::Duration;

/// Domain-level errors. Each variant maps to one error kind surfaced to
/// callers; the HTTP layer attaches status codes in `atelier-api`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Static configuration is invalid. Fatal at startup.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No healthy node satisfies the required capability.
    #[error("No capable node for {task} (requires capability '{capability}')")]
    NoCapableNode { task: String, capability: String },

    /// Network or protocol failure talking to a worker.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A deadline elapsed while waiting on a worker.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The worker refused or failed the submitted job graph.
    #[error("Worker rejected job: {0}")]
    RejectedByWorker(String),

    /// A template placeholder had no value to substitute.
    #[error("Missing template parameter '{0}'")]
    MissingParameter(String),

    /// Adapter injection was requested on a template that forbids it.
    #[error("Template '{0}' does not accept adapters")]
    UnsupportedAdapter(String),

    /// A referenced entity does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// A preference import could not be decoded or validated.
    #[error("Corrupt preference export: {0}")]
    CorruptExport(String),

    /// The job was aborted by session cancellation.
    #[error("Cancelled")]
    Cancelled,

    /// An invariant was violated inside the orchestrator.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the workspace.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable machine-readable tag for API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config_error",
            CoreError::NoCapableNode { .. } => "no_capable_node",
            CoreError::Transport(_) => "transport_error",
            CoreError::Timeout(_) => "timeout",
            CoreError::RejectedByWorker(_) => "rejected_by_worker",
            CoreError::MissingParameter(_) => "missing_parameter",
            CoreError::UnsupportedAdapter(_) => "unsupported_adapter",
            CoreError::NotFound { .. } => "not_found",
            CoreError::CorruptExport(_) => "corrupt_export",
            CoreError::Cancelled => "cancelled",
            CoreError::Internal(_) => "internal",
        }
    }
}
