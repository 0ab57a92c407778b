//! Client library for the GPU workers' HTTP + WebSocket job API.
//!
//! Provides typed message parsing, job submission and history polling,
//! artifact retrieval, asset enumeration, reconnection logic, and the
//! per-node connection pool that feeds worker events into the orchestrator.

pub mod api;
pub mod client;
pub mod events;
pub mod history;
pub mod messages;
pub mod pool;
pub mod reconnect;
