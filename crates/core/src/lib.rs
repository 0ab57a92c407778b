//! Core domain logic for the Atelier orchestrator.
//!
//! Everything in this crate is pure with respect to I/O: shared types and
//! identifiers, the error taxonomy, prompt keyword extraction, the preference
//! learning engine, task routing algorithms, the workflow template engine,
//! and iteration-funnel planning. Network and state plumbing live in
//! `atelier-worker` and `atelier-api`.

pub mod error;
pub mod iteration;
pub mod keywords;
pub mod preference;
pub mod routing;
pub mod template;
pub mod types;
