use std::sync::Arc;

use atelier_core::preference::PreferenceEngine;
use atelier_core::template::TemplateEngine;
use atelier_worker::pool::WorkerPool;

use crate::aggregator::Aggregator;
use crate::config::ServerConfig;
use crate::controller::IterationController;
use crate::executor::JobExecutor;
use crate::registry::Registry;
use crate::store::Store;

/// Shared application state available to all handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Node inventory and runtime health.
    pub registry: Arc<Registry>,
    /// Sessions, generations, and batches.
    pub store: Arc<Store>,
    /// Per-node worker connections and asset catalog.
    pub pool: Arc<WorkerPool>,
    /// Workflow template store.
    pub templates: Arc<TemplateEngine>,
    /// Progress fan-in/fan-out hub.
    pub aggregator: Arc<Aggregator>,
    /// Generation orchestration.
    pub executor: Arc<JobExecutor>,
    /// Preference learning engine.
    pub preferences: Arc<PreferenceEngine>,
    /// Iteration funnel controller.
    pub controller: Arc<IterationController>,
}
