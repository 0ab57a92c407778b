use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use atelier_core::iteration::NoopRewriter;
use atelier_core::preference::PreferenceEngine;
use atelier_core::template::TemplateEngine;
use atelier_worker::pool::WorkerPool;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_api::aggregator::Aggregator;
use atelier_api::config::{load_node_inventory, ServerConfig};
use atelier_api::controller::IterationController;
use atelier_api::executor::JobExecutor;
use atelier_api::prober::HealthProber;
use atelier_api::registry::Registry;
use atelier_api::router::build_app_router;
use atelier_api::state::AppState;
use atelier_api::store::Store;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_api=debug,atelier_worker=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration (fatal on error) ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid server configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(host = %config.host, port = config.port, "Loaded server configuration");

    let node_configs = match load_node_inventory(&config.nodes_config_path) {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::error!(error = %e, "Cannot load node inventory");
            std::process::exit(1);
        }
    };

    // --- Registry ---
    let registry = Arc::new(Registry::new());
    if let Err(e) = registry.load(node_configs.clone()).await {
        tracing::error!(error = %e, "Invalid node inventory");
        std::process::exit(1);
    }
    tracing::info!(nodes = node_configs.len(), "Node inventory loaded");

    // --- Templates ---
    let mut templates = TemplateEngine::new(config.templates_dir.clone());
    if let Err(e) = templates.load_all() {
        tracing::error!(error = %e, "Cannot load workflow templates");
        std::process::exit(1);
    }
    let templates = Arc::new(templates);
    tracing::info!(templates = templates.entries().len(), "Workflow templates loaded");

    // --- Shared state and background flows ---
    let shutdown = CancellationToken::new();
    let store = Arc::new(Store::new());
    let preferences = Arc::new(PreferenceEngine::new());

    let (aggregator, intake) = Aggregator::new(Arc::clone(&store));
    let pool = WorkerPool::start(&node_configs, aggregator.upstream_sender()).await;
    tracing::info!("Worker pool started");

    let aggregator_task = {
        let aggregator = Arc::clone(&aggregator);
        let cancel = shutdown.clone();
        tokio::spawn(async move { aggregator.run(intake, cancel).await })
    };

    let prober = HealthProber::new(
        Arc::clone(&registry),
        Duration::from_secs(config.probe_interval_secs),
    );
    let prober_task = {
        let cancel = shutdown.clone();
        tokio::spawn(async move { prober.run(cancel).await })
    };

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        Arc::clone(&templates),
        Arc::clone(&store),
        Arc::clone(&aggregator),
        Arc::clone(&preferences),
        shutdown.clone(),
    ));

    let controller = Arc::new(IterationController::new(
        Arc::clone(&store),
        Arc::clone(&preferences),
        Arc::new(NoopRewriter),
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        registry,
        store,
        pool: Arc::clone(&pool),
        templates,
        aggregator,
        executor,
        preferences,
        controller,
    };

    // --- Serve ---
    let app = build_app_router(state, &config);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Invalid bind address");
            std::process::exit(1);
        });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "Cannot bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "Orchestrator listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    // --- Post-shutdown cleanup ---
    tracing::info!("Shutting down background flows");
    shutdown.cancel();
    pool.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), aggregator_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), prober_task).await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
