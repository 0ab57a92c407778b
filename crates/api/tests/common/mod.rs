// Shared test helpers. Not every test binary uses every helper, so
// dead_code warnings are suppressed at the module level.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use atelier_api::aggregator::Aggregator;
use atelier_api::config::ServerConfig;
use atelier_api::controller::IterationController;
use atelier_api::executor::JobExecutor;
use atelier_api::registry::Registry;
use atelier_api::router::build_app_router;
use atelier_api::state::AppState;
use atelier_api::store::Store;
use atelier_core::iteration::NoopRewriter;
use atelier_core::preference::PreferenceEngine;
use atelier_core::template::TemplateEngine;
use atelier_core::types::{NodeConfig, Tier};
use atelier_worker::pool::WorkerPool;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        nodes_config_path: PathBuf::from("config/nodes.yaml"),
        templates_dir: templates_dir(),
        probe_interval_secs: 10,
    }
}

/// The repository's real template directory.
pub fn templates_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../templates/workflows")
}

/// A node config pointing at `host:port` with the given tier and tags.
pub fn node_config(id: &str, tier: Tier, host: &str, port: u16, caps: &[&str]) -> NodeConfig {
    NodeConfig {
        id: id.to_string(),
        name: format!("test {id}"),
        vram_gb: 24,
        tier,
        host: host.to_string(),
        port,
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
        max_resolution: 2048,
        max_batch: 4,
    }
}

/// Fully wired application for tests: real router, real middleware, no
/// worker connections unless `nodes` point somewhere live.
pub async fn build_test_app(nodes: Vec<NodeConfig>) -> (Router, AppState) {
    let config = test_config();

    let registry = Arc::new(Registry::new());
    registry.load(nodes.clone()).await.expect("valid test inventory");

    let mut templates = TemplateEngine::new(config.templates_dir.clone());
    templates.load_all().expect("test templates load");
    let templates = Arc::new(templates);

    let store = Arc::new(Store::new());
    let preferences = Arc::new(PreferenceEngine::new());

    let (aggregator, intake) = Aggregator::new(Arc::clone(&store));
    let pool = WorkerPool::start(&nodes, aggregator.upstream_sender()).await;

    let shutdown = CancellationToken::new();
    {
        let aggregator = Arc::clone(&aggregator);
        let cancel = shutdown.clone();
        tokio::spawn(async move { aggregator.run(intake, cancel).await });
    }

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        Arc::clone(&templates),
        Arc::clone(&store),
        Arc::clone(&aggregator),
        Arc::clone(&preferences),
        shutdown,
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
        pool,
        templates,
        aggregator,
        executor,
        preferences,
        controller,
    };

    (build_app_router(state.clone(), &config), state)
}

/// Issue one request against the router.
pub async fn request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Response<axum::body::Body> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

/// Read a response body as JSON.
pub async fn body_json(response: Response<axum::body::Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

/// Issue a request and assert the status, returning the JSON body.
pub async fn request_json(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
    expected: StatusCode,
) -> serde_json::Value {
    let response = request(app, method, uri, body).await;
    let status = response.status();
    let json = body_json(response).await;
    assert_eq!(status, expected, "unexpected status for {uri}: {json}");
    json
}

/// Create a session through the API and return its id.
pub async fn create_session(app: &Router) -> String {
    let json = request_json(
        app,
        Method::POST,
        "/sessions",
        Some(serde_json::json!({ "flow_kind": "draft_grid" })),
        StatusCode::CREATED,
    )
    .await;
    json["data"]["id"].as_str().expect("session id").to_string()
}

/// Poll a generation until it reaches a terminal state.
pub async fn wait_for_terminal(
    app: &Router,
    generation_id: &str,
    timeout: Duration,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let json = request_json(
            app,
            Method::GET,
            &format!("/generate/{generation_id}"),
            None,
            StatusCode::OK,
        )
        .await;
        let status = json["data"]["status"].as_str().unwrap_or_default().to_string();
        if status == "complete" || status == "failed" {
            return json["data"].clone();
        }
        if tokio::time::Instant::now() > deadline {
            panic!("generation {generation_id} not terminal in time: {json}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
