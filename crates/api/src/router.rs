//! Shared application router builder.
//!
//! [`build_app_router`] is used by both the production binary and the
//! integration tests, so both exercise the same middleware stack.

use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the full application [`Router`] with all middleware layers.
///
/// Middleware, applied bottom-up: CORS, request-id set, tracing, request-id
/// propagate, timeout, panic recovery.
pub fn build_app_router(state: AppState, config: &ServerConfig) -> Router {
    let cors = build_cors_layer(config);
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/nodes", get(handlers::nodes::list_nodes))
        .route("/nodes/{id}", get(handlers::nodes::get_node))
        .route("/sessions", post(handlers::sessions::create_session))
        .route(
            "/sessions/{id}",
            get(handlers::sessions::get_session).delete(handlers::sessions::delete_session),
        )
        .route(
            "/sessions/{id}/generations",
            get(handlers::sessions::list_session_generations),
        )
        .route("/generate", post(handlers::generation::generate))
        .route("/generate/batch", post(handlers::generation::generate_batch))
        .route("/generate/{id}", get(handlers::generation::get_generation))
        .route(
            "/generate/{id}/artifact",
            get(handlers::generation::get_artifact),
        )
        .route(
            "/generate/{id}/thumbnail",
            get(handlers::generation::get_artifact),
        )
        .route("/iterate", post(handlers::iteration::iterate))
        .route("/iterate/reject-all", post(handlers::iteration::reject_all))
        .route("/preferences/stats", get(handlers::preferences::stats))
        .route(
            "/preferences/recommend/model",
            get(handlers::preferences::recommend_model),
        )
        .route(
            "/preferences/recommend/adapters",
            get(handlers::preferences::recommend_adapters),
        )
        .route("/preferences/export", get(handlers::preferences::export))
        .route("/preferences/import", post(handlers::preferences::import))
        .route("/templates", get(handlers::templates::list_templates))
        .route("/assets/models", get(handlers::assets::list_models))
        .route("/assets/adapters", get(handlers::assets::list_adapters))
        .route("/ws/session/{id}", get(ws::session_ws_handler))
        // -- Middleware stack (applied bottom-up) --
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state)
}

/// Build the CORS layer from server configuration.
///
/// Panics at startup on an invalid origin -- misconfiguration should fail
/// fast.
pub fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .map(|o| {
            o.parse()
                .unwrap_or_else(|e| panic!("Invalid CORS origin '{o}': {e}"))
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}
