//! Integration tests for the HTTP surface: health, nodes, sessions,
//! generation validation, preferences, and templates.
//!
//! These run against the full router and middleware stack without any live
//! workers.

mod common;

use axum::http::{Method, StatusCode};
use common::{build_test_app, create_session, node_config, request_json};
use atelier_core::types::Tier;

// ---------------------------------------------------------------------------
// Health + nodes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_node_counts() {
    let (app, state) = build_test_app(vec![
        node_config("gpu-1", Tier::Quality, "10.0.0.5", 8188, &["sdxl"]),
        node_config("gpu-2", Tier::Draft, "10.0.0.6", 8188, &["sd15"]),
    ])
    .await;

    state.registry.update_health("gpu-1", true, 10.0).await;

    let json = request_json(&app, Method::GET, "/health", None, StatusCode::OK).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["nodes_healthy"], 1);
    assert_eq!(json["nodes_total"], 2);
}

#[tokio::test]
async fn nodes_listing_and_detail() {
    let (app, state) = build_test_app(vec![node_config(
        "gpu-1",
        Tier::Quality,
        "10.0.0.5",
        8188,
        &["sdxl", "upscale"],
    )])
    .await;
    state.registry.update_health("gpu-1", true, 7.5).await;

    let json = request_json(&app, Method::GET, "/nodes", None, StatusCode::OK).await;
    let nodes = json["data"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["id"], "gpu-1");
    assert_eq!(nodes[0]["healthy"], true);
    assert_eq!(nodes[0]["queue_depth"], 0);

    let json = request_json(&app, Method::GET, "/nodes/gpu-1", None, StatusCode::OK).await;
    assert_eq!(json["data"]["tier"], "quality");

    let json = request_json(&app, Method::GET, "/nodes/nope", None, StatusCode::NOT_FOUND).await;
    assert_eq!(json["error"]["code"], "not_found");
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_create_get_delete() {
    let (app, _state) = build_test_app(vec![]).await;

    let created = request_json(
        &app,
        Method::POST,
        "/sessions",
        Some(serde_json::json!({
            "flow_kind": "concept_builder",
            "initial_config": { "style": "noir" },
        })),
        StatusCode::CREATED,
    )
    .await;
    let id = created["data"]["id"].as_str().unwrap();
    assert_eq!(created["data"]["current_stage"], 0);
    assert_eq!(created["data"]["phase"], "configuring");
    assert_eq!(created["data"]["config"]["style"], "noir");

    let fetched = request_json(
        &app,
        Method::GET,
        &format!("/sessions/{id}"),
        None,
        StatusCode::OK,
    )
    .await;
    assert_eq!(fetched["data"]["id"], *id);

    request_json(
        &app,
        Method::DELETE,
        &format!("/sessions/{id}"),
        None,
        StatusCode::OK,
    )
    .await;
    request_json(
        &app,
        Method::GET,
        &format!("/sessions/{id}"),
        None,
        StatusCode::NOT_FOUND,
    )
    .await;
}

#[tokio::test]
async fn unknown_session_is_404() {
    let (app, _state) = build_test_app(vec![]).await;
    request_json(&app, Method::GET, "/sessions/ghost", None, StatusCode::NOT_FOUND).await;
    request_json(
        &app,
        Method::GET,
        "/sessions/ghost/generations",
        None,
        StatusCode::NOT_FOUND,
    )
    .await;
    request_json(&app, Method::DELETE, "/sessions/ghost", None, StatusCode::NOT_FOUND).await;
}

#[tokio::test]
async fn generation_listing_is_empty_for_fresh_sessions() {
    let (app, _state) = build_test_app(vec![]).await;
    let id = create_session(&app).await;
    let json = request_json(
        &app,
        Method::GET,
        &format!("/sessions/{id}/generations?stage=0"),
        None,
        StatusCode::OK,
    )
    .await;
    assert_eq!(json["data"].as_array().unwrap().len(), 0);
}

// ---------------------------------------------------------------------------
// Generation request validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generate_without_capable_nodes_is_503() {
    let (app, _state) = build_test_app(vec![]).await;
    let session_id = create_session(&app).await;

    let json = request_json(
        &app,
        Method::POST,
        "/generate",
        Some(serde_json::json!({
            "session_id": session_id,
            "prompt": "a castle",
            "model_family": "sdxl",
            "task_class": "standard",
        })),
        StatusCode::SERVICE_UNAVAILABLE,
    )
    .await;
    assert_eq!(json["error"]["code"], "no_capable_node");
}

#[tokio::test]
async fn unhealthy_nodes_do_not_receive_work() {
    // A node exists but was never probed healthy.
    let (app, _state) = build_test_app(vec![node_config(
        "gpu-1",
        Tier::Standard,
        "10.0.0.5",
        8188,
        &["sdxl"],
    )])
    .await;
    let session_id = create_session(&app).await;

    request_json(
        &app,
        Method::POST,
        "/generate",
        Some(serde_json::json!({
            "session_id": session_id,
            "prompt": "a castle",
        })),
        StatusCode::SERVICE_UNAVAILABLE,
    )
    .await;
}

#[tokio::test]
async fn generate_for_unknown_session_is_404() {
    let (app, state) = build_test_app(vec![node_config(
        "gpu-1",
        Tier::Standard,
        "10.0.0.5",
        8188,
        &["sdxl"],
    )])
    .await;
    state.registry.update_health("gpu-1", true, 5.0).await;

    request_json(
        &app,
        Method::POST,
        "/generate",
        Some(serde_json::json!({
            "session_id": "ghost",
            "prompt": "a castle",
        })),
        StatusCode::NOT_FOUND,
    )
    .await;
}

#[tokio::test]
async fn batch_with_zero_count_is_400() {
    let (app, _state) = build_test_app(vec![]).await;
    let session_id = create_session(&app).await;
    request_json(
        &app,
        Method::POST,
        "/generate/batch",
        Some(serde_json::json!({
            "session_id": session_id,
            "prompt": "a castle",
            "count": 0,
        })),
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn unknown_generation_is_404() {
    let (app, _state) = build_test_app(vec![]).await;
    request_json(&app, Method::GET, "/generate/ghost", None, StatusCode::NOT_FOUND).await;
    request_json(
        &app,
        Method::GET,
        "/generate/ghost/artifact",
        None,
        StatusCode::NOT_FOUND,
    )
    .await;
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn templates_listing_exposes_manifest_metadata() {
    let (app, _state) = build_test_app(vec![]).await;
    let json = request_json(&app, Method::GET, "/templates", None, StatusCode::OK).await;
    let templates = json["data"].as_array().unwrap();
    assert_eq!(templates.len(), 5);
    assert_eq!(templates[0]["name"], "sd15_txt2img");
    assert_eq!(templates[0]["supports_adapters"], true);
    let flux = templates.iter().find(|t| t["name"] == "flux_txt2img").unwrap();
    assert_eq!(flux["supports_adapters"], false);
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

#[tokio::test]
async fn preference_stats_start_empty() {
    let (app, _state) = build_test_app(vec![]).await;
    let json = request_json(&app, Method::GET, "/preferences/stats", None, StatusCode::OK).await;
    assert_eq!(json["data"]["total_records"], 0);
}

#[tokio::test]
async fn recommendation_with_no_data_defaults_with_zero_confidence() {
    let (app, _state) = build_test_app(vec![]).await;
    let json = request_json(
        &app,
        Method::GET,
        "/preferences/recommend/model?prompt=a+castle",
        None,
        StatusCode::OK,
    )
    .await;
    assert!(json["data"]["model"].as_str().is_some());
    // Confidence at or near zero with an empty engine.
    assert!(json["data"]["confidence"].as_f64().unwrap() < 0.01);
}

#[tokio::test]
async fn preference_export_round_trips_through_import() {
    let (app, state) = build_test_app(vec![]).await;

    state.preferences.record(
        "misty castle",
        "model-a",
        &[],
        atelier_core::preference::PreferenceAction::Selected,
        0,
        "s1",
        None,
        chrono::Utc::now(),
    );

    let exported = request_json(&app, Method::GET, "/preferences/export", None, StatusCode::OK).await;
    assert_eq!(exported["version"], 1);
    assert_eq!(exported["records"].as_array().unwrap().len(), 1);

    let json = request_json(
        &app,
        Method::POST,
        "/preferences/import",
        Some(exported),
        StatusCode::OK,
    )
    .await;
    assert_eq!(json["data"]["imported"], true);

    let stats = request_json(&app, Method::GET, "/preferences/stats", None, StatusCode::OK).await;
    assert_eq!(stats["data"]["total_records"], 1);
    assert_eq!(stats["data"]["selected"], 1);
}

#[tokio::test]
async fn corrupt_import_is_rejected() {
    let (app, _state) = build_test_app(vec![]).await;

    let json = request_json(
        &app,
        Method::POST,
        "/preferences/import",
        Some(serde_json::json!({ "version": 42, "records": [], "stats": [] })),
        StatusCode::BAD_REQUEST,
    )
    .await;
    assert_eq!(json["error"]["code"], "corrupt_export");

    let json = request_json(
        &app,
        Method::POST,
        "/preferences/import",
        Some(serde_json::json!({ "garbage": true })),
        StatusCode::BAD_REQUEST,
    )
    .await;
    assert_eq!(json["error"]["code"], "corrupt_export");
}

// ---------------------------------------------------------------------------
// Iteration validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn iterate_requires_selected_generations() {
    let (app, _state) = build_test_app(vec![]).await;
    let session_id = create_session(&app).await;

    request_json(
        &app,
        Method::POST,
        "/iterate",
        Some(serde_json::json!({
            "session_id": session_id,
            "action": "select",
            "selected_ids": [],
        })),
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn reject_all_round_trips() {
    let (app, _state) = build_test_app(vec![]).await;
    let session_id = create_session(&app).await;

    let json = request_json(
        &app,
        Method::POST,
        "/iterate/reject-all",
        Some(serde_json::json!({
            "session_id": session_id,
            "stage": 0,
            "feedback_text": "all too dark",
        })),
        StatusCode::OK,
    )
    .await;
    // No generations exist yet, so nothing was recorded.
    assert_eq!(json["data"]["recorded"], false);
    assert!(json["data"]["rationale"].as_str().is_some());
}
