//! End-to-end dispatch tests against a stub worker.
//!
//! The stub speaks just enough of the worker protocol for the executor to
//! drive a job to completion: submit, history polling with a short
//! simulated render time, artifact download, asset enumeration, and an
//! event stream that feeds one progress frame per job.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::broadcast;

use atelier_api::aggregator::SessionEvent;
use atelier_core::types::Tier;
use common::{build_test_app, create_session, node_config, request_json, wait_for_terminal};

/// Simulated render time before the stub's history reports completion.
const RENDER_TIME: Duration = Duration::from_millis(300);

#[derive(Clone)]
struct StubWorker {
    jobs: Arc<Mutex<HashMap<String, Instant>>>,
    /// Progress frames pushed to every connected event-stream client.
    events: broadcast::Sender<String>,
    fail_submits: bool,
}

impl StubWorker {
    fn new(fail_submits: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            events,
            fail_submits,
        }
    }

    /// Bind the stub on an ephemeral port and return its address.
    async fn serve(self) -> std::net::SocketAddr {
        let router = Router::new()
            .route("/prompt", post(submit))
            .route("/history/{id}", get(history))
            .route("/view", get(view))
            .route("/system_stats", get(system_stats))
            .route("/object_info", get(object_info))
            .route("/queue", post(queue_delete))
            .route("/ws", get(event_stream))
            .with_state(self);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}

async fn submit(
    State(stub): State<StubWorker>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    if stub.fail_submits {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid workflow graph" })),
        );
    }
    assert!(body["prompt"].is_object(), "submit carries a job graph");

    let prompt_id = uuid::Uuid::new_v4().to_string();
    stub.jobs
        .lock()
        .unwrap()
        .insert(prompt_id.clone(), Instant::now());

    // One progress frame over the event stream, like a sampler step.
    let frame = serde_json::json!({
        "type": "progress",
        "data": { "value": 1, "max": 10, "prompt_id": prompt_id },
    });
    let _ = stub.events.send(frame.to_string());

    (
        StatusCode::OK,
        Json(serde_json::json!({ "prompt_id": prompt_id, "number": 0 })),
    )
}

async fn history(State(stub): State<StubWorker>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let done = stub
        .jobs
        .lock()
        .unwrap()
        .get(&id)
        .is_some_and(|started| started.elapsed() >= RENDER_TIME);

    if done {
        let entry = serde_json::json!({
            "status": { "status_str": "success", "completed": true },
            "outputs": {
                "7": { "images": [
                    { "filename": format!("{id}.png"), "subfolder": "", "type": "output" }
                ]}
            }
        });
        let mut body = serde_json::Map::new();
        body.insert(id, entry);
        Json(serde_json::Value::Object(body))
    } else {
        Json(serde_json::json!({}))
    }
}

async fn view() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "image/png")], vec![137u8, 80, 78, 71])
}

async fn system_stats() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "system": { "os": "stub" } }))
}

async fn object_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "CheckpointLoaderSimple": {
            "input": { "required": { "ckpt_name": [["stub-model.safetensors"]] } }
        },
        "LoraLoader": {
            "input": { "required": { "lora_name": [["stub-adapter.safetensors"]] } }
        }
    }))
}

async fn queue_delete() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

async fn event_stream(State(stub): State<StubWorker>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let mut events = stub.events.subscribe();
    ws.on_upgrade(move |mut socket| async move {
        while let Ok(frame) = events.recv().await {
            if socket.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_draft_dispatch_completes() {
    let addr = StubWorker::new(false).serve().await;
    let (app, state) = build_test_app(vec![node_config(
        "gpu-stub",
        Tier::Draft,
        "127.0.0.1",
        addr.port(),
        &["sd15"],
    )])
    .await;
    state.registry.update_health("gpu-stub", true, 2.0).await;

    let session_id = create_session(&app).await;
    let (_sub, mut events) = state.aggregator.subscribe(&session_id).await;

    let json = request_json(
        &app,
        Method::POST,
        "/generate",
        Some(serde_json::json!({
            "session_id": session_id,
            "prompt": "a misty castle",
            "model_family": "sd15",
            "task_class": "draft",
            "seed": 7,
        })),
        StatusCode::OK,
    )
    .await;
    let generation_id = json["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(json["data"]["status"], "queued");
    assert_eq!(json["data"]["node_id"], "gpu-stub");

    let row = wait_for_terminal(&app, &generation_id, Duration::from_secs(10)).await;
    assert_eq!(row["status"], "complete", "job failed: {row}");
    assert_eq!(row["seed"], 7);
    assert!(row["artifact"]["filename"].as_str().unwrap().ends_with(".png"));
    assert!(row["elapsed_ms"].as_u64().unwrap() >= RENDER_TIME.as_millis() as u64);

    // The subscriber saw the terminal complete event, after any progress.
    let mut saw_complete = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(2), events.recv()).await
    {
        match event {
            SessionEvent::Progress { generation_id: id, .. } => {
                assert_eq!(id, generation_id);
                assert!(!saw_complete, "progress after complete");
            }
            SessionEvent::Complete { generation_id: id, node_id, .. } => {
                assert_eq!(id, generation_id);
                assert_eq!(node_id, "gpu-stub");
                saw_complete = true;
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_complete);

    // Queue depth went +1 then back to 0.
    let nodes = request_json(&app, Method::GET, "/nodes", None, StatusCode::OK).await;
    assert_eq!(nodes["data"][0]["queue_depth"], 0);

    // The artifact proxy resolves bytes from the stub.
    let response = common::request(
        &app,
        Method::GET,
        &format!("/generate/{generation_id}/artifact"),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rejected_submit_fails_the_job_and_emits_one_error() {
    let addr = StubWorker::new(true).serve().await;
    let (app, state) = build_test_app(vec![node_config(
        "gpu-stub",
        Tier::Draft,
        "127.0.0.1",
        addr.port(),
        &["sd15"],
    )])
    .await;
    state.registry.update_health("gpu-stub", true, 2.0).await;

    let session_id = create_session(&app).await;
    let (_sub, mut events) = state.aggregator.subscribe(&session_id).await;

    let json = request_json(
        &app,
        Method::POST,
        "/generate",
        Some(serde_json::json!({
            "session_id": session_id,
            "prompt": "a misty castle",
            "model_family": "sd15",
            "task_class": "draft",
        })),
        StatusCode::OK,
    )
    .await;
    let generation_id = json["data"]["id"].as_str().unwrap().to_string();

    let row = wait_for_terminal(&app, &generation_id, Duration::from_secs(10)).await;
    assert_eq!(row["status"], "failed");
    assert!(row["error"].as_str().unwrap().contains("invalid workflow graph"));

    match tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SessionEvent::Error { generation_id: id, message } => {
            assert_eq!(id, generation_id);
            assert!(message.contains("invalid workflow graph"));
        }
        other => panic!("expected Error, got {other:?}"),
    }

    // Exactly one error event; nothing follows.
    let next = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(next.is_err());

    let nodes = request_json(&app, Method::GET, "/nodes", None, StatusCode::OK).await;
    assert_eq!(nodes["data"][0]["queue_depth"], 0);
}

#[tokio::test]
async fn batch_allocates_across_nodes_and_closes() {
    let addr_a = StubWorker::new(false).serve().await;
    let addr_b = StubWorker::new(false).serve().await;
    let (app, state) = build_test_app(vec![
        node_config("gpu-a", Tier::Draft, "127.0.0.1", addr_a.port(), &["sd15"]),
        node_config("gpu-b", Tier::Draft, "127.0.0.1", addr_b.port(), &["sd15"]),
    ])
    .await;
    state.registry.update_health("gpu-a", true, 2.0).await;
    state.registry.update_health("gpu-b", true, 2.0).await;

    let session_id = create_session(&app).await;
    let (_sub, mut events) = state.aggregator.subscribe(&session_id).await;

    let json = request_json(
        &app,
        Method::POST,
        "/generate/batch",
        Some(serde_json::json!({
            "session_id": session_id,
            "prompt": "a misty castle",
            "model_family": "sd15",
            "task_class": "draft",
            "count": 5,
            "seed_start": 100,
        })),
        StatusCode::OK,
    )
    .await;
    let batch_id = json["data"]["batch_id"].as_str().unwrap().to_string();
    assert_eq!(json["data"]["total_count"], 5);
    // Uneven split: remainder to the first candidate in router order.
    assert_eq!(json["data"]["allocation"]["gpu-a"], 3);
    assert_eq!(json["data"]["allocation"]["gpu-b"], 2);

    // Wait for the batch-complete event.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let mut batch_progress_seen = 0;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("batch did not complete in time")
            .expect("event stream closed");
        match event {
            SessionEvent::BatchProgress { batch_id: id, completed, total, .. } => {
                assert_eq!(id, batch_id);
                assert!(completed <= total);
                batch_progress_seen += 1;
            }
            SessionEvent::BatchComplete { batch_id: id, total, .. } => {
                assert_eq!(id, batch_id);
                assert_eq!(total, 5);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(batch_progress_seen, 5);

    // Every member completed with consecutive seeds from the base.
    let listing = request_json(
        &app,
        Method::GET,
        &format!("/sessions/{session_id}/generations?stage=0"),
        None,
        StatusCode::OK,
    )
    .await;
    let generations = listing["data"].as_array().unwrap();
    assert_eq!(generations.len(), 5);
    let mut seeds: Vec<i64> = generations
        .iter()
        .map(|g| g["seed"].as_i64().unwrap())
        .collect();
    seeds.sort_unstable();
    assert_eq!(seeds, vec![100, 101, 102, 103, 104]);
    for generation in generations {
        assert_eq!(generation["status"], "complete");
    }
}
