//! Downstream WebSocket endpoint: one subscription per session.
//!
//! `GET /ws/session/{id}` upgrades the connection, registers a subscriber
//! with the aggregator, and forwards normalized session events as JSON text
//! frames. Inbound messages are keepalive pings only; everything else is
//! ignored. A Ping frame goes out every 30 seconds.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use crate::state::AppState;

/// Interval between keepalive pings to the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn session_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if state.store.session(&session_id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
        .into_response()
}

/// Manage one subscriber connection after upgrade.
async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    let (subscriber_id, mut events) = state.aggregator.subscribe(&session_id).await;
    tracing::info!(session_id = %session_id, subscriber_id, "Session subscriber connected");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize session event");
                        continue;
                    }
                };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(_)) => {
                        // Clients only send keepalives; anything else is ignored.
                    }
                }
            }
        }
    }

    state.aggregator.unsubscribe(&session_id, subscriber_id).await;
    tracing::info!(session_id = %session_id, subscriber_id, "Session subscriber disconnected");
}
