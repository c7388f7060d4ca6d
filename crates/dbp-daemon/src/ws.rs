// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket channels: per-session log streaming (history replay + live)
//! and the debugger control stream.

use crate::AppState;
use crate::auth::ws_token;
use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use dbp_core::{DebugEvent, LogEvent, SCOPE_ARTIFACTS_READ, SCOPE_SESSIONS_READ, SCOPE_SESSIONS_WRITE};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// `GET /sessions/{id}/logs` — replay retained history, then stream live
/// log events until the client disconnects.
pub async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = authorize(&state, &headers, &session_id, &[
        SCOPE_SESSIONS_READ,
        SCOPE_ARTIFACTS_READ,
    ])
    .await;
    ws.on_upgrade(move |socket| async move {
        if !authorized {
            close_policy_violation(socket).await;
            return;
        }
        run_log_stream(socket, state, session_id).await;
    })
}

/// `GET /sessions/{id}/debug` — replay retained debugger events, stream
/// live ones, and acknowledge every incoming client frame.
pub async fn stream_debug(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = authorize(&state, &headers, &session_id, &[SCOPE_SESSIONS_WRITE]).await;
    ws.on_upgrade(move |socket| async move {
        if !authorized {
            close_policy_violation(socket).await;
            return;
        }
        run_debug_stream(socket, state, session_id).await;
    })
}

/// Bearer check plus session existence, evaluated before the upgrade
/// handshake completes. Failures answer with a 1008 close and no payload.
async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    session_id: &str,
    scopes: &[&str],
) -> bool {
    if ws_token(state, headers, scopes).await.is_err() {
        return false;
    }
    matches!(state.store.get_session(session_id).await, Ok(Some(_)))
}

async fn close_policy_violation(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "policy violation".into(),
        })))
        .await;
}

async fn run_log_stream(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (history, subscription) = state.logs.subscribe_with_history(&session_id);
    for event in &history {
        if send_log_event(&mut socket, event).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            event = subscription.next() => {
                match event {
                    Some(event) => {
                        if send_log_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Log streaming is one-way; other frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(session = %session_id, lag = subscription.lag(), "log stream closed");
}

async fn run_debug_stream(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (history, subscription) = state.debug.subscribe_with_history(&session_id);
    for event in &history {
        if send_debug_event(&mut socket, &session_id, event).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            event = subscription.next() => {
                match event {
                    Some(event) => {
                        if send_debug_event(&mut socket, &session_id, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(raw))) => {
                        let payload = serde_json::from_str(raw.as_str())
                            .unwrap_or_else(|_| json!(raw.as_str()));
                        let ack = json!({
                            "session_id": session_id,
                            "kind": "ack",
                            "payload": payload,
                            "timestamp": Utc::now(),
                        });
                        if send_json(&mut socket, &ack).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_log_event(socket: &mut WebSocket, event: &LogEvent) -> Result<(), axum::Error> {
    let wire = json!({
        "stream": event.stream,
        "text": event.text,
        "timestamp": event.timestamp,
    });
    send_json(socket, &wire).await
}

async fn send_debug_event(
    socket: &mut WebSocket,
    session_id: &str,
    event: &DebugEvent,
) -> Result<(), axum::Error> {
    let wire = json!({
        "session_id": session_id,
        "kind": event.kind,
        "payload": event.payload,
        "timestamp": event.timestamp,
    });
    send_json(socket, &wire).await
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}
