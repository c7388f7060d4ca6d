// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-daemon
//!
//! The HTTP/WebSocket control plane: bearer-token guarded endpoints for
//! repositories, sessions, commands, artifacts, and tokens, plus the
//! per-session log and debugger WebSocket channels.

#![deny(unsafe_code)]

pub mod api;
mod auth;
mod middleware;
mod routes;
mod ws;

use axum::{
    Router,
    routing::{delete, get, post},
};
use dbp_config::ServerConfig;
use dbp_store::MetadataStore;
use dbp_stream::{DebugBroker, LogBroker};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared application dependencies handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Metadata store.
    pub store: MetadataStore,
    /// Per-session log fan-out.
    pub logs: LogBroker,
    /// Per-session debugger event fan-out.
    pub debug: DebugBroker,
    /// Resolved server configuration.
    pub config: ServerConfig,
}

impl AppState {
    /// State over a store with default brokers and configuration.
    pub fn new(store: MetadataStore, config: ServerConfig) -> Self {
        Self {
            store,
            logs: LogBroker::default(),
            debug: DebugBroker::default(),
            config,
        }
    }
}

/// Build the Axum router with all daemon routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/whoami", get(routes::whoami))
        .route("/repository/init", post(routes::init_repository))
        .route("/repository", get(routes::list_repositories))
        .route("/repository/{name}", get(routes::get_repository))
        .route(
            "/sessions",
            post(routes::create_session).get(routes::list_sessions),
        )
        .route(
            "/sessions/{session_id}",
            get(routes::get_session).delete(routes::cancel_session),
        )
        .route(
            "/sessions/{session_id}/commands",
            post(routes::queue_command).get(routes::list_commands),
        )
        .route(
            "/sessions/{session_id}/artifacts",
            get(routes::list_artifacts),
        )
        .route(
            "/sessions/{session_id}/artifacts/{artifact_id}",
            get(routes::download_artifact),
        )
        .route("/sessions/{session_id}/logs", get(ws::stream_logs))
        .route("/sessions/{session_id}/debug", get(ws::stream_debug))
        .route(
            "/auth/tokens",
            post(routes::create_token).get(routes::list_tokens),
        )
        .route("/auth/tokens/{token_id}", delete(routes::revoke_token))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::resolve_bearer,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
