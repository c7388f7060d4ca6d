// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request audit middleware: bearer identity resolution plus the request
//! logger that attributes each request to its token.

use crate::AppState;
use crate::auth;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use dbp_core::AuthToken;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Resolve the bearer token (when present and valid) into a request
/// extension so [`request_logger`] can attribute the request. Handlers
/// still enforce scopes themselves; this layer only establishes identity.
pub async fn resolve_bearer(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(raw) = auth::bearer_value(req.headers()) {
        if let Ok(Some(token)) = state.store.authenticate(&raw).await {
            req.extensions_mut().insert(token);
        }
    }
    next.run(req).await
}

/// Log method, path, status, duration, and the authenticated token name
/// for every request with structured fields. Runs inside
/// [`resolve_bearer`], which populates the token extension.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let token_name = req
        .extensions()
        .get::<AuthToken>()
        .map(|token| token.name.clone());
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        token_name = token_name.as_deref().unwrap_or("-"),
        "request completed"
    );
    resp
}
