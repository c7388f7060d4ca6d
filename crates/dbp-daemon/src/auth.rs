// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bearer-token extraction and scope checks shared by HTTP and WebSocket
//! handlers.

use crate::AppState;
use crate::api::ApiError;
use axum::http::HeaderMap;
use dbp_core::{AuthToken, require_scopes};
use tracing::debug;

/// Extract the bearer value from an `Authorization` header.
/// The scheme is case-insensitive and the value is trimmed.
pub fn bearer_value(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let prefix = "bearer ";
    if header.len() < prefix.len() || !header[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    let value = header[prefix.len()..].trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Authenticate the request and require every scope in `required`.
pub async fn require_token(
    state: &AppState,
    headers: &HeaderMap,
    required: &[&str],
) -> Result<AuthToken, ApiError> {
    let token = authenticate(state, headers).await?;
    if !required.is_empty() && !require_scopes(&token.scopes, required) {
        return Err(ApiError::forbidden("insufficient token scope"));
    }
    Ok(token)
}

/// Authenticate the request and require at least one of the scopes.
pub async fn require_any_scope(
    state: &AppState,
    headers: &HeaderMap,
    any_of: &[&str],
) -> Result<AuthToken, ApiError> {
    let token = authenticate(state, headers).await?;
    let granted = any_of
        .iter()
        .any(|scope| require_scopes(&token.scopes, &[scope]));
    if !granted {
        return Err(ApiError::forbidden("insufficient token scope"));
    }
    Ok(token)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthToken, ApiError> {
    let Some(raw) = bearer_value(headers) else {
        return Err(ApiError::unauthorized("missing bearer token"));
    };
    match state.store.authenticate(&raw).await? {
        Some(token) => {
            debug!(token = %token.name, "authenticated");
            Ok(token)
        }
        None => Err(ApiError::unauthorized("invalid bearer token")),
    }
}

/// WebSocket variant: same bearer flow, but failures must be answered with
/// a policy-violation close after the upgrade instead of an HTTP status.
pub async fn ws_token(
    state: &AppState,
    headers: &HeaderMap,
    required: &[&str],
) -> Result<AuthToken, ApiError> {
    require_token(state, headers, required).await
}
