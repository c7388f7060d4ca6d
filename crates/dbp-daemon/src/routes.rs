// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP handlers.

use crate::api::{
    ApiError, ApiMessage, CommandCreateRequest, RepositoryInitRequest, SessionCreateRequest,
    TokenCreateRequest, TokenResponse, TokenSecretResponse, compute_patch_hash,
};
use crate::auth::{require_any_scope, require_token};
use crate::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use dbp_core::{
    Artifact, Command, Repository, SCOPE_ADMIN, SCOPE_ARTIFACTS_READ, SCOPE_COMMANDS_WRITE,
    SCOPE_SESSIONS_READ, SCOPE_SESSIONS_WRITE, Session, shell_join,
};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

pub async fn healthz() -> Json<ApiMessage> {
    Json(ApiMessage::new("ok"))
}

pub async fn readyz(State(_state): State<Arc<AppState>>) -> Json<ApiMessage> {
    Json(ApiMessage::new("ready"))
}

pub async fn whoami(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage>, ApiError> {
    let token = require_token(&state, &headers, &[]).await?;
    Ok(Json(ApiMessage::new(token.name)))
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

pub async fn init_repository(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<RepositoryInitRequest>,
) -> Result<(StatusCode, Json<Repository>), ApiError> {
    require_token(&state, &headers, &[SCOPE_ADMIN]).await?;
    if payload.name.trim().is_empty() {
        return Err(ApiError::validation("repository name must not be empty"));
    }
    let repository = state
        .store
        .upsert_repository(
            &payload.name,
            &payload.remote_url,
            &payload.default_branch,
            payload.description.as_deref(),
            &payload.settings,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(repository)))
}

pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Repository>>, ApiError> {
    require_token(&state, &headers, &[SCOPE_SESSIONS_READ]).await?;
    Ok(Json(state.store.list_repositories().await?))
}

pub async fn get_repository(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Repository>, ApiError> {
    require_token(&state, &headers, &[SCOPE_SESSIONS_READ]).await?;
    state
        .store
        .get_repository_by_name(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("repository not found"))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SessionCreateRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let token = require_token(&state, &headers, &[SCOPE_SESSIONS_WRITE]).await?;
    if payload.commit_sha.len() < 7 || payload.commit_sha.len() > 40 {
        return Err(ApiError::validation(
            "commit_sha must be between 7 and 40 characters",
        ));
    }
    let expires_at = match payload.expires_in {
        Some(seconds) if seconds < 60 => {
            return Err(ApiError::validation("expires_in must be at least 60 seconds"));
        }
        Some(seconds) => Some(Utc::now() + Duration::seconds(seconds)),
        None => None,
    };
    let repository = state
        .store
        .get_repository_by_name(&payload.repository)
        .await?
        .ok_or_else(|| ApiError::not_found("repository not initialized"))?;
    let patch_hash = compute_patch_hash(payload.patch.as_deref());
    let requested_by = payload.requested_by.as_deref().unwrap_or(&token.name);
    let session = state
        .store
        .create_session(
            repository.id,
            &payload.commit_sha,
            None,
            Some(requested_by),
            Some(token.id),
            patch_hash.as_deref(),
            &payload.metadata,
            expires_at,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Session>>, ApiError> {
    require_token(&state, &headers, &[SCOPE_SESSIONS_READ]).await?;
    Ok(Json(state.store.list_sessions().await?))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Session>, ApiError> {
    require_token(&state, &headers, &[SCOPE_SESSIONS_READ]).await?;
    state
        .store
        .get_session(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("session not found"))
}

pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage>, ApiError> {
    require_token(&state, &headers, &[SCOPE_SESSIONS_WRITE]).await?;
    state.store.cancel_session(&session_id).await?;
    Ok(Json(ApiMessage::new("session cancelled")))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub async fn queue_command(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CommandCreateRequest>,
) -> Result<(StatusCode, Json<Command>), ApiError> {
    require_any_scope(&state, &headers, &[SCOPE_COMMANDS_WRITE, SCOPE_SESSIONS_WRITE]).await?;
    if payload.argv.is_empty() {
        return Err(ApiError::validation("argv must contain at least one entry"));
    }
    state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    let command_repr = shell_join(&payload.argv);
    let sequence = state.store.next_command_sequence(&session_id).await?;
    let command = state
        .store
        .create_command(
            &session_id,
            &command_repr,
            payload.cwd.as_deref(),
            &payload.env,
            sequence,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(command)))
}

pub async fn list_commands(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Command>>, ApiError> {
    require_token(&state, &headers, &[SCOPE_SESSIONS_READ]).await?;
    state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    Ok(Json(state.store.list_commands(&session_id).await?))
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

pub async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    require_token(&state, &headers, &[SCOPE_ARTIFACTS_READ, SCOPE_SESSIONS_READ]).await?;
    state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    Ok(Json(state.store.list_artifacts(&session_id).await?))
}

pub async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Path((session_id, artifact_id)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_token(&state, &headers, &[SCOPE_ARTIFACTS_READ, SCOPE_SESSIONS_READ]).await?;
    state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    let artifact = state
        .store
        .get_artifact(artifact_id)
        .await?
        .filter(|a| a.session_id == session_id)
        .ok_or_else(|| ApiError::not_found("artifact not found"))?;
    let bytes = tokio::fs::read(&artifact.path)
        .await
        .map_err(|_| ApiError::not_found("artifact file missing"))?;
    let content_type = artifact
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let filename = std::path::Path::new(&artifact.path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("artifact-{artifact_id}"));
    let response = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(response.into_response())
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

pub async fn create_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<TokenCreateRequest>,
) -> Result<(StatusCode, Json<TokenSecretResponse>), ApiError> {
    require_token(&state, &headers, &[SCOPE_ADMIN]).await?;
    let expires_at = match payload.expires_in {
        Some(seconds) if seconds < 60 => {
            return Err(ApiError::validation("expires_in must be at least 60 seconds"));
        }
        Some(seconds) => Some(Utc::now() + Duration::seconds(seconds)),
        None => None,
    };
    let (record, secret) = state
        .store
        .create_token(&payload.name, &payload.scopes, expires_at)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TokenSecretResponse {
            token: TokenResponse::from(&record),
            token_secret: secret,
        }),
    ))
}

pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<TokenResponse>>, ApiError> {
    require_token(&state, &headers, &[SCOPE_ADMIN]).await?;
    let tokens = state.store.list_tokens().await?;
    Ok(Json(tokens.iter().map(TokenResponse::from).collect()))
}

pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage>, ApiError> {
    require_token(&state, &headers, &[SCOPE_ADMIN]).await?;
    state.store.revoke_token(token_id).await?;
    Ok(Json(ApiMessage::new("token revoked")))
}
