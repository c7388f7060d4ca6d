// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire types shared by the HTTP handlers: request bodies, response
//! envelopes, and the structured API error.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use dbp_core::{AuthToken, JsonMap, sha256_hex};
use dbp_store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Simple message envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiMessage {
    /// Human-readable message.
    pub message: String,
}

impl ApiMessage {
    /// Wrap a message string.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Body of `POST /repository/init`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryInitRequest {
    /// Unique repository name.
    pub name: String,
    /// Remote URL the mirror fetches from.
    pub remote_url: String,
    /// Default branch name.
    pub default_branch: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Arbitrary settings map.
    #[serde(default)]
    pub settings: JsonMap,
}

/// Body of `POST /sessions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    /// Repository name.
    pub repository: String,
    /// Commit to pin (7 to 40 hex-ish characters).
    pub commit_sha: String,
    /// Structured metadata stored with the session.
    #[serde(default)]
    pub metadata: JsonMap,
    /// Who asked; defaults to the token name.
    #[serde(default)]
    pub requested_by: Option<String>,
    /// Unified diff applied before commands run.
    #[serde(default)]
    pub patch: Option<String>,
    /// TTL in seconds (minimum 60).
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Body of `POST /sessions/{id}/commands`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandCreateRequest {
    /// Program and arguments (at least one element).
    pub argv: Vec<String>,
    /// Working directory override.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Environment overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Body of `POST /auth/tokens`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenCreateRequest {
    /// Unique token name.
    pub name: String,
    /// Granted scopes.
    #[serde(default = "default_token_scopes")]
    pub scopes: Vec<String>,
    /// TTL in seconds (minimum 60).
    #[serde(default)]
    pub expires_in: Option<i64>,
}

fn default_token_scopes() -> Vec<String> {
    vec!["sessions:read".to_string(), "sessions:write".to_string()]
}

/// Token representation without any secret material.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Database id.
    pub id: i64,
    /// Token name.
    pub name: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful authentication.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Revocation time, if revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

impl From<&AuthToken> for TokenResponse {
    fn from(token: &AuthToken) -> Self {
        Self {
            id: token.id,
            name: token.name.clone(),
            scopes: token.scopes.clone(),
            expires_at: token.expires_at,
            last_used_at: token.last_used_at,
            revoked_at: token.revoked_at,
            created_at: token.created_at,
            updated_at: token.updated_at,
        }
    }
}

/// Response of `POST /auth/tokens`: the only place the raw secret appears.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenSecretResponse {
    /// The token row.
    #[serde(flatten)]
    pub token: TokenResponse,
    /// Raw bearer secret, shown exactly once.
    pub token_secret: String,
}

/// SHA-256 of the patch text, or `None` for an absent/empty patch.
pub fn compute_patch_hash(patch: Option<&str>) -> Option<String> {
    match patch {
        Some(text) if !text.is_empty() => Some(sha256_hex(text.as_bytes())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structured API error returned on failure.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// An error with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 401 — missing or invalid bearer token.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// 403 — the token lacks a required scope.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// 404 — unknown resource.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 422 — the request body failed validation.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::NoAvailableWorktree
            | StoreError::LeaseMismatch
            | StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Decode(_) | StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}
