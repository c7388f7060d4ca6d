// SPDX-License-Identifier: MIT OR Apache-2.0
//! The [`MetadataStore`] and its row mappers.

use crate::{StoreError, schema};
use chrono::{DateTime, Duration, Utc};
use dbp_core::{
    Artifact, ArtifactKind, AuthToken, Command, CommandStatus, DebuggerState, JsonMap, Repository,
    Session, SessionStatus, Worktree, WorktreeStatus, constant_time_eq, sha256_hex,
};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Outcome of a successful worktree reservation.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    /// The reserved row, post-update.
    pub worktree: Worktree,
    /// The freshly minted lease token.
    pub lease_token: String,
}

/// High-level handle over the metadata database.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if missing) the database at `url` and initialize the
    /// schema. Accepts `sqlite:` URLs or bare filesystem paths.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let normalized = if url.contains(':') {
            url.to_string()
        } else {
            format!("sqlite://{url}")
        };
        let options = SqliteConnectOptions::from_str(&normalized)
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    // -- Repositories --------------------------------------------------------

    /// Create or update a repository keyed by `name`. Never duplicates.
    pub async fn upsert_repository(
        &self,
        name: &str,
        remote_url: &str,
        default_branch: &str,
        description: Option<&str>,
        settings: &JsonMap,
    ) -> Result<Repository, StoreError> {
        let now = Utc::now();
        let settings_json = to_json(settings)?;
        let row = sqlx::query(
            r#"
            INSERT INTO repositories (name, remote_url, default_branch, description, settings, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                remote_url = excluded.remote_url,
                default_branch = excluded.default_branch,
                description = excluded.description,
                settings = excluded.settings,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(remote_url)
        .bind(default_branch)
        .bind(description)
        .bind(&settings_json)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        map_repository(&row)
    }

    /// Look up a repository by its unique name.
    pub async fn get_repository_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Repository>, StoreError> {
        let row = sqlx::query("SELECT * FROM repositories WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_repository).transpose()
    }

    /// All repositories, ordered by name.
    pub async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let rows = sqlx::query("SELECT * FROM repositories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_repository).collect()
    }

    // -- Worktrees -----------------------------------------------------------

    /// Register a new worktree path for a repository. The path is unique;
    /// a duplicate registration is a conflict.
    pub async fn register_worktree(
        &self,
        repository_id: i64,
        path: &str,
    ) -> Result<Worktree, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO worktrees (repository_id, path, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(repository_id)
        .bind(path)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, "worktree path"))?;
        map_worktree(&row)
    }

    /// All worktrees of a repository, oldest update first.
    pub async fn list_worktrees(&self, repository_id: i64) -> Result<Vec<Worktree>, StoreError> {
        let rows = sqlx::query("SELECT * FROM worktrees WHERE repository_id = ? ORDER BY id")
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_worktree).collect()
    }

    /// Atomically claim one worktree that is idle or whose lease has
    /// expired. At most one caller wins any given row; SQLite serializes
    /// the single UPDATE, and on a server RDBMS the inner SELECT is where
    /// `FOR UPDATE SKIP LOCKED` applies.
    pub async fn reserve_worktree(
        &self,
        repository_id: i64,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<LeaseRecord, StoreError> {
        let now = Utc::now();
        let lease_token = random_hex(16);
        let row = sqlx::query(
            r#"
            UPDATE worktrees SET
                status = 'reserved',
                lease_owner = ?,
                lease_token = ?,
                leased_at = ?,
                lease_expires_at = ?,
                version = version + 1,
                updated_at = ?
            WHERE id = (
                SELECT id FROM worktrees
                WHERE repository_id = ?
                  AND (status = 'idle'
                       OR (lease_expires_at IS NOT NULL AND lease_expires_at < ?))
                ORDER BY updated_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(&lease_token)
        .bind(now)
        .bind(now + lease_ttl)
        .bind(now)
        .bind(repository_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(LeaseRecord {
                worktree: map_worktree(&row)?,
                lease_token,
            }),
            None => Err(StoreError::NoAvailableWorktree),
        }
    }

    /// Release a lease. Succeeds only when `lease_token` matches the stored
    /// token for the row.
    pub async fn release_worktree(
        &self,
        worktree_id: i64,
        lease_token: &str,
    ) -> Result<Worktree, StoreError> {
        let current = sqlx::query("SELECT lease_token FROM worktrees WHERE id = ?")
            .bind(worktree_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity: "worktree" })?;
        let stored: Option<String> = current.try_get("lease_token")?;
        let matches = stored
            .as_deref()
            .is_some_and(|t| constant_time_eq(t.as_bytes(), lease_token.as_bytes()));
        if !matches {
            return Err(StoreError::LeaseMismatch);
        }
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE worktrees SET
                status = 'idle',
                lease_owner = NULL,
                lease_token = NULL,
                leased_at = NULL,
                lease_expires_at = NULL,
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND lease_token = ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(worktree_id)
        .bind(lease_token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::LeaseMismatch)?;
        map_worktree(&row)
    }

    /// Record the commit and environment fingerprint a worktree was last
    /// prepared for. Passing `None` clears the fields (used by reclaim).
    pub async fn update_worktree_metadata(
        &self,
        worktree_id: i64,
        commit_sha: Option<&str>,
        environment_hash: Option<&str>,
    ) -> Result<Worktree, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE worktrees SET
                commit_sha = ?,
                environment_hash = ?,
                version = version + 1,
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(commit_sha)
        .bind(environment_hash)
        .bind(now)
        .bind(worktree_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "worktree" })?;
        map_worktree(&row)
    }

    // -- Sessions ------------------------------------------------------------

    /// Create a new pending session pinned to `commit_sha`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_session(
        &self,
        repository_id: i64,
        commit_sha: &str,
        worktree_id: Option<i64>,
        requested_by: Option<&str>,
        token_id: Option<i64>,
        patch_hash: Option<&str>,
        metadata: &JsonMap,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4().simple().to_string();
        let metadata_json = to_json(metadata)?;
        let row = sqlx::query(
            r#"
            INSERT INTO sessions (id, repository_id, worktree_id, token_id, requested_by,
                                  commit_sha, patch_hash, metadata, expires_at,
                                  created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(repository_id)
        .bind(worktree_id)
        .bind(token_id)
        .bind(requested_by)
        .bind(commit_sha)
        .bind(patch_hash)
        .bind(&metadata_json)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        map_session(&row)
    }

    /// Look up a session by id.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_session).transpose()
    }

    /// All sessions, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_session).collect()
    }

    /// Record a session status change, optionally stamping the start or
    /// completion time.
    pub async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE sessions SET
                status = ?,
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(status.as_str())
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "session" })?;
        map_session(&row)
    }

    /// Cancel a session. Only pending or running sessions can be cancelled.
    pub async fn cancel_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or(StoreError::NotFound { entity: "session" })?;
        if !session.status.can_transition_to(SessionStatus::Cancelled) {
            return Err(StoreError::Conflict(format!(
                "session is {} and cannot be cancelled",
                session.status.as_str()
            )));
        }
        self.update_session_status(
            session_id,
            SessionStatus::Cancelled,
            None,
            Some(Utc::now()),
        )
        .await
    }

    // -- Commands ------------------------------------------------------------

    /// Next unused command sequence for a session (0 for the first).
    pub async fn next_command_sequence(&self, session_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence) + 1, 0) AS next FROM commands WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("next")?)
    }

    /// Record a pending command. A duplicate `(session, sequence)` pair —
    /// two racing allocators — surfaces as a conflict.
    pub async fn create_command(
        &self,
        session_id: &str,
        command: &str,
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
        sequence: i64,
    ) -> Result<Command, StoreError> {
        let now = Utc::now();
        let env_json =
            serde_json::to_string(env).map_err(|e| StoreError::Decode(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO commands (session_id, sequence, command, cwd, env, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(sequence)
        .bind(command)
        .bind(cwd)
        .bind(&env_json)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, "command sequence"))?;
        map_command(&row)
    }

    /// Commands of a session in execution order.
    pub async fn list_commands(&self, session_id: &str) -> Result<Vec<Command>, StoreError> {
        let rows = sqlx::query("SELECT * FROM commands WHERE session_id = ? ORDER BY sequence")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_command).collect()
    }

    /// Record a command status change. Entering `running` stamps
    /// `started_at`; any terminal status stamps `completed_at`.
    pub async fn record_command_result(
        &self,
        command_id: i64,
        status: CommandStatus,
        exit_code: Option<i64>,
        log_path: Option<&str>,
    ) -> Result<Command, StoreError> {
        let now = Utc::now();
        let started_at = (status == CommandStatus::Running).then_some(now);
        let completed_at = status.is_terminal().then_some(now);
        let row = sqlx::query(
            r#"
            UPDATE commands SET
                status = ?,
                exit_code = ?,
                log_path = COALESCE(?, log_path),
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(status.as_str())
        .bind(exit_code)
        .bind(log_path)
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "command" })?;
        map_command(&row)
    }

    // -- Artifacts -----------------------------------------------------------

    /// Record an artifact produced within a session.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_artifact(
        &self,
        session_id: &str,
        command_id: Option<i64>,
        kind: ArtifactKind,
        path: &str,
        content_type: Option<&str>,
        description: Option<&str>,
        size_bytes: Option<i64>,
        checksum_sha256: Option<&str>,
        metadata: &JsonMap,
    ) -> Result<Artifact, StoreError> {
        let now = Utc::now();
        let metadata_json = to_json(metadata)?;
        let row = sqlx::query(
            r#"
            INSERT INTO artifacts (session_id, command_id, kind, path, content_type,
                                   description, size_bytes, checksum_sha256, metadata,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(command_id)
        .bind(kind.as_str())
        .bind(path)
        .bind(content_type)
        .bind(description)
        .bind(size_bytes)
        .bind(checksum_sha256)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        map_artifact(&row)
    }

    /// Artifacts of a session, oldest first.
    pub async fn list_artifacts(&self, session_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE session_id = ? ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_artifact).collect()
    }

    /// Look up one artifact by id.
    pub async fn get_artifact(&self, artifact_id: i64) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = ?")
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_artifact).transpose()
    }

    // -- Auth tokens ---------------------------------------------------------

    /// Mint a token. Returns the stored row and the raw secret; only the
    /// secret's SHA-256 is persisted, so the raw value is shown exactly
    /// once.
    pub async fn create_token(
        &self,
        name: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(AuthToken, String), StoreError> {
        let raw_secret = random_hex(32);
        let token_hash = sha256_hex(raw_secret.as_bytes());
        let scopes_json =
            serde_json::to_string(scopes).map_err(|e| StoreError::Decode(e.to_string()))?;
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO auth_tokens (name, token_hash, scopes, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(&token_hash)
        .bind(&scopes_json)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, "token name"))?;
        Ok((map_token(&row)?, raw_secret))
    }

    /// Resolve a raw secret to its token. Returns `None` when the secret is
    /// unknown, the token has expired, or it has been revoked. On success
    /// `last_used_at` is bumped.
    pub async fn authenticate(&self, raw_secret: &str) -> Result<Option<AuthToken>, StoreError> {
        let token_hash = sha256_hex(raw_secret.as_bytes());
        let row = sqlx::query("SELECT * FROM auth_tokens WHERE token_hash = ?")
            .bind(&token_hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let token = map_token(&row)?;
        if !constant_time_eq(token.token_hash.as_bytes(), token_hash.as_bytes()) {
            return Ok(None);
        }
        let now = Utc::now();
        if !token.is_valid(now) {
            return Ok(None);
        }
        let row = sqlx::query(
            "UPDATE auth_tokens SET last_used_at = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(now)
        .bind(now)
        .bind(token.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(map_token(&row)?))
    }

    /// Revoke a token. Revoking twice keeps the original revocation time.
    pub async fn revoke_token(&self, token_id: i64) -> Result<AuthToken, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE auth_tokens SET
                revoked_at = COALESCE(revoked_at, ?),
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { entity: "token" })?;
        map_token(&row)
    }

    /// All tokens, oldest first. Raw secrets are not stored, so none leak.
    pub async fn list_tokens(&self) -> Result<Vec<AuthToken>, StoreError> {
        let rows = sqlx::query("SELECT * FROM auth_tokens ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_token).collect()
    }

    // -- Debugger state ------------------------------------------------------

    /// Current debugger bookkeeping for a session, if any was recorded.
    pub async fn get_debugger_state(
        &self,
        session_id: &str,
    ) -> Result<Option<DebuggerState>, StoreError> {
        let row = sqlx::query("SELECT * FROM debugger_state WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_debugger_state).transpose()
    }

    /// Upsert the debugger state for a session, bumping its version.
    /// Breakpoints recorded earlier are preserved.
    pub async fn update_debugger_state(
        &self,
        session_id: &str,
        last_event: Option<&str>,
        payload: &JsonMap,
    ) -> Result<DebuggerState, StoreError> {
        let now = Utc::now();
        let payload_json = to_json(payload)?;
        let row = sqlx::query(
            r#"
            INSERT INTO debugger_state (session_id, last_event, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                last_event = excluded.last_event,
                payload = excluded.payload,
                version = version + 1,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(last_event)
        .bind(&payload_json)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        map_debugger_state(&row)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn to_json(map: &JsonMap) -> Result<String, StoreError> {
    serde_json::to_string(map).map_err(|e| StoreError::Decode(e.to_string()))
}

fn parse_json_map(raw: &str, column: &str) -> Result<JsonMap, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Decode(format!("column {column}: {e}")))
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

fn map_repository(row: &SqliteRow) -> Result<Repository, StoreError> {
    let settings_raw: String = row.try_get("settings")?;
    Ok(Repository {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        remote_url: row.try_get("remote_url")?,
        default_branch: row.try_get("default_branch")?,
        description: row.try_get("description")?,
        settings: parse_json_map(&settings_raw, "settings")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_worktree(row: &SqliteRow) -> Result<Worktree, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = WorktreeStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("worktree status {status_raw:?}")))?;
    Ok(Worktree {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        path: row.try_get("path")?,
        commit_sha: row.try_get("commit_sha")?,
        environment_hash: row.try_get("environment_hash")?,
        status,
        lease_owner: row.try_get("lease_owner")?,
        lease_token: row.try_get("lease_token")?,
        leased_at: row.try_get("leased_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_session(row: &SqliteRow) -> Result<Session, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("session status {status_raw:?}")))?;
    let metadata_raw: String = row.try_get("metadata")?;
    Ok(Session {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        worktree_id: row.try_get("worktree_id")?,
        token_id: row.try_get("token_id")?,
        requested_by: row.try_get("requested_by")?,
        commit_sha: row.try_get("commit_sha")?,
        patch_hash: row.try_get("patch_hash")?,
        status,
        expires_at: row.try_get("expires_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        metadata: parse_json_map(&metadata_raw, "metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_command(row: &SqliteRow) -> Result<Command, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = CommandStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("command status {status_raw:?}")))?;
    let env_raw: String = row.try_get("env")?;
    let env: BTreeMap<String, String> = serde_json::from_str(&env_raw)
        .map_err(|e| StoreError::Decode(format!("column env: {e}")))?;
    Ok(Command {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        sequence: row.try_get("sequence")?,
        command: row.try_get("command")?,
        cwd: row.try_get("cwd")?,
        env,
        status,
        exit_code: row.try_get("exit_code")?,
        log_path: row.try_get("log_path")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_artifact(row: &SqliteRow) -> Result<Artifact, StoreError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = ArtifactKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::Decode(format!("artifact kind {kind_raw:?}")))?;
    let metadata_raw: String = row.try_get("metadata")?;
    Ok(Artifact {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        command_id: row.try_get("command_id")?,
        kind,
        path: row.try_get("path")?,
        content_type: row.try_get("content_type")?,
        description: row.try_get("description")?,
        size_bytes: row.try_get("size_bytes")?,
        checksum_sha256: row.try_get("checksum_sha256")?,
        metadata: parse_json_map(&metadata_raw, "metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_token(row: &SqliteRow) -> Result<AuthToken, StoreError> {
    let scopes_raw: String = row.try_get("scopes")?;
    let scopes: Vec<String> = serde_json::from_str(&scopes_raw)
        .map_err(|e| StoreError::Decode(format!("column scopes: {e}")))?;
    Ok(AuthToken {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        token_hash: row.try_get("token_hash")?,
        scopes,
        expires_at: row.try_get("expires_at")?,
        last_used_at: row.try_get("last_used_at")?,
        revoked_at: row.try_get("revoked_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_debugger_state(row: &SqliteRow) -> Result<DebuggerState, StoreError> {
    let breakpoints_raw: String = row.try_get("breakpoints")?;
    let breakpoints: Vec<serde_json::Value> = serde_json::from_str(&breakpoints_raw)
        .map_err(|e| StoreError::Decode(format!("column breakpoints: {e}")))?;
    let payload_raw: String = row.try_get("payload")?;
    Ok(DebuggerState {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        last_event: row.try_get("last_event")?,
        breakpoints,
        payload: parse_json_map(&payload_raw, "payload")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
