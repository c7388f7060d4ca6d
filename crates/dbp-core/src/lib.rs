// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-core
//!
//! Shared domain types for the debug-plane execution service: the entity
//! rows owned by the metadata store, their status state machines, stream
//! event payloads, scope evaluation, and small hashing/quoting helpers used
//! across the workspace.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// JSON object map used for free-form metadata columns.
pub type JsonMap = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle states of a pooled worktree row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    /// Unleased and available for reservation.
    Idle,
    /// Claimed by a lease but not yet executing work.
    Reserved,
    /// Actively executing work under a lease.
    Busy,
}

impl WorktreeStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reserved => "reserved",
            Self::Busy => "busy",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "reserved" => Some(Self::Reserved),
            "busy" => Some(Self::Busy),
            _ => None,
        }
    }
}

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no command executed yet.
    Pending,
    /// At least one command is executing.
    Running,
    /// All work finished successfully.
    Completed,
    /// Work finished with a failure.
    Failed,
    /// Cancelled by a client request.
    Cancelled,
}

impl SessionStatus {
    /// Returns `true` if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [SessionStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Lifecycle states of a recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Recorded but not yet spawned.
    Pending,
    /// The process is executing.
    Running,
    /// The process exited with code 0.
    Succeeded,
    /// The process exited non-zero or failed to spawn.
    Failed,
    /// The process was killed (timeout or explicit cancellation).
    Cancelled,
}

impl CommandStatus {
    /// Returns `true` if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [CommandStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Running => &[Self::Succeeded, Self::Failed, Self::Cancelled],
            Self::Succeeded | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Categories of persisted artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Captured command output.
    Log,
    /// Coverage report.
    Coverage,
    /// JUnit-style test report.
    Junit,
    /// Native core dump.
    CoreDump,
    /// Anything else a command produced.
    Custom,
}

impl ArtifactKind {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Coverage => "coverage",
            Self::Junit => "junit",
            Self::CoreDump => "core-dump",
            Self::Custom => "custom",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "log" => Some(Self::Log),
            "coverage" => Some(Self::Coverage),
            "junit" => Some(Self::Junit),
            "core-dump" => Some(Self::CoreDump),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Tracked upstream repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Database identifier.
    pub id: i64,
    /// Unique repository name.
    pub name: String,
    /// Remote URL the mirror fetches from.
    pub remote_url: String,
    /// Default branch name.
    pub default_branch: String,
    /// Optional human description.
    pub description: Option<String>,
    /// Arbitrary repository-level settings.
    pub settings: JsonMap,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

/// A reusable checkout of a mirrored repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    /// Database identifier.
    pub id: i64,
    /// Owning repository.
    pub repository_id: i64,
    /// Filesystem path of the checkout (unique).
    pub path: String,
    /// Commit the checkout currently points at.
    pub commit_sha: Option<String>,
    /// Fingerprint of the environment last synced for this checkout.
    pub environment_hash: Option<String>,
    /// Lease state.
    pub status: WorktreeStatus,
    /// Identity that holds the current lease.
    pub lease_owner: Option<String>,
    /// Opaque lease token; set exactly while the row is leased.
    pub lease_token: Option<String>,
    /// When the current lease was taken.
    pub leased_at: Option<DateTime<Utc>>,
    /// When the current lease expires and becomes reclaimable.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last heartbeat from the lease holder.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Optimistic-locking version; bumps on every mutation.
    pub version: i64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

/// The top-level unit of work: a commit pin, optional patch, and commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session identifier (uuid hex).
    pub id: String,
    /// Owning repository.
    pub repository_id: i64,
    /// Worktree currently associated with the session, if any.
    pub worktree_id: Option<i64>,
    /// Token that created the session.
    pub token_id: Option<i64>,
    /// Who asked for the session.
    pub requested_by: Option<String>,
    /// Commit the session is pinned to.
    pub commit_sha: String,
    /// SHA-256 of the patch text, when a patch was supplied.
    pub patch_hash: Option<String>,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Expiry deadline, if requested.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the session entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Structured metadata provided by the client.
    pub metadata: JsonMap,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

/// A recorded command invocation within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Database identifier.
    pub id: i64,
    /// Owning session.
    pub session_id: String,
    /// Per-session position, starting at 0 and strictly increasing.
    pub sequence: i64,
    /// Shell-safe rendering of the argv.
    pub command: String,
    /// Working directory override.
    pub cwd: Option<String>,
    /// Environment overrides supplied with the command.
    pub env: BTreeMap<String, String>,
    /// Lifecycle state.
    pub status: CommandStatus,
    /// Exit code; null for spawn failures and kills.
    pub exit_code: Option<i64>,
    /// Path of the captured log file once opened.
    pub log_path: Option<String>,
    /// When the process was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the command reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

/// Metadata about a file a command produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Database identifier.
    pub id: i64,
    /// Owning session.
    pub session_id: String,
    /// Producing command, when tied to one.
    pub command_id: Option<i64>,
    /// Artifact category.
    pub kind: ArtifactKind,
    /// Filesystem path of the artifact.
    pub path: String,
    /// MIME type, when known.
    pub content_type: Option<String>,
    /// Human description.
    pub description: Option<String>,
    /// File size in bytes, when recorded.
    pub size_bytes: Option<i64>,
    /// Hex SHA-256 of the file contents, when recorded.
    pub checksum_sha256: Option<String>,
    /// Free-form metadata.
    pub metadata: JsonMap,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

/// Bearer token metadata. The raw secret is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    /// Database identifier.
    pub id: i64,
    /// Unique human-friendly name.
    pub name: String,
    /// Hex SHA-256 of the raw secret.
    pub token_hash: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Expiry deadline, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful authentication.
    pub last_used_at: Option<DateTime<Utc>>,
    /// When the token was revoked, if ever.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

impl AuthToken {
    /// A token is valid iff it is neither revoked nor expired at `now`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(deadline) => deadline > now,
            None => true,
        }
    }

    /// Scope check: `admin` satisfies everything, otherwise `required` must
    /// be a subset of the granted scopes.
    pub fn has_scopes(&self, required: &[&str]) -> bool {
        require_scopes(&self.scopes, required)
    }
}

/// Per-session debugger bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebuggerState {
    /// Database identifier.
    pub id: i64,
    /// Owning session (unique).
    pub session_id: String,
    /// Most recent lifecycle event (`tunnel-created`, `tunnel-ready`, ...).
    pub last_event: Option<String>,
    /// Known breakpoints.
    pub breakpoints: Vec<serde_json::Value>,
    /// Free-form payload, e.g. the active tunnel description.
    pub payload: JsonMap,
    /// Bumps on every upsert.
    pub version: i64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Source channel of a log chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    /// Captured standard output.
    Stdout,
    /// Captured standard error.
    Stderr,
    /// Replayed from the persisted log file.
    File,
}

impl LogChannel {
    /// Stable string form used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::File => "file",
        }
    }
}

/// A single log event as fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Source channel.
    pub stream: LogChannel,
    /// Line content, newline included when captured from a pipe.
    pub text: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

/// A single debugger control event as fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    /// Event kind (`tunnel-ready`, `ack`, ...).
    pub kind: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Scope that implicitly satisfies every check.
pub const SCOPE_ADMIN: &str = "admin";
/// Read access to repositories, sessions, and commands.
pub const SCOPE_SESSIONS_READ: &str = "sessions:read";
/// Create and cancel sessions, queue commands.
pub const SCOPE_SESSIONS_WRITE: &str = "sessions:write";
/// Queue commands without full session write access.
pub const SCOPE_COMMANDS_WRITE: &str = "commands:write";
/// Read and download artifacts.
pub const SCOPE_ARTIFACTS_READ: &str = "artifacts:read";

/// Returns `true` iff `granted` contains `admin` or every scope in
/// `required`.
pub fn require_scopes<S: AsRef<str>>(granted: &[S], required: &[&str]) -> bool {
    if granted.iter().any(|s| s.as_ref() == SCOPE_ADMIN) {
        return true;
    }
    required
        .iter()
        .all(|needed| granted.iter().any(|s| s.as_ref() == *needed))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Constant-time equality over byte strings of equal length.
///
/// Returns `false` immediately on length mismatch; the timing of the
/// comparison does not depend on where the contents differ.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Join an argv into a single shell-safe string (POSIX quoting).
#[must_use]
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
