// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-store
//!
//! The transactional source of truth for debug-plane: repositories,
//! worktrees and their lease state machine, sessions, commands, artifacts,
//! bearer tokens, and debugger state, persisted in SQLite via `sqlx`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod schema;
mod store;

pub use store::{LeaseRecord, MetadataStore};

/// Errors surfaced by the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Entity kind, e.g. `"session"`.
        entity: &'static str,
    },

    /// Every worktree row is leased and none has an expired lease.
    #[error("no worktree available for reservation")]
    NoAvailableWorktree,

    /// A release was attempted with a token that does not match the stored
    /// lease token.
    #[error("lease token mismatch")]
    LeaseMismatch,

    /// A uniqueness or state-machine constraint was violated.
    #[error("metadata conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Decode(String),

    /// Any other database failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn from_insert(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::Conflict(format!("{what} already exists"));
            }
        }
        StoreError::Database(err)
    }
}
