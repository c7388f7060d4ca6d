// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-runner
//!
//! Drives a single session's work: apply the session patch, make sure the
//! interpreter environment is in sync, spawn each queued command with its
//! output captured line by line, and record results and log artifacts in
//! the metadata store. Debugger launches ride the same pipeline behind a
//! token-guarded tunnel endpoint.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod debugger;
mod supervisor;

pub use debugger::{
    DebuggerAdapter, DebuggerLaunch, DebuggerTunnel, LaunchRequest, TunnelManager,
};
pub use supervisor::{
    CommandOutcome, CommandSpec, RunnerPaths, SessionPatch, StreamObserver, WorkerSupervisor,
    Workspace,
};

use dbp_env::EnvError;
use dbp_store::StoreError;

/// Errors surfaced by the supervisor and the debugger adapters.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The session patch did not apply cleanly; no command was recorded.
    #[error("patch application failed: {0}")]
    PatchFailed(String),

    /// The process could not be spawned; the command row is marked failed.
    #[error("failed to start command: {0}")]
    SpawnFailed(String),

    /// A debugger launch request is incomplete.
    #[error("invalid launch request: {0}")]
    InvalidLaunchRequest(String),

    /// Metadata store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Environment provisioning failure.
    #[error(transparent)]
    Env(#[from] EnvError),

    /// Filesystem failure around logs or patches.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
