// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-env
//!
//! Content-hash fingerprinting of dependency manifests and the cache of
//! per-name interpreter environments keyed by those fingerprints.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod fingerprint;
mod manager;

pub use fingerprint::{DependencyState, DependencyStateStore, compute_dependency_hash};
pub use manager::{EnvironmentHandle, EnvironmentManager, EnvironmentRequest};

use std::path::PathBuf;

/// Errors surfaced by fingerprinting and environment provisioning.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// A manifest listed in the request does not exist.
    #[error("manifest not found: {0}")]
    ManifestMissing(PathBuf),

    /// Filesystem failure while hashing or provisioning.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The interpreter invocation that builds the environment failed.
    #[error("environment provisioning failed: {0}")]
    Provision(String),

    /// A persisted state file could not be encoded or decoded.
    #[error("dependency state: {0}")]
    State(String),
}
