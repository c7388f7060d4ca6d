// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dependency fingerprinting and the on-disk fingerprint cache.

use crate::EnvError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Compute a stable hex SHA-256 over a set of manifest files plus metadata.
///
/// Manifests are visited in path-sorted order; each contributes its
/// basename, its full contents, and its last-modified time in nanoseconds,
/// so renaming, editing, or touching any manifest changes the output.
/// Metadata pairs are folded in key-sorted order. A missing manifest is a
/// hard error, never silently skipped.
pub fn compute_dependency_hash(
    manifests: &[PathBuf],
    metadata: &BTreeMap<String, String>,
) -> Result<String, EnvError> {
    let mut paths: Vec<&PathBuf> = manifests.iter().collect();
    paths.sort_by_key(|p| p.to_string_lossy().into_owned());

    let mut digest = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    for path in paths {
        if !path.exists() {
            return Err(EnvError::ManifestMissing(path.clone()));
        }
        if let Some(name) = path.file_name() {
            digest.update(name.to_string_lossy().as_bytes());
        }
        let mut file = File::open(path)?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        let mtime_ns = mtime_nanos(path)?;
        digest.update(mtime_ns.to_string().as_bytes());
    }
    for (key, value) in metadata {
        digest.update(key.as_bytes());
        digest.update(value.as_bytes());
    }
    Ok(format!("{:x}", digest.finalize()))
}

fn mtime_nanos(path: &Path) -> Result<u128, EnvError> {
    let modified = std::fs::metadata(path)?.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| EnvError::State(format!("mtime before epoch for {}: {e}", path.display())))?;
    Ok(since_epoch.as_nanos())
}

// ---------------------------------------------------------------------------
// DependencyStateStore
// ---------------------------------------------------------------------------

/// The cached fingerprint of a named environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyState {
    /// Hex SHA-256 computed by [`compute_dependency_hash`].
    pub fingerprint: String,
    /// When the fingerprint was recorded.
    pub updated_at: DateTime<Utc>,
    /// Metadata recorded alongside the fingerprint.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Persists fingerprints as tiny per-key JSON files so workers can skip
/// dependency syncs across restarts.
#[derive(Debug, Clone)]
pub struct DependencyStateStore {
    root: PathBuf,
}

impl DependencyStateStore {
    /// Open (creating if needed) a state store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EnvError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn state_path(&self, key: &str) -> PathBuf {
        let safe_key = key.replace('/', "_");
        self.root.join(format!("{safe_key}.json"))
    }

    /// Read the recorded state for `key`, or `None` when nothing was saved.
    pub fn read(&self, key: &str) -> Result<Option<DependencyState>, EnvError> {
        let path = self.state_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&raw)
            .map_err(|e| EnvError::State(format!("{}: {e}", path.display())))?;
        Ok(Some(state))
    }

    /// Record `fingerprint` (and metadata) for `key`.
    pub fn write(
        &self,
        key: &str,
        fingerprint: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<DependencyState, EnvError> {
        let state = DependencyState {
            fingerprint: fingerprint.to_string(),
            updated_at: Utc::now(),
            metadata: metadata.clone(),
        };
        let raw = serde_json::to_string_pretty(&state)
            .map_err(|e| EnvError::State(e.to_string()))?;
        std::fs::write(self.state_path(key), raw)?;
        Ok(state)
    }

    /// Returns `true` when `fingerprint` differs from the recorded state
    /// (or nothing was recorded yet).
    pub fn needs_sync(&self, key: &str, fingerprint: &str) -> Result<bool, EnvError> {
        Ok(match self.read(key)? {
            None => true,
            Some(state) => state.fingerprint != fingerprint,
        })
    }
}
