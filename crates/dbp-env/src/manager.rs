// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interpreter environment provisioning keyed by dependency fingerprints.

use crate::fingerprint::{DependencyStateStore, compute_dependency_hash};
use crate::EnvError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Describes the environment a command wants to run in.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRequest {
    /// Cache key, usually the session id or a project label. Slashes are
    /// normalized away before touching the filesystem.
    pub name: String,
    /// Dependency manifests that pin the environment contents.
    pub manifests: Vec<PathBuf>,
    /// Extra inputs folded into the fingerprint (interpreter version, OS).
    pub metadata: BTreeMap<String, String>,
}

impl EnvironmentRequest {
    /// Request a plain environment with no manifests.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A provisioned environment ready to run user commands.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    /// Environment root directory.
    pub path: PathBuf,
    /// Interpreter inside the environment.
    pub python_path: PathBuf,
    /// Directory prepended to `PATH` for child processes.
    pub bin_path: PathBuf,
    /// Fingerprint the environment was built for, when manifests or
    /// metadata were supplied.
    pub fingerprint: Option<String>,
}

/// Creates and reuses venv-style worker environments under a root
/// directory, skipping rebuilds when the dependency fingerprint is
/// unchanged.
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    root: PathBuf,
    interpreter: String,
    state_store: DependencyStateStore,
}

impl EnvironmentManager {
    /// Open a manager rooted at `root`; fingerprints live under a hidden
    /// `.state` subdirectory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EnvError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let state_store = DependencyStateStore::new(root.join(".state"))?;
        Ok(Self {
            root,
            interpreter: "python3".to_string(),
            state_store,
        })
    }

    /// Override the interpreter used to build environments.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Return a ready-to-use environment for `request`, rebuilding when
    /// `force` is set, the directory is missing, or the fingerprint
    /// changed.
    pub async fn ensure(
        &self,
        request: &EnvironmentRequest,
        force: bool,
    ) -> Result<EnvironmentHandle, EnvError> {
        let name = {
            let trimmed = request.name.trim();
            if trimmed.is_empty() { "default" } else { trimmed }
        };
        let env_path = self.root.join(name.replace('/', "-"));
        let state_key = name.replace('/', "_");

        let fingerprint = if request.manifests.is_empty() && request.metadata.is_empty() {
            None
        } else {
            Some(compute_dependency_hash(&request.manifests, &request.metadata)?)
        };

        if force || self.needs_rebuild(&env_path, &state_key, fingerprint.as_deref())? {
            info!(env = name, forced = force, "rebuilding environment");
            self.provision(&env_path).await?;
            if let Some(fp) = &fingerprint {
                self.state_store.write(&state_key, fp, &request.metadata)?;
            }
        } else if let Some(fp) = &fingerprint {
            // Backfill state lost out-of-band so the next decision is cheap.
            if self.state_store.read(&state_key)?.is_none() {
                self.state_store.write(&state_key, fp, &request.metadata)?;
            }
        } else {
            debug!(env = name, "reusing environment");
        }

        Ok(EnvironmentHandle {
            python_path: env_path.join("bin").join("python"),
            bin_path: env_path.join("bin"),
            path: env_path,
            fingerprint,
        })
    }

    fn needs_rebuild(
        &self,
        env_path: &Path,
        state_key: &str,
        fingerprint: Option<&str>,
    ) -> Result<bool, EnvError> {
        if !env_path.exists() {
            return Ok(true);
        }
        let Some(fingerprint) = fingerprint else {
            return Ok(false);
        };
        self.state_store.needs_sync(state_key, fingerprint)
    }

    async fn provision(&self, env_path: &Path) -> Result<(), EnvError> {
        if env_path.exists() {
            tokio::fs::remove_dir_all(env_path).await?;
        }
        tokio::fs::create_dir_all(env_path).await?;
        let output = Command::new(&self.interpreter)
            .arg("-m")
            .arg("venv")
            .arg("--clear")
            .arg(env_path)
            .output()
            .await
            .map_err(|e| EnvError::Provision(format!("{}: {e}", self.interpreter)))?;
        if !output.status.success() {
            // Do not leave a half-built directory that would be mistaken
            // for a usable environment on the next lookup.
            let _ = tokio::fs::remove_dir_all(env_path).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnvError::Provision(stderr.trim().to_string()));
        }
        Ok(())
    }
}
