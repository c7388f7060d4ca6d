// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-config
//!
//! Server configuration for debug-plane: a TOML file describing the bind
//! address, filesystem roots, and database location, with
//! `DEBUG_SERVER_DB_URL` / `DEBUG_SERVER_DB_PATH` environment overrides.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Filesystem failure while reading the file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Raw TOML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    bind: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    paths: RawPaths,
    #[serde(default)]
    database: RawDatabase,
    #[serde(default)]
    debugger: RawDebugger,
}

#[derive(Debug, Default, Deserialize)]
struct RawPaths {
    #[serde(default)]
    artifacts: Option<PathBuf>,
    #[serde(default)]
    logs: Option<PathBuf>,
    #[serde(default)]
    environments: Option<PathBuf>,
    #[serde(default)]
    patches: Option<PathBuf>,
    #[serde(default)]
    repos: Option<PathBuf>,
    #[serde(default)]
    worktrees: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDatabase {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDebugger {
    #[serde(default)]
    host: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Resolved filesystem layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPaths {
    /// Root under which the defaults below live.
    pub artifacts_root: PathBuf,
    /// Per-session command logs.
    pub logs_dir: PathBuf,
    /// Cached interpreter environments.
    pub environments_dir: PathBuf,
    /// Content-addressed session patches.
    pub patches_dir: PathBuf,
    /// Bare repository mirrors.
    pub repos_dir: PathBuf,
    /// Worktree checkouts.
    pub worktrees_dir: PathBuf,
}

/// Top-level runtime configuration for the debug-plane daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub bind: String,
    /// Log level override (e.g. `"debug"`, `"info"`).
    pub log_level: Option<String>,
    /// Filesystem layout.
    pub paths: ServerPaths,
    /// Database URL from the config file, if any.
    pub database_url: Option<String>,
    /// Host debugger tunnels bind to.
    pub tunnel_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        resolve(RawConfig::default())
    }
}

impl ServerConfig {
    /// Load configuration from an optional TOML file. `None` (or a missing
    /// default location) yields the built-in defaults; an explicitly named
    /// file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: RawConfig = toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        Ok(resolve(parsed))
    }

    /// The effective database URL, consulting `DEBUG_SERVER_DB_URL` and
    /// `DEBUG_SERVER_DB_PATH` from the process environment.
    pub fn database_url(&self) -> String {
        self.database_url_with(
            std::env::var("DEBUG_SERVER_DB_URL").ok(),
            std::env::var("DEBUG_SERVER_DB_PATH").ok(),
        )
    }

    /// [`database_url`](Self::database_url) with explicit environment
    /// values. Precedence: `DEBUG_SERVER_DB_URL`, then the config file,
    /// then `DEBUG_SERVER_DB_PATH`, then a SQLite file under the
    /// artifacts root.
    pub fn database_url_with(
        &self,
        env_url: Option<String>,
        env_path: Option<String>,
    ) -> String {
        if let Some(url) = env_url.filter(|u| !u.is_empty()) {
            return url;
        }
        if let Some(url) = &self.database_url {
            return url.clone();
        }
        if let Some(path) = env_path.filter(|p| !p.is_empty()) {
            return format!("sqlite://{path}");
        }
        let default = self.paths.artifacts_root.join("data").join("metadata.db");
        format!("sqlite://{}", default.display())
    }
}

fn resolve(raw: RawConfig) -> ServerConfig {
    let artifacts_root = raw
        .paths
        .artifacts
        .unwrap_or_else(|| PathBuf::from(".artifacts"));
    let paths = ServerPaths {
        logs_dir: raw.paths.logs.unwrap_or_else(|| artifacts_root.join("logs")),
        environments_dir: raw
            .paths
            .environments
            .unwrap_or_else(|| artifacts_root.join("envs")),
        patches_dir: raw
            .paths
            .patches
            .unwrap_or_else(|| artifacts_root.join("patches")),
        repos_dir: raw
            .paths
            .repos
            .unwrap_or_else(|| artifacts_root.join("repos")),
        worktrees_dir: raw
            .paths
            .worktrees
            .unwrap_or_else(|| artifacts_root.join("worktrees")),
        artifacts_root,
    };
    ServerConfig {
        bind: raw.bind.unwrap_or_else(|| "127.0.0.1:8099".to_string()),
        log_level: raw.log_level,
        paths,
        database_url: raw.database.url,
        tunnel_host: raw
            .debugger
            .host
            .unwrap_or_else(|| "127.0.0.1".to_string()),
    }
}
