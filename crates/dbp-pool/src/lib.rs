// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-pool
//!
//! The workspace pool: a bare mirror per repository plus a bounded set of
//! reusable checkouts, handed out as leases recorded in the metadata store
//! and advanced to whatever commit a session pins.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use dbp_core::{Worktree, WorktreeStatus};
use dbp_store::{MetadataStore, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors surfaced by the workspace pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A git invocation failed; carries its stderr (or stdout) output.
    #[error("git: {0}")]
    Git(String),

    /// The per-repository worktree cap was reached.
    #[error("worktree capacity exhausted")]
    CapacityExhausted,

    /// Metadata store failure (including lease conflicts).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Filesystem failure while managing checkout directories.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration of a per-repository pool.
#[derive(Debug, Clone)]
pub struct WorktreePoolSettings {
    /// Repository the pool serves.
    pub repository_id: i64,
    /// Upstream URL the mirror fetches from.
    pub remote_url: String,
    /// Location of the bare mirror.
    pub bare_path: PathBuf,
    /// Directory that holds the worktree checkouts.
    pub worktree_root: PathBuf,
    /// How long a lease lives before it becomes reclaimable.
    pub lease_ttl: Duration,
    /// Upper bound on registered worktree rows.
    pub max_worktrees: usize,
    /// Whether `release` resets and scrubs the checkout.
    pub clean_checkout: bool,
}

impl WorktreePoolSettings {
    /// Settings with the stock lease TTL (30 minutes) and cap (16).
    pub fn new(
        repository_id: i64,
        remote_url: impl Into<String>,
        bare_path: impl Into<PathBuf>,
        worktree_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository_id,
            remote_url: remote_url.into(),
            bare_path: bare_path.into(),
            worktree_root: worktree_root.into(),
            lease_ttl: Duration::minutes(30),
            max_worktrees: 16,
            clean_checkout: true,
        }
    }
}

/// A reserved worktree, prepared at the requested commit.
///
/// The lease is a scoped claim: callers must hand it back via
/// [`WorktreePool::release`] on every path. An abandoned lease expires
/// after the pool TTL and the row becomes reclaimable by other callers.
#[derive(Debug)]
pub struct WorktreeLease {
    /// The leased row, post-update.
    pub worktree: Worktree,
    /// Token proving ownership; required to release.
    pub lease_token: String,
    /// Checkout directory.
    pub path: PathBuf,
    /// Commit the checkout points at.
    pub commit_sha: String,
    /// Environment fingerprint requested with the lease.
    pub environment_hash: Option<String>,
    /// True when the environment fingerprint changed since this worktree
    /// was last prepared, i.e. dependencies must be synced.
    pub needs_dependency_sync: bool,
}

/// One row of [`WorktreePool::describe`] output.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeSnapshot {
    /// Row id.
    pub id: i64,
    /// Checkout path.
    pub path: String,
    /// Lease state.
    pub status: WorktreeStatus,
    /// Commit last prepared.
    pub commit: Option<String>,
    /// Environment fingerprint last prepared.
    pub environment_hash: Option<String>,
    /// Last row update.
    pub updated_at: DateTime<Utc>,
}

/// Manages the mirror and checkout directories shared across sessions.
#[derive(Debug, Clone)]
pub struct WorktreePool {
    store: MetadataStore,
    settings: WorktreePoolSettings,
}

impl WorktreePool {
    /// Create a pool, making sure the mirror and worktree roots exist.
    pub fn new(store: MetadataStore, settings: WorktreePoolSettings) -> Result<Self, PoolError> {
        if let Some(parent) = settings.bare_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&settings.worktree_root)?;
        Ok(Self { store, settings })
    }

    /// The pool's settings.
    pub fn settings(&self) -> &WorktreePoolSettings {
        &self.settings
    }

    // -- git plumbing --------------------------------------------------------

    async fn run_git(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        git_dir: Option<&Path>,
    ) -> Result<(), PoolError> {
        let mut cmd = Command::new("git");
        if let Some(dir) = git_dir {
            cmd.arg("--git-dir").arg(dir);
        }
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| PoolError::Git(format!("spawn git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(PoolError::Git(format!("git {}: {detail}", args.join(" "))));
        }
        Ok(())
    }

    /// Ensure the bare mirror exists and carries the remote's current refs.
    pub async fn ensure_bare_repo(&self) -> Result<(), PoolError> {
        let bare = &self.settings.bare_path;
        if !bare.exists() {
            info!(
                remote = %self.settings.remote_url,
                mirror = %bare.display(),
                "cloning bare mirror"
            );
            self.run_git(
                &[
                    "clone",
                    "--bare",
                    &self.settings.remote_url,
                    &bare.to_string_lossy(),
                ],
                None,
                None,
            )
            .await?;
            // A bare clone carries no fetch refspec, so the prune fetch
            // below would never move refs/heads. Track the full ref
            // namespace.
            self.run_git(
                &["config", "remote.origin.fetch", "+refs/*:refs/*"],
                None,
                Some(bare),
            )
            .await?;
        }
        self.run_git(&["fetch", "--all", "--prune"], None, Some(bare))
            .await
    }

    // -- leasing -------------------------------------------------------------

    /// Lease a worktree prepared at `commit_sha`.
    ///
    /// Registers a fresh row when every existing one is leased, up to the
    /// configured cap.
    pub async fn acquire_worktree(
        &self,
        commit_sha: &str,
        owner: &str,
        environment_hash: Option<&str>,
    ) -> Result<WorktreeLease, PoolError> {
        self.ensure_bare_repo().await?;
        let lease = match self
            .store
            .reserve_worktree(self.settings.repository_id, owner, self.settings.lease_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(StoreError::NoAvailableWorktree) => {
                self.register_worktree_row().await?;
                self.store
                    .reserve_worktree(self.settings.repository_id, owner, self.settings.lease_ttl)
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        let path = PathBuf::from(&lease.worktree.path);
        self.prepare_checkout(&path, commit_sha).await?;

        let needs_sync = environment_hash
            .is_some_and(|requested| lease.worktree.environment_hash.as_deref() != Some(requested));
        let updated = self
            .store
            .update_worktree_metadata(lease.worktree.id, Some(commit_sha), environment_hash)
            .await?;
        debug!(
            worktree = updated.id,
            commit = commit_sha,
            needs_sync,
            "worktree acquired"
        );
        Ok(WorktreeLease {
            worktree: updated,
            lease_token: lease.lease_token,
            path,
            commit_sha: commit_sha.to_string(),
            environment_hash: environment_hash.map(str::to_string),
            needs_dependency_sync: needs_sync,
        })
    }

    /// Hand a lease back. With `clean` set (and the pool configured for
    /// it), the checkout is hard-reset and scrubbed of untracked and
    /// ignored files first.
    pub async fn release(&self, lease: WorktreeLease, clean: bool) -> Result<(), PoolError> {
        if clean && self.settings.clean_checkout && lease.path.exists() {
            self.run_git(&["reset", "--hard", "HEAD"], Some(&lease.path), None)
                .await?;
            self.run_git(&["clean", "-fdx"], Some(&lease.path), None)
                .await?;
        }
        self.store
            .release_worktree(lease.worktree.id, &lease.lease_token)
            .await?;
        Ok(())
    }

    // -- checkout helpers ----------------------------------------------------

    async fn prepare_checkout(&self, path: &Path, commit_sha: &str) -> Result<(), PoolError> {
        let bare = self.settings.bare_path.to_string_lossy().into_owned();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.run_git(&["clone", &bare, &path.to_string_lossy()], None, None)
                .await?;
        } else {
            self.run_git(&["remote", "set-url", "origin", &bare], Some(path), None)
                .await?;
        }
        self.run_git(&["fetch", "origin", "--prune"], Some(path), None)
            .await?;
        self.checkout_commit(path, commit_sha).await?;
        self.run_git(&["reset", "--hard", commit_sha], Some(path), None)
            .await
    }

    async fn checkout_commit(&self, path: &Path, commit_sha: &str) -> Result<(), PoolError> {
        match self
            .run_git(&["checkout", "--detach", commit_sha], Some(path), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(PoolError::Git(detail)) => {
                // The commit may have landed upstream after the mirror was
                // last fetched. Refresh the mirror and pull the commit from
                // both sources, then try once more.
                warn!(commit = commit_sha, detail, "checkout failed, refetching");
                self.ensure_bare_repo().await?;
                self.run_git(&["fetch", "origin", "--prune"], Some(path), None)
                    .await?;
                self.run_git(
                    &["fetch", &self.settings.remote_url, commit_sha],
                    Some(path),
                    None,
                )
                .await?;
                self.run_git(&["checkout", "--detach", commit_sha], Some(path), None)
                    .await
            }
            Err(other) => Err(other),
        }
    }

    async fn register_worktree_row(&self) -> Result<Worktree, PoolError> {
        let existing = self
            .store
            .list_worktrees(self.settings.repository_id)
            .await?;
        if existing.len() >= self.settings.max_worktrees {
            return Err(PoolError::CapacityExhausted);
        }
        let suffix = &Uuid::new_v4().simple().to_string()[..10];
        let path = self.settings.worktree_root.join(format!("wt-{suffix}"));
        Ok(self
            .store
            .register_worktree(self.settings.repository_id, &path.to_string_lossy())
            .await?)
    }

    // -- maintenance ---------------------------------------------------------

    /// Delete idle checkouts that have not been touched for `max_idle_age`
    /// and clear their commit/environment metadata. The rows survive so
    /// their paths can be reused.
    pub async fn reclaim_stale_worktrees(
        &self,
        max_idle_age: Duration,
    ) -> Result<Vec<PathBuf>, PoolError> {
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for worktree in self
            .store
            .list_worktrees(self.settings.repository_id)
            .await?
        {
            if worktree.status != WorktreeStatus::Idle {
                continue;
            }
            if worktree.updated_at + max_idle_age > now {
                continue;
            }
            let path = PathBuf::from(&worktree.path);
            if path.exists() {
                tokio::fs::remove_dir_all(&path).await?;
            }
            self.store
                .update_worktree_metadata(worktree.id, None, None)
                .await?;
            info!(worktree = worktree.id, path = %path.display(), "reclaimed");
            reclaimed.push(path);
        }
        Ok(reclaimed)
    }

    /// Serializable snapshot of every row the pool tracks.
    pub async fn describe(&self) -> Result<Vec<WorktreeSnapshot>, PoolError> {
        let rows = self
            .store
            .list_worktrees(self.settings.repository_id)
            .await?;
        Ok(rows
            .into_iter()
            .map(|w| WorktreeSnapshot {
                id: w.id,
                path: w.path,
                status: w.status,
                commit: w.commit_sha,
                environment_hash: w.environment_hash,
                updated_at: w.updated_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbp_core::JsonMap;
    use std::path::Path;
    use std::process::Command as StdCommand;

    fn git(args: &[&str], cwd: &Path) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn git_stdout(args: &[&str], cwd: &Path) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(output.status.success());
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit_file(origin: &Path, name: &str, contents: &str, message: &str) -> String {
        std::fs::write(origin.join(name), contents).unwrap();
        git(&["add", "-A"], origin);
        git(
            &[
                "-c",
                "user.name=pool-test",
                "-c",
                "user.email=pool@test",
                "commit",
                "-qm",
                message,
            ],
            origin,
        );
        git_stdout(&["rev-parse", "HEAD"], origin)
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        origin: PathBuf,
        store: MetadataStore,
        pool: WorktreePool,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        git(&["init", "-q"], &origin);

        let store = MetadataStore::in_memory().await.unwrap();
        let repo = store
            .upsert_repository(
                "demo",
                &origin.to_string_lossy(),
                "master",
                None,
                &JsonMap::new(),
            )
            .await
            .unwrap();
        let settings = WorktreePoolSettings::new(
            repo.id,
            origin.to_string_lossy().into_owned(),
            tmp.path().join("repos").join("demo.bare"),
            tmp.path().join("worktrees").join("demo"),
        );
        let pool = WorktreePool::new(store.clone(), settings).unwrap();
        Fixture {
            _tmp: tmp,
            origin,
            store,
            pool,
        }
    }

    #[tokio::test]
    async fn lease_reuse_and_dependency_sync_flag() {
        let fx = fixture().await;
        let c1 = commit_file(&fx.origin, "README.md", "one\n", "first");
        let c2 = commit_file(&fx.origin, "README.md", "two\n", "second");

        let lease1 = fx
            .pool
            .acquire_worktree(&c1, "worker-1", Some("env-a"))
            .await
            .unwrap();
        assert!(lease1.needs_dependency_sync, "first acquire must sync");
        assert!(lease1.path.join("README.md").exists());
        assert_eq!(
            std::fs::read_to_string(lease1.path.join("README.md")).unwrap(),
            "one\n"
        );
        let first_id = lease1.worktree.id;
        fx.pool.release(lease1, true).await.unwrap();

        // Same environment hash: the row is reused and no sync is needed.
        let lease2 = fx
            .pool
            .acquire_worktree(&c2, "worker-1", Some("env-a"))
            .await
            .unwrap();
        assert_eq!(lease2.worktree.id, first_id);
        assert!(!lease2.needs_dependency_sync);
        assert_eq!(
            std::fs::read_to_string(lease2.path.join("README.md")).unwrap(),
            "two\n"
        );
        fx.pool.release(lease2, true).await.unwrap();

        // Changed environment hash: sync again.
        let lease3 = fx
            .pool
            .acquire_worktree(&c2, "worker-1", Some("env-b"))
            .await
            .unwrap();
        assert_eq!(lease3.worktree.id, first_id);
        assert!(lease3.needs_dependency_sync);
        fx.pool.release(lease3, true).await.unwrap();
    }

    #[tokio::test]
    async fn release_scrubs_untracked_files() {
        let fx = fixture().await;
        let c1 = commit_file(&fx.origin, "README.md", "clean\n", "first");

        let lease = fx
            .pool
            .acquire_worktree(&c1, "worker-1", None)
            .await
            .unwrap();
        let litter = lease.path.join("scratch.txt");
        std::fs::write(&litter, "junk").unwrap();
        let path = lease.path.clone();
        fx.pool.release(lease, true).await.unwrap();
        assert!(!litter.exists(), "release must scrub untracked files");
        assert!(path.join("README.md").exists());
    }

    #[tokio::test]
    async fn capacity_exhausted_when_cap_reached() {
        let mut fx = fixture().await;
        let c1 = commit_file(&fx.origin, "README.md", "x\n", "first");
        fx.pool.settings.max_worktrees = 1;

        let held = fx
            .pool
            .acquire_worktree(&c1, "worker-1", None)
            .await
            .unwrap();
        let err = fx
            .pool
            .acquire_worktree(&c1, "worker-2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::CapacityExhausted));
        fx.pool.release(held, false).await.unwrap();
    }

    #[tokio::test]
    async fn commit_pushed_after_bare_clone_is_recovered() {
        let fx = fixture().await;
        let c1 = commit_file(&fx.origin, "README.md", "one\n", "first");

        // Populate the bare mirror, then land a new commit upstream.
        let lease = fx
            .pool
            .acquire_worktree(&c1, "worker-1", None)
            .await
            .unwrap();
        fx.pool.release(lease, true).await.unwrap();
        let c2 = commit_file(&fx.origin, "README.md", "fresh\n", "second");

        let lease = fx
            .pool
            .acquire_worktree(&c2, "worker-1", None)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(lease.path.join("README.md")).unwrap(),
            "fresh\n"
        );
        fx.pool.release(lease, true).await.unwrap();
    }

    #[tokio::test]
    async fn reclaim_removes_idle_checkouts_but_keeps_rows() {
        let fx = fixture().await;
        let c1 = commit_file(&fx.origin, "README.md", "x\n", "first");
        let lease = fx
            .pool
            .acquire_worktree(&c1, "worker-1", Some("env-a"))
            .await
            .unwrap();
        let path = lease.path.clone();
        fx.pool.release(lease, true).await.unwrap();

        // Nothing is older than an hour yet.
        let untouched = fx
            .pool
            .reclaim_stale_worktrees(Duration::hours(1))
            .await
            .unwrap();
        assert!(untouched.is_empty());
        assert!(path.exists());

        // With a negative threshold everything idle is stale.
        let reclaimed = fx
            .pool
            .reclaim_stale_worktrees(Duration::seconds(-5))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![path.clone()]);
        assert!(!path.exists());

        let rows = fx.store.list_worktrees(fx.pool.settings.repository_id).await.unwrap();
        assert_eq!(rows.len(), 1, "the row survives reclaim");
        assert!(rows[0].commit_sha.is_none());
        assert!(rows[0].environment_hash.is_none());
    }

    #[tokio::test]
    async fn describe_reports_rows() {
        let fx = fixture().await;
        let c1 = commit_file(&fx.origin, "README.md", "x\n", "first");
        let lease = fx
            .pool
            .acquire_worktree(&c1, "worker-1", None)
            .await
            .unwrap();

        let snapshot = fx.pool.describe().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, WorktreeStatus::Reserved);
        assert_eq!(snapshot[0].commit.as_deref(), Some(c1.as_str()));
        fx.pool.release(lease, false).await.unwrap();
    }
}
