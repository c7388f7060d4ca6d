// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker supervisor: patch, environment sync, spawn, pump, record.

use crate::RunnerError;
use dbp_core::{ArtifactKind, CommandStatus, JsonMap, LogChannel, LogEvent, sha256_hex, shell_join};
use dbp_env::{EnvironmentHandle, EnvironmentManager, EnvironmentRequest};
use dbp_pool::WorktreeLease;
use dbp_store::MetadataStore;
use dbp_stream::LogStream;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Filesystem layout for runner artifacts.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    /// Root under which everything else lives.
    pub artifacts_root: PathBuf,
    /// Per-session command logs.
    pub logs_dir: PathBuf,
    /// Cached interpreter environments.
    pub environments_dir: PathBuf,
    /// Content-addressed session patches.
    pub patches_dir: PathBuf,
}

impl RunnerPaths {
    /// Standard layout under a single root directory.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            logs_dir: root.join("logs"),
            environments_dir: root.join("envs"),
            patches_dir: root.join("patches"),
            artifacts_root: root,
        }
    }
}

/// Configuration for one command execution.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Environment overrides layered on top of the supervisor's base env.
    pub env: BTreeMap<String, String>,
    /// Working directory; defaults to the workspace.
    pub cwd: Option<PathBuf>,
    /// Log file stem.
    pub log_name: String,
    /// Kill the process after this long.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// A spec with default log name and no overrides.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
            log_name: "command".to_string(),
            timeout: None,
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A patch blob applied to the workspace before commands run.
#[derive(Debug, Clone)]
pub struct SessionPatch {
    /// Unified diff text.
    pub diff: String,
    /// Optional human description.
    pub description: Option<String>,
}

/// The slice of a worktree lease the supervisor needs.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Checkout directory commands run in.
    pub path: PathBuf,
    /// Whether the environment must be rebuilt before running.
    pub needs_dependency_sync: bool,
}

impl From<&WorktreeLease> for Workspace {
    fn from(lease: &WorktreeLease) -> Self {
        Self {
            path: lease.path.clone(),
            needs_dependency_sync: lease.needs_dependency_sync,
        }
    }
}

/// Details about a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Database id of the command row.
    pub command_id: i64,
    /// Terminal status.
    pub status: CommandStatus,
    /// Exit code; `None` for kills and spawn failures.
    pub exit_code: Option<i64>,
    /// Captured log file.
    pub log_path: PathBuf,
}

/// Callback receiving every log chunk as it is written.
pub type StreamObserver = Arc<dyn Fn(&LogEvent) + Send + Sync>;

/// Coordinates environment prep, patch application, and command execution
/// for sessions. Cheap to clone.
#[derive(Clone)]
pub struct WorkerSupervisor {
    store: MetadataStore,
    paths: RunnerPaths,
    env_manager: EnvironmentManager,
    base_env: BTreeMap<String, String>,
}

impl WorkerSupervisor {
    /// Build a supervisor over `paths`, capturing the current process
    /// environment as the base env for children.
    pub fn new(store: MetadataStore, paths: RunnerPaths) -> Result<Self, RunnerError> {
        let base_env = std::env::vars().collect();
        Self::with_base_env(store, paths, base_env)
    }

    /// Build a supervisor with an explicit base environment.
    pub fn with_base_env(
        store: MetadataStore,
        paths: RunnerPaths,
        base_env: BTreeMap<String, String>,
    ) -> Result<Self, RunnerError> {
        std::fs::create_dir_all(&paths.logs_dir)?;
        std::fs::create_dir_all(&paths.patches_dir)?;
        let env_manager = EnvironmentManager::new(&paths.environments_dir)?;
        Ok(Self {
            store,
            paths,
            env_manager,
            base_env,
        })
    }

    /// Override the interpreter the environment manager provisions with.
    pub fn with_env_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.env_manager = self.env_manager.clone().with_interpreter(interpreter);
        self
    }

    /// The environment manager backing this supervisor.
    pub fn environment_manager(&self) -> &EnvironmentManager {
        &self.env_manager
    }

    /// Execute one command inside `workspace`, streaming its output and
    /// recording the result plus exactly one log artifact.
    pub async fn run_command(
        &self,
        session_id: &str,
        spec: &CommandSpec,
        workspace: &Workspace,
        env_request: Option<EnvironmentRequest>,
        patch: Option<&SessionPatch>,
        observers: &[StreamObserver],
    ) -> Result<CommandOutcome, RunnerError> {
        if let Some(patch) = patch {
            self.apply_patch(&workspace.path, patch).await?;
        }

        let env_request =
            env_request.unwrap_or_else(|| EnvironmentRequest::named(session_id));
        let env_handle = self
            .env_manager
            .ensure(&env_request, workspace.needs_dependency_sync)
            .await?;

        let cwd = spec
            .cwd
            .clone()
            .unwrap_or_else(|| workspace.path.clone());
        let env = self.build_env(&env_handle, &spec.env);
        let command_repr = shell_join(&spec.argv);
        let sequence = self.store.next_command_sequence(session_id).await?;
        let record = self
            .store
            .create_command(
                session_id,
                &command_repr,
                Some(&cwd.to_string_lossy()),
                &spec.env,
                sequence,
            )
            .await?;
        let command_id = record.id;

        let log_path = self
            .paths
            .logs_dir
            .join(session_id)
            .join(format!("{}-{command_id}.log", spec.log_name));
        let stream = Arc::new(LogStream::create(&log_path)?);
        for observer in observers {
            let observer = Arc::clone(observer);
            stream.add_listener(move |event| observer(event));
        }

        self.store
            .record_command_result(
                command_id,
                CommandStatus::Running,
                None,
                Some(&log_path.to_string_lossy()),
            )
            .await?;
        info!(session = session_id, command = command_id, %command_repr, "spawning");

        let (status, exit_code) = match self
            .spawn_and_stream(&spec.argv, &cwd, &env, &stream, spec.timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = stream.write(
                    &format!("Failed to start command: {err}\n"),
                    LogChannel::Stderr,
                );
                stream.close();
                self.record_completion(
                    session_id,
                    command_id,
                    CommandStatus::Failed,
                    None,
                    &log_path,
                    &spec.log_name,
                )
                .await?;
                return Err(RunnerError::SpawnFailed(err));
            }
        };

        stream.close();
        self.record_completion(
            session_id,
            command_id,
            status,
            exit_code,
            &log_path,
            &spec.log_name,
        )
        .await?;
        Ok(CommandOutcome {
            command_id,
            status,
            exit_code,
            log_path,
        })
    }

    // -- helpers -------------------------------------------------------------

    async fn spawn_and_stream(
        &self,
        argv: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        stream: &Arc<LogStream>,
        timeout: Option<Duration>,
    ) -> Result<(CommandStatus, Option<i64>), String> {
        let Some(program) = argv.first() else {
            return Err("empty argv".to_string());
        };
        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .current_dir(cwd)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| e.to_string())?;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(
                stdout,
                LogChannel::Stdout,
                Arc::clone(stream),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(
                stderr,
                LogChannel::Stderr,
                Arc::clone(stream),
            )));
        }

        let (status, exit_code) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(wait) => exit_to_status(wait.map_err(|e| e.to_string())?),
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = stream.write(
                        "Command exceeded timeout; process killed\n",
                        LogChannel::Stderr,
                    );
                    warn!(?limit, "command timed out");
                    (CommandStatus::Cancelled, None)
                }
            },
            None => exit_to_status(child.wait().await.map_err(|e| e.to_string())?),
        };

        for pump in pumps {
            let _ = pump.await;
        }
        Ok((status, exit_code))
    }

    async fn record_completion(
        &self,
        session_id: &str,
        command_id: i64,
        status: CommandStatus,
        exit_code: Option<i64>,
        log_path: &Path,
        log_name: &str,
    ) -> Result<(), RunnerError> {
        self.store
            .record_command_result(
                command_id,
                status,
                exit_code,
                Some(&log_path.to_string_lossy()),
            )
            .await?;
        let (size_bytes, checksum) = match std::fs::read(log_path) {
            Ok(bytes) => (Some(bytes.len() as i64), Some(sha256_hex(&bytes))),
            Err(_) => (None, None),
        };
        self.store
            .record_artifact(
                session_id,
                Some(command_id),
                ArtifactKind::Log,
                &log_path.to_string_lossy(),
                Some("text/plain"),
                Some(&format!("{log_name} output")),
                size_bytes,
                checksum.as_deref(),
                &JsonMap::new(),
            )
            .await?;
        Ok(())
    }

    async fn apply_patch(&self, workspace: &Path, patch: &SessionPatch) -> Result<(), RunnerError> {
        let digest = sha256_hex(patch.diff.as_bytes());
        let patch_path = self.paths.patches_dir.join(format!("{}.patch", &digest[..12]));
        tokio::fs::write(&patch_path, &patch.diff).await?;
        let patch_arg = patch_path.to_string_lossy().into_owned();
        run_patch_git(workspace, &["apply", "--check", &patch_arg]).await?;
        run_patch_git(workspace, &["apply", &patch_arg]).await?;
        info!(patch = %patch_path.display(), description = ?patch.description, "patch applied");
        Ok(())
    }

    fn build_env(
        &self,
        env_handle: &EnvironmentHandle,
        overrides: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = self.base_env.clone();
        env.insert(
            "VIRTUAL_ENV".to_string(),
            env_handle.path.to_string_lossy().into_owned(),
        );
        let base_path = env.get("PATH").cloned().unwrap_or_default();
        env.insert(
            "PATH".to_string(),
            format!("{}:{base_path}", env_handle.bin_path.to_string_lossy()),
        );
        for (key, value) in overrides {
            env.insert(key.clone(), value.clone());
        }
        // Children must not buffer output or inherit the server's own
        // interpreter home.
        env.entry("PYTHONUNBUFFERED".to_string())
            .or_insert_with(|| "1".to_string());
        env.remove("PYTHONHOME");
        env
    }
}

async fn run_patch_git(workspace: &Path, args: &[&str]) -> Result<(), RunnerError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .await
        .map_err(|e| RunnerError::PatchFailed(format!("spawn git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(RunnerError::PatchFailed(detail));
    }
    Ok(())
}

fn exit_to_status(status: std::process::ExitStatus) -> (CommandStatus, Option<i64>) {
    match status.code() {
        Some(0) => (CommandStatus::Succeeded, Some(0)),
        Some(code) => (CommandStatus::Failed, Some(code as i64)),
        // Killed by a signal.
        None => (CommandStatus::Failed, None),
    }
}

async fn pump_lines(
    pipe: impl tokio::io::AsyncRead + Unpin,
    channel: LogChannel,
    stream: Arc<LogStream>,
) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = stream.write(&format!("{line}\n"), channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbp_core::JsonMap;
    use dbp_core::Session;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: MetadataStore,
        supervisor: WorkerSupervisor,
        session: Session,
        workspace: Workspace,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_memory().await.unwrap();
        let repo = store
            .upsert_repository("demo", "https://example.com/demo.git", "main", None, &JsonMap::new())
            .await
            .unwrap();
        let session = store
            .create_session(repo.id, "abc1234", None, None, None, None, &JsonMap::new(), None)
            .await
            .unwrap();
        let paths = RunnerPaths::from_root(tmp.path().join("artifacts"));
        let supervisor = WorkerSupervisor::with_base_env(
            store.clone(),
            paths,
            BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
        )
        .unwrap()
        .with_env_interpreter("true");
        let workspace_dir = tmp.path().join("workspace");
        std::fs::create_dir_all(&workspace_dir).unwrap();
        std::fs::write(workspace_dir.join("README.md"), "hello\n").unwrap();
        Fixture {
            _tmp: tmp,
            store,
            supervisor,
            session,
            workspace: Workspace {
                path: workspace_dir,
                needs_dependency_sync: false,
            },
        }
    }

    #[tokio::test]
    async fn successful_command_records_everything() {
        let fx = fixture().await;
        let spec = CommandSpec::new(["/bin/sh", "-c", "echo hi; echo err >&2"]);
        let outcome = fx
            .supervisor
            .run_command(&fx.session.id, &spec, &fx.workspace, None, None, &[])
            .await
            .unwrap();

        assert_eq!(outcome.status, CommandStatus::Succeeded);
        assert_eq!(outcome.exit_code, Some(0));

        let log = std::fs::read_to_string(&outcome.log_path).unwrap();
        assert!(log.contains("hi\n"));
        assert!(log.contains("err\n"));

        let commands = fx.store.list_commands(&fx.session.id).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].sequence, 0);
        assert_eq!(commands[0].status, CommandStatus::Succeeded);
        assert_eq!(commands[0].exit_code, Some(0));
        assert!(commands[0].started_at.is_some());
        assert!(commands[0].completed_at.is_some());

        // Exactly one log artifact whose path matches the command row.
        let artifacts = fx.store.list_artifacts(&fx.session.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, ArtifactKind::Log);
        assert_eq!(Some(artifacts[0].path.clone()), commands[0].log_path);
        assert_eq!(artifacts[0].size_bytes, Some(log.len() as i64));
        assert_eq!(
            artifacts[0].checksum_sha256.as_deref(),
            Some(sha256_hex(log.as_bytes()).as_str())
        );
    }

    #[tokio::test]
    async fn observers_see_labelled_chunks_in_order() {
        let fx = fixture().await;
        let seen: Arc<std::sync::Mutex<Vec<(LogChannel, String)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: StreamObserver = Arc::new(move |event: &LogEvent| {
            sink.lock()
                .expect("observer lock poisoned")
                .push((event.stream, event.text.clone()));
        });

        let spec = CommandSpec::new(["/bin/sh", "-c", "echo one; echo two"]);
        fx.supervisor
            .run_command(&fx.session.id, &spec, &fx.workspace, None, None, &[observer])
            .await
            .unwrap();

        let chunks = seen.lock().unwrap().clone();
        assert_eq!(
            chunks,
            vec![
                (LogChannel::Stdout, "one\n".to_string()),
                (LogChannel::Stdout, "two\n".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let fx = fixture().await;
        let spec = CommandSpec::new(["/bin/sh", "-c", "exit 3"]);
        let outcome = fx
            .supervisor
            .run_command(&fx.session.id, &spec, &fx.workspace, None, None, &[])
            .await
            .unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_kills_and_cancels() {
        let fx = fixture().await;
        let spec =
            CommandSpec::new(["sleep", "5"]).with_timeout(Duration::from_millis(200));
        let outcome = fx
            .supervisor
            .run_command(&fx.session.id, &spec, &fx.workspace, None, None, &[])
            .await
            .unwrap();
        assert_eq!(outcome.status, CommandStatus::Cancelled);
        assert_eq!(outcome.exit_code, None);

        let log = std::fs::read_to_string(&outcome.log_path).unwrap();
        assert!(log.contains("timeout"), "log should mention the kill: {log}");

        let commands = fx.store.list_commands(&fx.session.id).await.unwrap();
        assert_eq!(commands[0].status, CommandStatus::Cancelled);
        assert_eq!(commands[0].exit_code, None);
    }

    #[tokio::test]
    async fn spawn_failure_is_recorded_and_raised() {
        let fx = fixture().await;
        let spec = CommandSpec::new(["/no/such/binary-here"]);
        let err = fx
            .supervisor
            .run_command(&fx.session.id, &spec, &fx.workspace, None, None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::SpawnFailed(_)));

        let commands = fx.store.list_commands(&fx.session.id).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].status, CommandStatus::Failed);
        assert_eq!(commands[0].exit_code, None);

        // The failure still leaves one log artifact describing the cause.
        let artifacts = fx.store.list_artifacts(&fx.session.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        let log = std::fs::read_to_string(&artifacts[0].path).unwrap();
        assert!(log.contains("Failed to start command"));
    }

    #[tokio::test]
    async fn sequences_increase_across_commands() {
        let fx = fixture().await;
        for _ in 0..3 {
            let spec = CommandSpec::new(["true"]);
            fx.supervisor
                .run_command(&fx.session.id, &spec, &fx.workspace, None, None, &[])
                .await
                .unwrap();
        }
        let commands = fx.store.list_commands(&fx.session.id).await.unwrap();
        let sequences: Vec<i64> = commands.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failed_patch_records_no_command() {
        let fx = fixture().await;
        // The workspace is not even a git repository, so the check fails.
        let patch = SessionPatch {
            diff: "not a diff".to_string(),
            description: None,
        };
        let spec = CommandSpec::new(["true"]);
        let err = fx
            .supervisor
            .run_command(
                &fx.session.id,
                &spec,
                &fx.workspace,
                None,
                Some(&patch),
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::PatchFailed(_)));
        assert!(fx.store.list_commands(&fx.session.id).await.unwrap().is_empty());
        assert!(fx.store.list_artifacts(&fx.session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_patch_is_applied_before_running() {
        let fx = fixture().await;
        // Turn the workspace into a git repo with a committed README.
        let ws = &fx.workspace.path;
        for args in [
            vec!["init", "-q"],
            vec!["add", "-A"],
            vec![
                "-c",
                "user.name=t",
                "-c",
                "user.email=t@t",
                "commit",
                "-qm",
                "base",
            ],
        ] {
            let status = std::process::Command::new("git")
                .args(&args)
                .current_dir(ws)
                .status()
                .unwrap();
            assert!(status.success());
        }
        let patch = SessionPatch {
            diff: concat!(
                "diff --git a/README.md b/README.md\n",
                "--- a/README.md\n",
                "+++ b/README.md\n",
                "@@ -1 +1 @@\n",
                "-hello\n",
                "+patched\n",
            )
            .to_string(),
            description: Some("flip the greeting".to_string()),
        };
        let spec = CommandSpec::new(["cat", "README.md"]);
        let outcome = fx
            .supervisor
            .run_command(
                &fx.session.id,
                &spec,
                &fx.workspace,
                None,
                Some(&patch),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, CommandStatus::Succeeded);
        let log = std::fs::read_to_string(&outcome.log_path).unwrap();
        assert!(log.contains("patched"));

        // The patch file is content-addressed under the patches root.
        let digest = sha256_hex(patch.diff.as_bytes());
        let stored = fx
            .supervisor
            .paths
            .patches_dir
            .join(format!("{}.patch", &digest[..12]));
        assert!(stored.exists());
    }

    #[tokio::test]
    async fn child_env_is_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_memory().await.unwrap();
        let repo = store
            .upsert_repository("demo", "url", "main", None, &JsonMap::new())
            .await
            .unwrap();
        let session = store
            .create_session(repo.id, "abc1234", None, None, None, None, &JsonMap::new(), None)
            .await
            .unwrap();
        let supervisor = WorkerSupervisor::with_base_env(
            store.clone(),
            RunnerPaths::from_root(tmp.path().join("artifacts")),
            BTreeMap::from([
                ("PATH".to_string(), std::env::var("PATH").unwrap_or_default()),
                ("PYTHONHOME".to_string(), "/leaky/interpreter".to_string()),
            ]),
        )
        .unwrap()
        .with_env_interpreter("true");
        let workspace_dir = tmp.path().join("ws");
        std::fs::create_dir_all(&workspace_dir).unwrap();
        let workspace = Workspace {
            path: workspace_dir,
            needs_dependency_sync: false,
        };

        let spec = CommandSpec::new([
            "/bin/sh",
            "-c",
            "echo unbuffered=$PYTHONUNBUFFERED home=$PYTHONHOME venv=$VIRTUAL_ENV",
        ]);
        let outcome = supervisor
            .run_command(&session.id, &spec, &workspace, None, None, &[])
            .await
            .unwrap();
        let log = std::fs::read_to_string(&outcome.log_path).unwrap();
        assert!(log.contains("unbuffered=1"));
        assert!(log.contains("home= "), "PYTHONHOME must be cleared: {log}");
        assert!(log.contains("venv="), "VIRTUAL_ENV must be injected: {log}");
    }
}
