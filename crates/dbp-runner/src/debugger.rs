// SPDX-License-Identifier: MIT OR Apache-2.0
//! Debugger launches: a tunnel manager allocating token-guarded endpoints
//! plus the adapters that bind debugpy, gdbserver, and lldb-server to them.

use crate::supervisor::{CommandOutcome, CommandSpec, WorkerSupervisor, Workspace};
use crate::RunnerError;
use chrono::{DateTime, Utc};
use dbp_store::MetadataStore;
use rand::RngCore;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::net::TcpListener;
use tracing::info;

/// An authenticated debugger tunnel endpoint.
#[derive(Debug, Clone)]
pub struct DebuggerTunnel {
    /// Session the tunnel belongs to.
    pub session_id: String,
    /// Debugger kind (`debugpy`, `gdb`, `lldb`).
    pub kind: String,
    /// Host the debugger binds to.
    pub host: String,
    /// Allocated TCP port.
    pub port: u16,
    /// Bearer token external debugger clients must present.
    pub token: String,
    /// When the tunnel was opened.
    pub created_at: DateTime<Utc>,
}

impl DebuggerTunnel {
    /// The endpoint URI handed to debugger clients.
    pub fn uri(&self) -> String {
        format!(
            "ws://{}:{}/debug/{}/{}",
            self.host, self.port, self.session_id, self.kind
        )
    }

    /// JSON form stored in the session's debugger state.
    pub fn to_payload(&self) -> serde_json::Value {
        json!({
            "session_id": self.session_id,
            "kind": self.kind,
            "host": self.host,
            "port": self.port,
            "token": self.token,
            "uri": self.uri(),
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

/// Allocates ports and bearer tokens for debugger tunnels and mirrors
/// their lifecycle into the session's debugger state.
pub struct TunnelManager {
    store: MetadataStore,
    host: String,
    tunnels: Mutex<HashMap<(String, String), DebuggerTunnel>>,
}

impl TunnelManager {
    /// Manager binding tunnels on `host`.
    pub fn new(store: MetadataStore, host: impl Into<String>) -> Self {
        Self {
            store,
            host: host.into(),
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Open a tunnel for `session_id`, allocating a free port unless one
    /// is given, and record `tunnel-created`.
    pub async fn open_tunnel(
        &self,
        session_id: &str,
        kind: &str,
        port: Option<u16>,
    ) -> Result<DebuggerTunnel, RunnerError> {
        let port = match port {
            Some(port) => port,
            None => self.allocate_port().await?,
        };
        let mut token_bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut token_bytes);
        let token: String = token_bytes.iter().map(|b| format!("{b:02x}")).collect();
        let tunnel = DebuggerTunnel {
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            host: self.host.clone(),
            port,
            token,
            created_at: Utc::now(),
        };
        self.tunnels
            .lock()
            .expect("tunnel lock poisoned")
            .insert((session_id.to_string(), kind.to_string()), tunnel.clone());
        self.record_state(session_id, "tunnel-created", Some(&tunnel))
            .await?;
        info!(session = session_id, kind, port, "tunnel opened");
        Ok(tunnel)
    }

    /// Drop a tunnel and record `tunnel-closed`.
    pub async fn close_tunnel(&self, session_id: &str, kind: &str) -> Result<(), RunnerError> {
        self.tunnels
            .lock()
            .expect("tunnel lock poisoned")
            .remove(&(session_id.to_string(), kind.to_string()));
        self.record_state(session_id, "tunnel-closed", None).await
    }

    /// The tunnel currently open for `(session, kind)`, if any.
    pub fn get_tunnel(&self, session_id: &str, kind: &str) -> Option<DebuggerTunnel> {
        self.tunnels
            .lock()
            .expect("tunnel lock poisoned")
            .get(&(session_id.to_string(), kind.to_string()))
            .cloned()
    }

    pub(crate) async fn record_state(
        &self,
        session_id: &str,
        event: &str,
        tunnel: Option<&DebuggerTunnel>,
    ) -> Result<(), RunnerError> {
        let mut payload = dbp_core::JsonMap::new();
        payload.insert(
            "tunnel".to_string(),
            tunnel.map(DebuggerTunnel::to_payload).unwrap_or(json!(null)),
        );
        self.store
            .update_debugger_state(session_id, Some(event), &payload)
            .await?;
        Ok(())
    }

    async fn allocate_port(&self) -> Result<u16, RunnerError> {
        let listener = TcpListener::bind((self.host.as_str(), 0)).await?;
        Ok(listener.local_addr()?.port())
    }
}

/// A debugger launch request, tagged by debugger kind.
#[derive(Debug, Clone)]
pub enum LaunchRequest {
    /// Launch a Python program under debugpy.
    Python {
        /// Module to run with `-m`; mutually optional with `script`.
        module: Option<String>,
        /// Script path to run.
        script: Option<String>,
        /// Program arguments.
        args: Vec<String>,
        /// Working directory override.
        cwd: Option<PathBuf>,
        /// Environment overrides.
        env: BTreeMap<String, String>,
        /// Hold the program until a debugger client attaches.
        wait_for_client: bool,
    },
    /// Launch a binary under gdbserver.
    Gdb {
        /// Binary to debug.
        binary: String,
        /// Program arguments.
        args: Vec<String>,
        /// Working directory override.
        cwd: Option<PathBuf>,
        /// Environment overrides.
        env: BTreeMap<String, String>,
    },
    /// Launch a binary under lldb-server's gdb-remote mode.
    Lldb {
        /// Binary to debug.
        binary: String,
        /// Program arguments.
        args: Vec<String>,
        /// Working directory override.
        cwd: Option<PathBuf>,
        /// Environment overrides.
        env: BTreeMap<String, String>,
    },
}

impl LaunchRequest {
    /// Tunnel kind label for this request.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Python { .. } => "debugpy",
            Self::Gdb { .. } => "gdb",
            Self::Lldb { .. } => "lldb",
        }
    }
}

/// Details about a started debugger run.
#[derive(Debug)]
pub struct DebuggerLaunch {
    /// The tunnel the debugger is reachable on.
    pub tunnel: DebuggerTunnel,
    /// The command spec that was executed.
    pub command: CommandSpec,
    /// Outcome of the supervised run.
    pub outcome: CommandOutcome,
}

/// Uniform launcher over the supported debugger kinds.
pub struct DebuggerAdapter {
    supervisor: WorkerSupervisor,
    tunnels: TunnelManager,
}

impl DebuggerAdapter {
    /// Adapter delegating execution to `supervisor` and tunnel lifecycle
    /// to `tunnels`.
    pub fn new(supervisor: WorkerSupervisor, tunnels: TunnelManager) -> Self {
        Self { supervisor, tunnels }
    }

    /// The tunnel manager, for close and inspection paths.
    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Open a tunnel, record `tunnel-ready`, and run the debugger command
    /// under the supervisor.
    pub async fn launch(
        &self,
        session_id: &str,
        workspace: &Workspace,
        request: &LaunchRequest,
    ) -> Result<DebuggerLaunch, RunnerError> {
        if let LaunchRequest::Python { module, script, .. } = request {
            if module.is_none() && script.is_none() {
                return Err(RunnerError::InvalidLaunchRequest(
                    "either module or script must be specified".to_string(),
                ));
            }
        }

        let tunnel = self
            .tunnels
            .open_tunnel(session_id, request.kind(), None)
            .await?;
        self.tunnels
            .record_state(session_id, "tunnel-ready", Some(&tunnel))
            .await?;

        let argv = build_argv(request, &tunnel);
        let (cwd, env) = match request {
            LaunchRequest::Python { cwd, env, .. }
            | LaunchRequest::Gdb { cwd, env, .. }
            | LaunchRequest::Lldb { cwd, env, .. } => (cwd.clone(), env.clone()),
        };
        let mut env = env;
        env.entry("DEBUG_SESSION_TOKEN".to_string())
            .or_insert_with(|| tunnel.token.clone());
        env.entry("DEBUG_SESSION_URI".to_string())
            .or_insert_with(|| tunnel.uri());

        let spec = CommandSpec {
            argv,
            env,
            cwd,
            log_name: "debugger".to_string(),
            timeout: None,
        };
        let outcome = self
            .supervisor
            .run_command(session_id, &spec, workspace, None, None, &[])
            .await?;
        Ok(DebuggerLaunch {
            tunnel,
            command: spec,
            outcome,
        })
    }

    /// Close the tunnel for a finished launch.
    pub async fn close(&self, session_id: &str, kind: &str) -> Result<(), RunnerError> {
        self.tunnels.close_tunnel(session_id, kind).await
    }
}

fn build_argv(request: &LaunchRequest, tunnel: &DebuggerTunnel) -> Vec<String> {
    let endpoint = format!("{}:{}", tunnel.host, tunnel.port);
    match request {
        LaunchRequest::Python {
            module,
            script,
            args,
            wait_for_client,
            ..
        } => {
            let mut argv = vec![
                "python3".to_string(),
                "-m".to_string(),
                "debugpy".to_string(),
                "--listen".to_string(),
                endpoint,
            ];
            if *wait_for_client {
                argv.push("--wait-for-client".to_string());
            }
            if let Some(module) = module {
                argv.push("-m".to_string());
                argv.push(module.clone());
            } else if let Some(script) = script {
                argv.push(script.clone());
            }
            argv.extend(args.iter().cloned());
            argv
        }
        LaunchRequest::Gdb { binary, args, .. } => {
            let mut argv = vec!["gdbserver".to_string(), endpoint, binary.clone()];
            argv.extend(args.iter().cloned());
            argv
        }
        LaunchRequest::Lldb { binary, args, .. } => {
            let mut argv = vec![
                "lldb-server".to_string(),
                "gdbserver".to_string(),
                endpoint,
                binary.clone(),
            ];
            argv.extend(args.iter().cloned());
            argv
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::RunnerPaths;
    use dbp_core::JsonMap;

    fn tunnel(kind: &str) -> DebuggerTunnel {
        DebuggerTunnel {
            session_id: "s1".to_string(),
            kind: kind.to_string(),
            host: "127.0.0.1".to_string(),
            port: 4711,
            token: "cafebabe".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn python_argv_with_module_and_wait() {
        let request = LaunchRequest::Python {
            module: Some("app.main".to_string()),
            script: None,
            args: vec!["--verbose".to_string()],
            cwd: None,
            env: BTreeMap::new(),
            wait_for_client: true,
        };
        let argv = build_argv(&request, &tunnel("debugpy"));
        assert_eq!(
            argv,
            vec![
                "python3",
                "-m",
                "debugpy",
                "--listen",
                "127.0.0.1:4711",
                "--wait-for-client",
                "-m",
                "app.main",
                "--verbose",
            ]
        );
    }

    #[test]
    fn python_argv_with_script() {
        let request = LaunchRequest::Python {
            module: None,
            script: Some("main.py".to_string()),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
            wait_for_client: false,
        };
        let argv = build_argv(&request, &tunnel("debugpy"));
        assert_eq!(
            argv,
            vec!["python3", "-m", "debugpy", "--listen", "127.0.0.1:4711", "main.py"]
        );
    }

    #[test]
    fn gdb_and_lldb_argv() {
        let request = LaunchRequest::Gdb {
            binary: "./a.out".to_string(),
            args: vec!["--flag".to_string()],
            cwd: None,
            env: BTreeMap::new(),
        };
        assert_eq!(
            build_argv(&request, &tunnel("gdb")),
            vec!["gdbserver", "127.0.0.1:4711", "./a.out", "--flag"]
        );

        let request = LaunchRequest::Lldb {
            binary: "./a.out".to_string(),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
        };
        assert_eq!(
            build_argv(&request, &tunnel("lldb")),
            vec!["lldb-server", "gdbserver", "127.0.0.1:4711", "./a.out"]
        );
    }

    #[test]
    fn tunnel_uri_and_payload() {
        let t = tunnel("debugpy");
        assert_eq!(t.uri(), "ws://127.0.0.1:4711/debug/s1/debugpy");
        let payload = t.to_payload();
        assert_eq!(payload["port"], serde_json::json!(4711));
        assert_eq!(payload["token"], serde_json::json!("cafebabe"));
        assert_eq!(payload["uri"], serde_json::json!(t.uri()));
    }

    async fn adapter_fixture() -> (tempfile::TempDir, MetadataStore, DebuggerAdapter, String) {
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
            BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
        )
        .unwrap()
        .with_env_interpreter("true");
        let tunnels = TunnelManager::new(store.clone(), "127.0.0.1");
        let adapter = DebuggerAdapter::new(supervisor, tunnels);
        let session_id = session.id;
        (tmp, store, adapter, session_id)
    }

    #[tokio::test]
    async fn python_launch_without_target_is_rejected() {
        let (_tmp, store, adapter, session_id) = adapter_fixture().await;
        let workspace = Workspace {
            path: std::env::temp_dir(),
            needs_dependency_sync: false,
        };
        let request = LaunchRequest::Python {
            module: None,
            script: None,
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
            wait_for_client: false,
        };
        let err = adapter
            .launch(&session_id, &workspace, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidLaunchRequest(_)));
        // Nothing was recorded: the request failed validation up front.
        assert!(store.get_debugger_state(&session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tunnel_lifecycle_is_mirrored_into_state() {
        let (_tmp, store, adapter, session_id) = adapter_fixture().await;
        let tunnel = adapter
            .tunnels()
            .open_tunnel(&session_id, "gdb", Some(4712))
            .await
            .unwrap();
        assert_eq!(tunnel.port, 4712);
        assert_eq!(tunnel.token.len(), 32);

        let state = store.get_debugger_state(&session_id).await.unwrap().unwrap();
        assert_eq!(state.last_event.as_deref(), Some("tunnel-created"));
        assert_eq!(state.payload["tunnel"]["port"], serde_json::json!(4712));
        assert!(adapter.tunnels().get_tunnel(&session_id, "gdb").is_some());

        adapter.close(&session_id, "gdb").await.unwrap();
        let state = store.get_debugger_state(&session_id).await.unwrap().unwrap();
        assert_eq!(state.last_event.as_deref(), Some("tunnel-closed"));
        assert_eq!(state.payload["tunnel"], serde_json::json!(null));
        assert!(adapter.tunnels().get_tunnel(&session_id, "gdb").is_none());
    }

    #[tokio::test]
    async fn launch_runs_under_the_supervisor_and_injects_tunnel_env() {
        let (tmp, store, adapter, session_id) = adapter_fixture().await;
        let workspace_dir = tmp.path().join("ws");
        std::fs::create_dir_all(&workspace_dir).unwrap();
        let workspace = Workspace {
            path: workspace_dir,
            needs_dependency_sync: false,
        };
        // gdbserver is almost never on test hosts; the spawn failure path
        // still exercises tunnel state, env injection, and recording.
        let request = LaunchRequest::Gdb {
            binary: "./a.out".to_string(),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
        };
        let result = adapter.launch(&session_id, &workspace, &request).await;

        let state = store.get_debugger_state(&session_id).await.unwrap().unwrap();
        assert_eq!(state.last_event.as_deref(), Some("tunnel-ready"));
        let commands = store.list_commands(&session_id).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].command.starts_with("gdbserver"));
        assert_eq!(
            commands[0].env.get("DEBUG_SESSION_TOKEN"),
            Some(&state.payload["tunnel"]["token"].as_str().unwrap().to_string())
        );
        assert!(commands[0].env.contains_key("DEBUG_SESSION_URI"));

        match result {
            Ok(launch) => assert!(launch.outcome.status.is_terminal()),
            Err(RunnerError::SpawnFailed(_)) => {
                // Recorded as failed with a log artifact, per the pipeline.
                let artifacts = store.list_artifacts(&session_id).await.unwrap();
                assert_eq!(artifacts.len(), 1);
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
