// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workspace-level scenarios across the store, pool, supervisor, and
//! brokers: the same path a real session takes through the service.

use dbp_core::{ArtifactKind, CommandStatus, JsonMap, LogChannel, SessionStatus};
use dbp_pool::{WorktreePool, WorktreePoolSettings};
use dbp_runner::{CommandSpec, RunnerPaths, SessionPatch, StreamObserver, WorkerSupervisor, Workspace};
use dbp_store::MetadataStore;
use dbp_stream::LogBroker;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Arc;

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

fn commit_file(origin: &Path, name: &str, contents: &str, message: &str) -> String {
    std::fs::write(origin.join(name), contents).unwrap();
    git(&["add", "-A"], origin);
    git(
        &[
            "-c",
            "user.name=flow-test",
            "-c",
            "user.email=flow@test",
            "commit",
            "-qm",
            message,
        ],
        origin,
    );
    let output = StdCommand::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(origin)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

struct Service {
    _tmp: tempfile::TempDir,
    origin: PathBuf,
    store: MetadataStore,
    pool: WorktreePool,
    supervisor: WorkerSupervisor,
    logs: LogBroker,
}

async fn service() -> Service {
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
    let pool = WorktreePool::new(
        store.clone(),
        WorktreePoolSettings::new(
            repo.id,
            origin.to_string_lossy().into_owned(),
            tmp.path().join("repos").join("demo.bare"),
            tmp.path().join("worktrees").join("demo"),
        ),
    )
    .unwrap();
    let supervisor = WorkerSupervisor::new(
        store.clone(),
        RunnerPaths::from_root(tmp.path().join("artifacts")),
    )
    .unwrap()
    .with_env_interpreter("true");

    Service {
        _tmp: tmp,
        origin,
        store,
        pool,
        supervisor,
        logs: LogBroker::default(),
    }
}

#[tokio::test]
async fn full_session_flow_streams_and_records() {
    let svc = service().await;
    let commit = commit_file(&svc.origin, "README.md", "hello service\n", "first");

    let repo = svc.store.get_repository_by_name("demo").await.unwrap().unwrap();
    let session = svc
        .store
        .create_session(repo.id, &commit, None, Some("ci"), None, None, &JsonMap::new(), None)
        .await
        .unwrap();

    // Acquire a workspace at the pinned commit.
    let lease = svc
        .pool
        .acquire_worktree(&commit, &session.id, Some("env-a"))
        .await
        .unwrap();
    svc.store
        .update_session_status(&session.id, SessionStatus::Running, Some(chrono::Utc::now()), None)
        .await
        .unwrap();

    // A broker subscriber connected before the run sees every chunk.
    let (history, subscription) = svc.logs.subscribe_with_history(&session.id);
    assert!(history.is_empty());

    // Run a command whose output is mirrored into the session log broker,
    // exactly the wiring the request surface uses.
    let broker = svc.logs.clone();
    let broker_session = session.id.clone();
    let observer: StreamObserver = Arc::new(move |event| {
        broker.append(&broker_session, &event.text, event.stream);
    });
    let spec = CommandSpec::new(["/bin/sh", "-c", "cat README.md; echo err >&2"]);
    let outcome = svc
        .supervisor
        .run_command(
            &session.id,
            &spec,
            &Workspace::from(&lease),
            None,
            None,
            &[observer],
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, CommandStatus::Succeeded);
    assert_eq!(outcome.exit_code, Some(0));

    // Both channels arrived at the subscriber in emission order.
    let first = subscription.next().await.unwrap();
    assert_eq!(first.text, "hello service\n");
    assert_eq!(first.stream, LogChannel::Stdout);
    let second = subscription.next().await.unwrap();
    assert_eq!(second.text, "err\n");
    assert_eq!(second.stream, LogChannel::Stderr);

    // The command row and its single log artifact agree.
    let commands = svc.store.list_commands(&session.id).await.unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].status, CommandStatus::Succeeded);
    let artifacts = svc.store.list_artifacts(&session.id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, ArtifactKind::Log);
    assert_eq!(Some(artifacts[0].path.clone()), commands[0].log_path);

    svc.pool.release(lease, true).await.unwrap();
    svc.store
        .update_session_status(
            &session.id,
            SessionStatus::Completed,
            None,
            Some(chrono::Utc::now()),
        )
        .await
        .unwrap();

    let done = svc.store.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn patched_session_sees_the_patch_and_releases_clean() {
    let svc = service().await;
    let commit = commit_file(&svc.origin, "README.md", "original\n", "first");

    let repo = svc.store.get_repository_by_name("demo").await.unwrap().unwrap();
    let session = svc
        .store
        .create_session(repo.id, &commit, None, None, None, None, &JsonMap::new(), None)
        .await
        .unwrap();
    let lease = svc
        .pool
        .acquire_worktree(&commit, &session.id, None)
        .await
        .unwrap();

    let patch = SessionPatch {
        diff: concat!(
            "diff --git a/README.md b/README.md\n",
            "--- a/README.md\n",
            "+++ b/README.md\n",
            "@@ -1 +1 @@\n",
            "-original\n",
            "+patched\n",
        )
        .to_string(),
        description: None,
    };
    let spec = CommandSpec::new(["cat", "README.md"]);
    let outcome = svc
        .supervisor
        .run_command(
            &session.id,
            &spec,
            &Workspace::from(&lease),
            None,
            Some(&patch),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, CommandStatus::Succeeded);
    let log = std::fs::read_to_string(&outcome.log_path).unwrap();
    assert!(log.contains("patched"));

    // Releasing with clean=true resets the patch away; the next acquire
    // serves the pristine commit again.
    let path = lease.path.clone();
    svc.pool.release(lease, true).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(path.join("README.md")).unwrap(),
        "original\n"
    );

    let lease = svc
        .pool
        .acquire_worktree(&commit, "second-use", None)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(lease.path.join("README.md")).unwrap(),
        "original\n"
    );
    svc.pool.release(lease, true).await.unwrap();
}
