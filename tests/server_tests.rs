//! End-to-end tests through the tool surface.
//!
//! Builds a full server context over the local-process backend and a
//! file-backed state database, then drives the typed tool contracts the
//! way a transport would: spawn, exec with cursor polling, cancellation,
//! kill, restart recovery, and shutdown gating.

use std::sync::Arc;
use std::time::Duration;

use devbench::runtime::ContainerRuntime;
use devbench::runtimes::LocalProcessRuntime;
use devbench::tools::{
    AttachInput, ExecCancelInput, ExecPollInput, ExecStartInput, KillInput, SpawnInput,
};
use devbench::{Config, ServerContext, Tools};
use tempfile::TempDir;

struct Harness {
    _tmp: TempDir,
    ctx: Arc<ServerContext>,
    tools: Tools,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let ctx = build_ctx(&tmp, "state.db").await;
    let tools = Tools::new(ctx.clone());
    Harness {
        _tmp: tmp,
        ctx,
        tools,
    }
}

async fn build_ctx(tmp: &TempDir, db_name: &str) -> Arc<ServerContext> {
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(LocalProcessRuntime::new(tmp.path().join("runtime")).unwrap());
    let mut config = Config::default();
    config.state_db_path = tmp.path().join(db_name);
    config.warm_pool_enabled = false;
    config.drain_grace = Duration::from_millis(500);
    let ctx = ServerContext::build(config, runtime).unwrap();
    ctx.start().await.unwrap();
    ctx
}

fn spawn_input(alias: Option<&str>) -> SpawnInput {
    SpawnInput {
        image: "python:3.11-slim".to_string(),
        persistent: false,
        alias: alias.map(str::to_string),
        ttl_s: None,
        idempotency_key: None,
    }
}

async fn poll_complete(tools: &Tools, exec_id: &str) -> devbench::tools::ExecPollOutput {
    for _ in 0..400 {
        let out = tools
            .exec_poll(ExecPollInput {
                exec_id: exec_id.to_string(),
                after_seq: 0,
            })
            .unwrap();
        if out.complete {
            return out;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("exec {exec_id} did not complete");
}

// =============================================================================
// Scenario: happy path
// =============================================================================

#[tokio::test]
async fn test_spawn_exec_poll_happy_path() {
    let h = harness().await;
    let spawned = h.tools.spawn(spawn_input(Some("w1"))).await.unwrap();
    assert!(spawned.container_id.starts_with("c_"));
    assert_eq!(spawned.status, "running");
    assert_eq!(spawned.alias.as_deref(), Some("w1"));

    let exec = h
        .tools
        .exec_start(ExecStartInput {
            container_id: spawned.container_id.clone(),
            cmd: vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf hello; printf world 1>&2; exit 0".to_string(),
            ],
            cwd: None,
            env: None,
            as_root: false,
            timeout_s: Some(10),
            idempotency_key: None,
        })
        .await
        .unwrap();
    assert!(exec.exec_id.starts_with("e_"));
    assert_eq!(exec.status, "running");

    let out = poll_complete(&h.tools, &exec.exec_id).await;
    assert!(out.complete);
    assert!(out.gap_from_seq.is_none());

    let stdout: String = out
        .messages
        .iter()
        .filter(|m| m.stream == "stdout")
        .filter_map(|m| m.data.clone())
        .collect();
    let stderr: String = out
        .messages
        .iter()
        .filter(|m| m.stream == "stderr")
        .filter_map(|m| m.data.clone())
        .collect();
    assert_eq!(stdout, "hello");
    assert_eq!(stderr, "world");

    let control = out.messages.last().unwrap();
    assert_eq!(control.stream, "control");
    assert_eq!(control.exit_code, Some(0));
    assert!(control.usage.is_some());

    // Seqs start at 1 and strictly increase; the control frame is last.
    assert_eq!(out.messages.first().unwrap().seq, 1);
    assert!(out
        .messages
        .windows(2)
        .all(|w| w[1].seq > w[0].seq));
}

// =============================================================================
// Scenario: exec by alias, cwd, env
// =============================================================================

#[tokio::test]
async fn test_exec_env_and_alias_resolution() {
    let h = harness().await;
    h.tools.spawn(spawn_input(Some("w2"))).await.unwrap();

    let exec = h
        .tools
        .exec_start(ExecStartInput {
            container_id: "w2".to_string(),
            cmd: vec!["sh".to_string(), "-c".to_string(), "printf \"$GREETING\"".to_string()],
            cwd: None,
            env: Some(std::collections::HashMap::from([(
                "GREETING".to_string(),
                "bonjour".to_string(),
            )])),
            as_root: false,
            timeout_s: Some(10),
            idempotency_key: None,
        })
        .await
        .unwrap();

    let out = poll_complete(&h.tools, &exec.exec_id).await;
    let stdout: String = out
        .messages
        .iter()
        .filter(|m| m.stream == "stdout")
        .filter_map(|m| m.data.clone())
        .collect();
    assert_eq!(stdout, "bonjour");
}

// =============================================================================
// Scenario: idempotency
// =============================================================================

#[tokio::test]
async fn test_exec_idempotency_key_replays_exec_id() {
    let h = harness().await;
    let spawned = h.tools.spawn(spawn_input(None)).await.unwrap();

    let input = ExecStartInput {
        container_id: spawned.container_id.clone(),
        cmd: vec!["true".to_string()],
        cwd: None,
        env: None,
        as_root: false,
        timeout_s: Some(10),
        idempotency_key: Some("k-42".to_string()),
    };
    let first = h.tools.exec_start(input.clone()).await.unwrap();
    let second = h.tools.exec_start(input).await.unwrap();
    assert_eq!(first.exec_id, second.exec_id);
}

#[tokio::test]
async fn test_spawn_idempotency_key_replays_container_id() {
    let h = harness().await;
    let mut input = spawn_input(None);
    input.idempotency_key = Some("spawn-7".to_string());
    let first = h.tools.spawn(input.clone()).await.unwrap();
    let second = h.tools.spawn(input).await.unwrap();
    assert_eq!(first.container_id, second.container_id);
}

// =============================================================================
// Scenario: timeout & cancellation
// =============================================================================

#[tokio::test]
async fn test_timeout_produces_timed_out_terminal() {
    let h = harness().await;
    let spawned = h.tools.spawn(spawn_input(None)).await.unwrap();

    let exec = h
        .tools
        .exec_start(ExecStartInput {
            container_id: spawned.container_id,
            cmd: vec!["sleep".to_string(), "100".to_string()],
            cwd: None,
            env: None,
            as_root: false,
            timeout_s: Some(1),
            idempotency_key: None,
        })
        .await
        .unwrap();

    let out = poll_complete(&h.tools, &exec.exec_id).await;
    let control = out.messages.last().unwrap();
    assert_eq!(control.stream, "control");
    assert!(control.usage.as_ref().unwrap().timed_out);

    let execs = h.tools.list_execs(None).unwrap();
    let rec = execs.iter().find(|e| e.exec_id == exec.exec_id).unwrap();
    assert_eq!(rec.status, "timed_out");
}

#[tokio::test]
async fn test_cancel_twice_is_safe() {
    let h = harness().await;
    let spawned = h.tools.spawn(spawn_input(None)).await.unwrap();
    let exec = h
        .tools
        .exec_start(ExecStartInput {
            container_id: spawned.container_id,
            cmd: vec!["sleep".to_string(), "100".to_string()],
            cwd: None,
            env: None,
            as_root: false,
            timeout_s: Some(60),
            idempotency_key: None,
        })
        .await
        .unwrap();

    let first = h
        .tools
        .exec_cancel(ExecCancelInput {
            exec_id: exec.exec_id.clone(),
        })
        .unwrap();
    assert_eq!(first.status, "cancelling");

    poll_complete(&h.tools, &exec.exec_id).await;

    let second = h
        .tools
        .exec_cancel(ExecCancelInput {
            exec_id: exec.exec_id.clone(),
        })
        .unwrap();
    assert_eq!(second.status, "cancelled", "repeat cancel reports the terminal status");
}

// =============================================================================
// Scenario: concurrency limit
// =============================================================================

#[tokio::test]
async fn test_concurrency_limit_is_enforced() {
    let h = harness().await;
    let spawned = h.tools.spawn(spawn_input(None)).await.unwrap();

    let long = || ExecStartInput {
        container_id: spawned.container_id.clone(),
        cmd: vec!["sleep".to_string(), "30".to_string()],
        cwd: None,
        env: None,
        as_root: false,
        timeout_s: Some(60),
        idempotency_key: None,
    };
    for _ in 0..4 {
        h.tools.exec_start(long()).await.unwrap();
    }
    let err = h.tools.exec_start(long()).await.unwrap_err();
    assert_eq!(err.code(), "concurrency_limit");
}

// =============================================================================
// Scenario: attach & kill
// =============================================================================

#[tokio::test]
async fn test_attach_and_kill_lifecycle() {
    let h = harness().await;
    let spawned = h.tools.spawn(spawn_input(Some("w3"))).await.unwrap();

    let attach = h
        .tools
        .attach(AttachInput {
            target: "w3".to_string(),
            client_name: "agent".to_string(),
            session_id: "sess-1".to_string(),
        })
        .unwrap();
    assert_eq!(attach.container_id, spawned.container_id);
    assert_eq!(
        attach.roots,
        vec![format!("workspace:{}", spawned.container_id)]
    );

    let killed = h
        .tools
        .kill(KillInput {
            container_id: spawned.container_id.clone(),
            force: false,
        })
        .await
        .unwrap();
    assert_eq!(killed.status, "stopped");

    // Idempotent on already-stopped.
    let killed = h
        .tools
        .kill(KillInput {
            container_id: spawned.container_id.clone(),
            force: false,
        })
        .await
        .unwrap();
    assert_eq!(killed.status, "stopped");

    // The alias no longer resolves.
    let err = h
        .tools
        .attach(AttachInput {
            target: "w3".to_string(),
            client_name: "agent".to_string(),
            session_id: "sess-2".to_string(),
        })
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

// =============================================================================
// Scenario: restart recovery
// =============================================================================

#[tokio::test]
async fn test_restart_recovers_state() {
    let tmp = TempDir::new().unwrap();
    let ctx1 = build_ctx(&tmp, "shared.db").await;
    let tools1 = Tools::new(ctx1.clone());

    let spawned = tools1.spawn(spawn_input(Some("survivor"))).await.unwrap();
    let exec = tools1
        .exec_start(ExecStartInput {
            container_id: spawned.container_id.clone(),
            cmd: vec!["sleep".to_string(), "300".to_string()],
            cwd: None,
            env: None,
            as_root: false,
            timeout_s: Some(600),
            idempotency_key: None,
        })
        .await
        .unwrap();
    drop(tools1);
    drop(ctx1);

    // "Restart": a fresh context over the same database. The
    // local-process backend forgot its containers, which models daemon
    // objects that vanished while the server was down.
    let ctx2 = build_ctx(&tmp, "shared.db").await;
    let tools2 = Tools::new(ctx2.clone());

    let containers = tools2.list_containers(true).unwrap();
    let row = containers
        .iter()
        .find(|c| c.container_id == spawned.container_id)
        .unwrap();
    assert_eq!(row.status, "stopped", "missing daemon object marked stopped");

    let execs = tools2.list_execs(None).unwrap();
    let interrupted = execs.iter().find(|e| e.exec_id == exec.exec_id).unwrap();
    assert_eq!(interrupted.status, "failed");
    assert_eq!(interrupted.fail_reason.as_deref(), Some("server_restart"));

    // Ring buffers are not durable across restarts.
    let err = tools2
        .exec_poll(ExecPollInput {
            exec_id: exec.exec_id,
            after_seq: 0,
        })
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

// =============================================================================
// Scenario: shutdown gating & status
// =============================================================================

#[tokio::test]
async fn test_shutdown_gates_new_work() {
    let h = harness().await;
    h.ctx.shutdown.gate().cancel();

    assert_eq!(
        h.tools.spawn(spawn_input(None)).await.unwrap_err().code(),
        "cancelled"
    );
    assert_eq!(
        h.tools
            .attach(AttachInput {
                target: "x".to_string(),
                client_name: "a".to_string(),
                session_id: "s".to_string(),
            })
            .unwrap_err()
            .code(),
        "cancelled"
    );
}

#[tokio::test]
async fn test_status_tool_reports_counts() {
    let h = harness().await;
    h.tools.spawn(spawn_input(None)).await.unwrap();

    let status = h.tools.status().await.unwrap();
    assert_eq!(status.status, "ok");
    assert!(status.runtime_connected);
    assert_eq!(status.containers_running, 1);
    assert_eq!(status.counters.spawns, 1);
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
}

// =============================================================================
// Scenario: admin reconcile / gc
// =============================================================================

#[tokio::test]
async fn test_reconcile_tool_is_idempotent() {
    let h = harness().await;
    h.tools.spawn(spawn_input(None)).await.unwrap();

    let first = h.tools.reconcile().await.unwrap();
    assert_eq!(first.errors, 0);
    let second = h.tools.reconcile().await.unwrap();
    assert_eq!(second.adopted, 0);
    assert_eq!(second.cleaned_up, 0);
}

#[tokio::test]
async fn test_gc_tool_runs_clean() {
    let h = harness().await;
    let stats = h.tools.gc().await.unwrap();
    assert_eq!(stats.errors, 0);
}
