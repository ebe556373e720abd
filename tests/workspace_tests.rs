//! Workspace gateway tests over the local-process backend.
//!
//! These run the real helper scripts against a real filesystem, covering
//! containment, ETag concurrency, staged writes, listing, deletion rules,
//! and archive round-trips. They expect a Unix host with coreutils
//! (`stat`, `find`, `sha256sum`, `readlink`), which is what the gateway
//! requires of container images as well.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use devbench::audit::Audit;
use devbench::runtime::{ContainerRuntime, ContainerSpec, NetworkMode, ResourceLimits};
use devbench::runtimes::LocalProcessRuntime;
use devbench::store::{ContainerRecord, ContainerStatus};
use devbench::workspace::{BatchOp, WorkspaceGateway};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    gateway: WorkspaceGateway,
    record: ContainerRecord,
    volume_host_dir: std::path::PathBuf,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let runtime = Arc::new(LocalProcessRuntime::new(tmp.path()).unwrap());

    let spec = ContainerSpec {
        image: "docker.io/library/python:3.11-slim".to_string(),
        labels: HashMap::new(),
        workspace_volume: ("vol-ws".to_string(), "/workspace".to_string()),
        user: "1000:1000".to_string(),
        working_dir: "/workspace".to_string(),
        cap_drop: vec!["ALL".to_string()],
        no_new_privileges: true,
        read_only_rootfs: true,
        limits: ResourceLimits {
            memory_bytes: 64 * 1024 * 1024,
            cpu_quota_us: 100_000,
            cpu_period_us: 100_000,
            pids_limit: 64,
        },
        network: NetworkMode::None,
    };
    let runtime_id = runtime.create_container(&spec).await.unwrap();
    runtime.start_container(&runtime_id).await.unwrap();

    let record = ContainerRecord {
        id: "c_ws".to_string(),
        runtime_id: Some(runtime_id),
        alias: None,
        image: spec.image.clone(),
        digest: None,
        persistent: false,
        warm: false,
        created_at: Utc::now(),
        last_seen_at: Utc::now(),
        ttl_seconds: None,
        workspace_volume: Some("vol-ws".to_string()),
        status: ContainerStatus::Running,
    };
    let volume_host_dir = tmp.path().join("volumes").join("vol-ws");
    let gateway = WorkspaceGateway::new(runtime, Arc::new(Audit::new()), "/workspace".to_string());
    Fixture {
        _tmp: tmp,
        gateway,
        record,
        volume_host_dir,
    }
}

// =============================================================================
// Read / Write / Stat
// =============================================================================

#[tokio::test]
async fn test_write_read_stat_agree() {
    let fx = fixture().await;
    let (etag, size) = fx
        .gateway
        .write(&fx.record, "/workspace/hello.txt", b"hello world", None)
        .await
        .unwrap();
    assert_eq!(size, 11);

    let read = fx.gateway.read(&fx.record, "/workspace/hello.txt").await.unwrap();
    assert_eq!(read.content, b"hello world");
    assert_eq!(read.info.etag, etag);

    let stat = fx.gateway.stat(&fx.record, "/workspace/hello.txt").await.unwrap();
    assert_eq!(stat.etag, etag, "stat and write compute the same etag");
    assert_eq!(stat.size, 11);
    assert!(!stat.is_dir);
    assert_eq!(stat.mime_type.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn test_write_is_binary_safe() {
    let fx = fixture().await;
    let payload: Vec<u8> = (0u8..=255).collect();
    fx.gateway
        .write(&fx.record, "/workspace/blob.bin", &payload, None)
        .await
        .unwrap();
    let read = fx.gateway.read(&fx.record, "/workspace/blob.bin").await.unwrap();
    assert_eq!(read.content, payload);
}

#[tokio::test]
async fn test_write_creates_parent_dirs() {
    let fx = fixture().await;
    fx.gateway
        .write(&fx.record, "/workspace/a/b/c.txt", b"deep", None)
        .await
        .unwrap();
    let read = fx.gateway.read(&fx.record, "/workspace/a/b/c.txt").await.unwrap();
    assert_eq!(read.content, b"deep");
}

#[tokio::test]
async fn test_etag_conflict_does_not_mutate() {
    let fx = fixture().await;
    let (etag, _) = fx
        .gateway
        .write(&fx.record, "/workspace/x", b"A", None)
        .await
        .unwrap();

    // Stale expectation fails and leaves the file untouched.
    let err = fx
        .gateway
        .write(&fx.record, "/workspace/x", b"B", Some("E0-stale"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "etag_conflict");
    let read = fx.gateway.read(&fx.record, "/workspace/x").await.unwrap();
    assert_eq!(read.content, b"A");
    assert_eq!(read.info.etag, etag);

    // The correct expectation succeeds.
    fx.gateway
        .write(&fx.record, "/workspace/x", b"B", Some(&etag))
        .await
        .unwrap();
    let read = fx.gateway.read(&fx.record, "/workspace/x").await.unwrap();
    assert_eq!(read.content, b"B");
}

#[tokio::test]
async fn test_read_missing_is_not_found() {
    let fx = fixture().await;
    let err = fx.gateway.read(&fx.record, "/workspace/nope").await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

// =============================================================================
// Containment
// =============================================================================

#[tokio::test]
async fn test_traversal_rejected_before_any_runtime_call() {
    let fx = fixture().await;
    // A record with no runtime id proves rejection happens lexically,
    // before the adapter could be consulted.
    let mut record = fx.record.clone();
    record.runtime_id = None;
    let err = fx
        .gateway
        .read(&record, "/workspace/../etc/passwd")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "path_violation");
}

#[tokio::test]
async fn test_symlink_escape_is_path_violation() {
    let fx = fixture().await;
    std::os::unix::fs::symlink("/etc", fx.volume_host_dir.join("evil")).unwrap();
    let err = fx.gateway.stat(&fx.record, "/workspace/evil").await.unwrap_err();
    assert_eq!(err.code(), "path_violation");

    let err = fx
        .gateway
        .read(&fx.record, "/workspace/evil/passwd")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "path_violation");
}

// =============================================================================
// List / Delete
// =============================================================================

#[tokio::test]
async fn test_list_entries_with_metadata() {
    let fx = fixture().await;
    fx.gateway
        .write(&fx.record, "/workspace/one.txt", b"1", None)
        .await
        .unwrap();
    fx.gateway
        .write(&fx.record, "/workspace/sub/two.txt", b"22", None)
        .await
        .unwrap();

    let entries = fx.gateway.list(&fx.record, "/workspace").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    assert!(names.contains(&"/workspace/one.txt"));
    assert!(names.contains(&"/workspace/sub"));

    let file = entries.iter().find(|e| e.path == "/workspace/one.txt").unwrap();
    assert!(!file.is_dir);
    assert_eq!(file.size, 1);
    assert!(!file.etag.is_empty());
    let dir = entries.iter().find(|e| e.path == "/workspace/sub").unwrap();
    assert!(dir.is_dir);
}

#[tokio::test]
async fn test_directory_delete_requires_recursive() {
    let fx = fixture().await;
    fx.gateway
        .write(&fx.record, "/workspace/dir/file.txt", b"x", None)
        .await
        .unwrap();

    let err = fx
        .gateway
        .delete(&fx.record, "/workspace/dir", false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "path_violation");
    // Still there.
    fx.gateway.stat(&fx.record, "/workspace/dir").await.unwrap();

    fx.gateway
        .delete(&fx.record, "/workspace/dir", true)
        .await
        .unwrap();
    let err = fx.gateway.stat(&fx.record, "/workspace/dir").await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_delete_missing_is_not_found() {
    let fx = fixture().await;
    let err = fx
        .gateway
        .delete(&fx.record, "/workspace/ghost", false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

// =============================================================================
// Tar Export / Import
// =============================================================================

#[tokio::test]
async fn test_tar_roundtrip_reproduces_tree() {
    let fx = fixture().await;
    fx.gateway
        .write(&fx.record, "/workspace/src/main.rs", b"fn main() {}", None)
        .await
        .unwrap();
    fx.gateway
        .write(&fx.record, "/workspace/readme.md", b"# hi", None)
        .await
        .unwrap();

    let archive = fx
        .gateway
        .tar_export(&fx.record, "/workspace", &[], &[])
        .await
        .unwrap();

    let summary = fx
        .gateway
        .tar_import(&fx.record, "/workspace/restored", &archive)
        .await
        .unwrap();
    assert!(summary.entries > 0);

    let read = fx
        .gateway
        .read(&fx.record, "/workspace/restored/workspace/src/main.rs")
        .await
        .unwrap();
    assert_eq!(read.content, b"fn main() {}");
}

#[tokio::test]
async fn test_tar_export_respects_globs() {
    let fx = fixture().await;
    fx.gateway
        .write(&fx.record, "/workspace/keep.rs", b"k", None)
        .await
        .unwrap();
    fx.gateway
        .write(&fx.record, "/workspace/drop.log", b"d", None)
        .await
        .unwrap();

    let archive = fx
        .gateway
        .tar_export(&fx.record, "/workspace", &["**/*.rs".to_string()], &[])
        .await
        .unwrap();

    let mut reader = tar::Archive::new(&archive[..]);
    let names: Vec<String> = reader
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().display().to_string())
        .collect();
    assert!(names.iter().any(|n| n.ends_with("keep.rs")));
    assert!(!names.iter().any(|n| n.ends_with("drop.log")));
}

#[tokio::test]
async fn test_tar_import_rejects_hostile_archive() {
    let fx = fixture().await;
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "../outside.txt", &b"evil"[..])
        .unwrap();
    let archive = builder.into_inner().unwrap();

    let err = fx
        .gateway
        .tar_import(&fx.record, "/workspace/in", &archive)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "path_violation");
}

// =============================================================================
// Batches
// =============================================================================

#[tokio::test]
async fn test_batch_fails_fast_on_stale_etag() {
    let fx = fixture().await;
    fx.gateway
        .write(&fx.record, "/workspace/a.txt", b"original", None)
        .await
        .unwrap();

    let err = fx
        .gateway
        .batch(
            &fx.record,
            &[
                BatchOp::Write {
                    path: "/workspace/new.txt".to_string(),
                    content: b"should not land".to_vec(),
                    if_match_etag: None,
                },
                BatchOp::Write {
                    path: "/workspace/a.txt".to_string(),
                    content: b"clobber".to_vec(),
                    if_match_etag: Some("stale".to_string()),
                },
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "etag_conflict");

    // ETags validate before any mutation, so nothing landed.
    assert_eq!(
        fx.gateway
            .read(&fx.record, "/workspace/new.txt")
            .await
            .unwrap_err()
            .code(),
        "not_found"
    );
    let read = fx.gateway.read(&fx.record, "/workspace/a.txt").await.unwrap();
    assert_eq!(read.content, b"original");
}

#[tokio::test]
async fn test_batch_rolls_back_on_mid_failure() {
    let fx = fixture().await;
    fx.gateway
        .write(&fx.record, "/workspace/victim.txt", b"before", None)
        .await
        .unwrap();

    let err = fx
        .gateway
        .batch(
            &fx.record,
            &[
                BatchOp::Write {
                    path: "/workspace/victim.txt".to_string(),
                    content: b"after".to_vec(),
                    if_match_etag: None,
                },
                // A directory delete without recursion fails mid-batch.
                BatchOp::Delete {
                    path: "/workspace/missing-dir".to_string(),
                    recursive: false,
                },
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    let read = fx.gateway.read(&fx.record, "/workspace/victim.txt").await.unwrap();
    assert_eq!(read.content, b"before", "first write rolled back");
}
