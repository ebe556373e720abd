//! # Local-Process Runtime - Daemon-less Backend
//!
//! Implements [`ContainerRuntime`] with plain host processes and
//! directories. A "container" is a workspace directory under the backend's
//! base dir; an exec is a `tokio::process` child rooted there. No isolation
//! is provided - this backend exists for integration tests and daemon-less
//! development, exercising the exact trait surface the Docker backend
//! implements.
//!
//! Container metadata (labels, status) lives in process memory only, so
//! this backend does not survive restarts; workspace directories do, which
//! is enough for persistent-volume semantics in tests.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ExecSignal, ExecSpec, OutputChunk, RunningExec,
    RuntimeContainer, RuntimeStatus, StatsSnapshot, StreamKind,
};

/// Read size for stream forwarding.
const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone)]
struct ProcContainer {
    image: String,
    labels: HashMap<String, String>,
    volume: (String, String),
    status: RuntimeStatus,
    created_at: chrono::DateTime<Utc>,
}

/// Host-process backend.
pub struct LocalProcessRuntime {
    base_dir: PathBuf,
    containers: RwLock<HashMap<String, ProcContainer>>,
}

impl LocalProcessRuntime {
    /// Creates a backend rooted at `base_dir` (volumes live beneath it).
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("volumes"))?;
        Ok(Self {
            base_dir,
            containers: RwLock::new(HashMap::new()),
        })
    }

    fn volume_dir(&self, volume_name: &str) -> PathBuf {
        self.base_dir.join("volumes").join(volume_name)
    }

    fn get(&self, runtime_id: &str) -> Result<ProcContainer> {
        self.containers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(runtime_id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(runtime_id.to_string()))
    }

    fn set_status(&self, runtime_id: &str, status: RuntimeStatus) -> Result<()> {
        let mut containers = self.containers.write().unwrap_or_else(|p| p.into_inner());
        match containers.get_mut(runtime_id) {
            Some(c) => {
                c.status = status;
                Ok(())
            }
            None => Err(Error::ContainerNotFound(runtime_id.to_string())),
        }
    }

    /// Maps a container-side absolute path to the host path inside the
    /// container's volume directory.
    fn host_path(&self, container: &ProcContainer, container_path: &str) -> Result<PathBuf> {
        let (volume_name, mount_path) = &container.volume;
        let rel = if container_path == mount_path {
            ""
        } else {
            container_path
                .strip_prefix(&format!("{mount_path}/"))
                .ok_or_else(|| Error::RuntimeError(format!(
                    "path '{container_path}' is outside the mounted workspace"
                )))?
        };
        Ok(self.volume_dir(volume_name).join(rel))
    }
}

#[async_trait]
impl ContainerRuntime for LocalProcessRuntime {
    fn name(&self) -> &str {
        "local-process"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let runtime_id = format!("p_{}", uuid::Uuid::now_v7().simple());
        std::fs::create_dir_all(self.volume_dir(&spec.workspace_volume.0))?;
        self.containers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                runtime_id.clone(),
                ProcContainer {
                    image: spec.image.clone(),
                    labels: spec.labels.clone(),
                    volume: spec.workspace_volume.clone(),
                    status: RuntimeStatus::Created,
                    created_at: Utc::now(),
                },
            );
        debug!(%runtime_id, image = %spec.image, "process container created");
        Ok(runtime_id)
    }

    async fn start_container(&self, runtime_id: &str) -> Result<()> {
        self.set_status(runtime_id, RuntimeStatus::Running)
    }

    async fn stop_container(&self, runtime_id: &str, _timeout: Duration) -> Result<()> {
        self.set_status(runtime_id, RuntimeStatus::Exited)
    }

    async fn remove_container(
        &self,
        runtime_id: &str,
        _force: bool,
        drop_volumes: bool,
    ) -> Result<()> {
        let removed = self
            .containers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(runtime_id);
        if let Some(c) = removed {
            if drop_volumes {
                let dir = self.volume_dir(&c.volume.0);
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
            }
        }
        Ok(())
    }

    async fn inspect_container(&self, runtime_id: &str) -> Result<RuntimeContainer> {
        let c = self.get(runtime_id)?;
        Ok(RuntimeContainer {
            runtime_id: runtime_id.to_string(),
            image: c.image,
            status: c.status,
            labels: c.labels,
            volumes: vec![c.volume],
            created_at: Some(c.created_at),
        })
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<RuntimeContainer>> {
        let containers = self.containers.read().unwrap_or_else(|p| p.into_inner());
        Ok(containers
            .iter()
            .filter(|(_, c)| c.labels.get(label).map(String::as_str) == Some("true"))
            .map(|(id, c)| RuntimeContainer {
                runtime_id: id.clone(),
                image: c.image.clone(),
                status: c.status,
                labels: c.labels.clone(),
                volumes: vec![c.volume.clone()],
                created_at: Some(c.created_at),
            })
            .collect())
    }

    async fn exec_run(&self, runtime_id: &str, spec: &ExecSpec) -> Result<RunningExec> {
        let container = self.get(runtime_id)?;
        if container.status != RuntimeStatus::Running {
            return Err(Error::RuntimeError(format!(
                "container '{runtime_id}' is not running"
            )));
        }
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| Error::RuntimeError("empty argv".to_string()))?;
        let cwd = self.host_path(&container, &spec.cwd)?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(&spec.env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::RuntimeError(format!("spawn failed: {e}")))?;

        let pid = child.id().map(i64::from);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(out) = stdout {
            tokio::spawn(forward(out, StreamKind::Stdout, tx.clone()));
        }
        if let Some(err) = stderr {
            tokio::spawn(forward(err, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(error = %e, "wait on child failed");
                    -1
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(RunningExec {
            runtime_exec_id: pid.map(|p| p.to_string()).unwrap_or_default(),
            pid,
            chunks: rx,
            exit: exit_rx,
        })
    }

    async fn signal_exec(&self, _runtime_id: &str, pid: i64, signal: ExecSignal) -> Result<()> {
        // SAFETY: kill with a valid pid and signal number has no memory
        // effects; an ESRCH result just means the process is already gone.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_i32()) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::RuntimeError(format!(
                    "kill({pid}, {signal:?}) failed: {errno}"
                )));
            }
        }
        Ok(())
    }

    async fn copy_in(&self, runtime_id: &str, dest_dir: &str, tar_bytes: Vec<u8>) -> Result<()> {
        let container = self.get(runtime_id)?;
        let dest = self.host_path(&container, dest_dir)?;
        std::fs::create_dir_all(&dest)?;
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if has_traversal(&path) {
                return Err(Error::PathViolation {
                    path: path.display().to_string(),
                    reason: "tar entry escapes destination".to_string(),
                });
            }
            if !entry.unpack_in(&dest)? {
                return Err(Error::PathViolation {
                    path: path.display().to_string(),
                    reason: "tar entry escapes destination".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn copy_out(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>> {
        let container = self.get(runtime_id)?;
        let host = self.host_path(&container, path)?;
        let meta = std::fs::symlink_metadata(&host)
            .map_err(|_| Error::PathNotFound(path.to_string()))?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());

        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        if meta.is_dir() {
            builder.append_dir_all(&name, &host)?;
        } else {
            builder.append_path_with_name(&host, &name)?;
        }
        builder.into_inner().map_err(Error::from)
    }

    async fn stats_snapshot(&self, _runtime_id: &str) -> Result<StatsSnapshot> {
        // Host processes are not cgroup-accounted; wall time is tracked by
        // the engine and cpu/mem report zero.
        Ok(StatsSnapshot::default())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let dir = self.volume_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

async fn forward(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    stream: StreamKind,
    tx: mpsc::Sender<OutputChunk>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    data: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            // Shell convention for signal-terminated processes.
            return 128 + i64::from(sig);
        }
    }
    status.code().map(i64::from).unwrap_or(-1)
}

fn has_traversal(path: &Path) -> bool {
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{NetworkMode, ResourceLimits};
    use tempfile::TempDir;

    fn spec(volume: &str) -> ContainerSpec {
        ContainerSpec {
            image: "docker.io/library/alpine:3.18".to_string(),
            labels: HashMap::from([(crate::constants::LABEL_NAMESPACE.to_string(), "true".to_string())]),
            workspace_volume: (volume.to_string(), "/workspace".to_string()),
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
        }
    }

    async fn running_container(rt: &LocalProcessRuntime) -> String {
        let id = rt.create_container(&spec("vol-test")).await.unwrap();
        rt.start_container(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalProcessRuntime::new(tmp.path()).unwrap();
        let id = rt.create_container(&spec("vol-a")).await.unwrap();
        assert_eq!(
            rt.inspect_container(&id).await.unwrap().status,
            RuntimeStatus::Created
        );
        rt.start_container(&id).await.unwrap();
        assert_eq!(
            rt.inspect_container(&id).await.unwrap().status,
            RuntimeStatus::Running
        );
        rt.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        rt.remove_container(&id, false, true).await.unwrap();
        assert!(rt.inspect_container(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_labeled() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalProcessRuntime::new(tmp.path()).unwrap();
        running_container(&rt).await;
        let listed = rt
            .list_labeled(crate::constants::LABEL_NAMESPACE)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(rt.list_labeled("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exec_streams_and_exit() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalProcessRuntime::new(tmp.path()).unwrap();
        let id = running_container(&rt).await;

        let mut exec = rt
            .exec_run(
                &id,
                &ExecSpec {
                    argv: vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        "printf out; printf err 1>&2; exit 3".to_string(),
                    ],
                    cwd: "/workspace".to_string(),
                    env: HashMap::new(),
                    user: "1000".to_string(),
                },
            )
            .await
            .unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = exec.chunks.recv().await {
            match chunk.stream {
                StreamKind::Stdout => stdout.extend(chunk.data),
                StreamKind::Stderr => stderr.extend(chunk.data),
            }
        }
        assert_eq!(stdout, b"out");
        assert_eq!(stderr, b"err");
        assert_eq!(exec.exit.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exec_missing_cwd_is_runtime_error() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalProcessRuntime::new(tmp.path()).unwrap();
        let id = running_container(&rt).await;
        let err = rt
            .exec_run(
                &id,
                &ExecSpec {
                    argv: vec!["true".to_string()],
                    cwd: "/workspace/does/not/exist".to_string(),
                    env: HashMap::new(),
                    user: "1000".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "runtime_error");
    }

    #[tokio::test]
    async fn test_copy_in_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalProcessRuntime::new(tmp.path()).unwrap();
        let id = running_container(&rt).await;

        let mut builder = tar::Builder::new(Vec::new());
        let data = b"evil";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "../escape.txt", &data[..])
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let err = rt.copy_in(&id, "/workspace", tar_bytes).await.unwrap_err();
        assert_eq!(err.code(), "path_violation");
    }

    #[tokio::test]
    async fn test_copy_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalProcessRuntime::new(tmp.path()).unwrap();
        let id = running_container(&rt).await;

        let mut builder = tar::Builder::new(Vec::new());
        let data = b"hello world";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "hello.txt", &data[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        rt.copy_in(&id, "/workspace", tar_bytes).await.unwrap();

        let out = rt.copy_out(&id, "/workspace/hello.txt").await.unwrap();
        let mut archive = tar::Archive::new(&out[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
        assert_eq!(content, data);
    }

    #[tokio::test]
    async fn test_persistent_volume_survives_remove() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalProcessRuntime::new(tmp.path()).unwrap();
        let id = running_container(&rt).await;
        let vol_dir = rt.volume_dir("vol-test");
        std::fs::write(vol_dir.join("keep.txt"), b"data").unwrap();

        // drop_volumes=false models a persistent container.
        rt.remove_container(&id, true, false).await.unwrap();
        assert!(vol_dir.join("keep.txt").exists());
        rt.remove_volume("vol-test").await.unwrap();
        assert!(!vol_dir.exists());
    }
}
