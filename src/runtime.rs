//! Container runtime capability trait.
//!
//! This trait defines the narrow surface the control plane needs from a
//! container substrate: lifecycle, label-scoped listing, streamed command
//! execution, archive copy in/out, and stats snapshots. It is a pure
//! translation layer - policy (image allow-lists, security hardening,
//! concurrency limits) lives above it, and every backend error is
//! normalized into the crate taxonomy before it crosses this boundary.
//!
//! # Lifecycle
//!
//! ```text
//! create_container(spec) → start(id) → [exec_run(id, ...)] → stop(id) → remove(id)
//! ```
//!
//! # Implementations
//!
//! - [`DockerRuntime`](crate::runtimes::DockerRuntime): Docker/Podman daemon via bollard
//! - [`LocalProcessRuntime`](crate::runtimes::LocalProcessRuntime): host processes, no daemon
//!
//! Backends are interchangeable capability sets; nothing in the control
//! plane depends on which one is wired in.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

// =============================================================================
// Container State
// =============================================================================

/// Daemon-side container status, reduced to what reconciliation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Exited or stopped.
    Exited,
    /// Any other daemon state (paused, dead, restarting).
    Unknown,
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A container as the daemon reports it.
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    /// Daemon-native container id.
    pub runtime_id: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Daemon-side status.
    pub status: RuntimeStatus,
    /// Labels attached at creation.
    pub labels: HashMap<String, String>,
    /// Named volumes mounted into the container, `(volume_name, mount_path)`.
    pub volumes: Vec<(String, String)>,
    /// Daemon-reported creation time, if available.
    pub created_at: Option<DateTime<Utc>>,
}

impl RuntimeContainer {
    /// Label lookup helper.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

// =============================================================================
// Creation Spec
// =============================================================================

/// Resource ceilings applied to a container at creation.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
    /// CPU quota in microseconds per `cpu_period_us`.
    pub cpu_quota_us: i64,
    /// CPU period in microseconds.
    pub cpu_period_us: i64,
    /// Maximum number of processes.
    pub pids_limit: i64,
}

/// Network attachment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Default bridge network.
    Bridge,
    /// No network access.
    None,
}

/// Full specification for creating a container.
///
/// The manager fills this from policy + security defaults; the adapter
/// translates it verbatim and adds nothing.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference (post policy resolution).
    pub image: String,
    /// Labels to attach, including the namespace marker and opaque id.
    pub labels: HashMap<String, String>,
    /// Named workspace volume and its mount path.
    pub workspace_volume: (String, String),
    /// `uid:gid` the container main process runs as.
    pub user: String,
    /// Working directory.
    pub working_dir: String,
    /// Capabilities to drop.
    pub cap_drop: Vec<String>,
    /// Apply `no-new-privileges`.
    pub no_new_privileges: bool,
    /// Mount the root filesystem read-only (the workspace volume stays rw).
    pub read_only_rootfs: bool,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Network policy.
    pub network: NetworkMode,
}

// =============================================================================
// Execution
// =============================================================================

/// Which stream a chunk of output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One chunk of raw output pulled from the daemon.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// Specification for one command execution inside a running container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Command and arguments.
    pub argv: Vec<String>,
    /// Working directory inside the container.
    pub cwd: String,
    /// Extra environment. Never logged.
    pub env: HashMap<String, String>,
    /// User to run as (`"0"` for root, `"1000"` otherwise).
    pub user: String,
}

/// Signal to deliver to an in-container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecSignal {
    /// Graceful termination request.
    Term,
    /// Immediate kill.
    Kill,
}

impl ExecSignal {
    /// Signal number, for backends that deliver numerically.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }

    /// Signal name without the `SIG` prefix, for `kill -s` style delivery.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

/// A started execution, handed back to the engine.
///
/// `chunks` closes when both output streams are drained. `exit` resolves
/// with the observed exit code once the process is gone; if the backend
/// loses track of the process the sender is dropped and the engine treats
/// the execution as failed.
#[derive(Debug)]
pub struct RunningExec {
    /// Backend-native exec identifier (daemon exec id or stringified pid).
    pub runtime_exec_id: String,
    /// In-container PID of the exec process, when the backend can learn it.
    /// Required for signal delivery on daemon backends.
    pub pid: Option<i64>,
    /// Ordered output chunks, both streams interleaved by arrival.
    pub chunks: mpsc::Receiver<OutputChunk>,
    /// Resolves with the exit code.
    pub exit: oneshot::Receiver<i64>,
}

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time resource usage for a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    /// Total CPU time consumed, nanoseconds.
    pub cpu_ns: u64,
    /// Current memory usage, bytes.
    pub mem_bytes: u64,
    /// Peak memory usage, bytes (falls back to current when the daemon
    /// does not report a peak).
    pub mem_peak_bytes: u64,
}

// =============================================================================
// Capability Trait
// =============================================================================

/// Capability-oriented interface over a container substrate.
///
/// All methods are async and safe to call concurrently. Blocking daemon
/// I/O must happen off the caller's task (the bollard backend is natively
/// async; the process backend uses tokio primitives throughout).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the backend name.
    fn name(&self) -> &str;

    /// Checks daemon connectivity. `Err(RuntimeUnavailable)` when the
    /// substrate cannot be reached.
    async fn ping(&self) -> Result<()>;

    /// Creates a container. Returns the daemon-native id. The container is
    /// created but not started.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starts a created container.
    async fn start_container(&self, runtime_id: &str) -> Result<()>;

    /// Stops a container, allowing `timeout` for graceful exit before the
    /// daemon force-kills.
    async fn stop_container(&self, runtime_id: &str, timeout: Duration) -> Result<()>;

    /// Removes a container. `drop_volumes` also removes anonymous/attached
    /// transient volumes.
    async fn remove_container(&self, runtime_id: &str, force: bool, drop_volumes: bool)
        -> Result<()>;

    /// Inspects a single container.
    async fn inspect_container(&self, runtime_id: &str) -> Result<RuntimeContainer>;

    /// Lists all containers (running or not) carrying `label=true`.
    async fn list_labeled(&self, label: &str) -> Result<Vec<RuntimeContainer>>;

    /// Creates and starts an exec inside a running container, returning the
    /// streamed handle.
    async fn exec_run(&self, runtime_id: &str, spec: &ExecSpec) -> Result<RunningExec>;

    /// Delivers a signal to an exec's process. `pid` is the in-container
    /// PID reported by [`RunningExec::pid`].
    async fn signal_exec(&self, runtime_id: &str, pid: i64, signal: ExecSignal) -> Result<()>;

    /// Unpacks a tar archive into `dest_dir` inside the container.
    async fn copy_in(&self, runtime_id: &str, dest_dir: &str, tar_bytes: Vec<u8>) -> Result<()>;

    /// Packs `path` inside the container into a tar archive.
    async fn copy_out(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Snapshots resource usage for a container.
    async fn stats_snapshot(&self, runtime_id: &str) -> Result<StatsSnapshot>;

    /// Removes a named volume. Missing volumes are not an error.
    async fn remove_volume(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RuntimeStatus::Running).unwrap(),
            "\"running\""
        );
        let s: RuntimeStatus = serde_json::from_str("\"exited\"").unwrap();
        assert_eq!(s, RuntimeStatus::Exited);
    }

    #[test]
    fn test_stream_kind_display() {
        assert_eq!(StreamKind::Stdout.to_string(), "stdout");
        assert_eq!(StreamKind::Stderr.to_string(), "stderr");
    }

    #[test]
    fn test_exec_signal_numbers() {
        assert_eq!(ExecSignal::Term.as_i32(), libc::SIGTERM);
        assert_eq!(ExecSignal::Kill.as_i32(), libc::SIGKILL);
        assert_eq!(ExecSignal::Term.name(), "TERM");
    }
}
