//! # Docker Runtime - Daemon-Backed Containers
//!
//! Implements [`ContainerRuntime`] against a Docker (or Podman-compatible)
//! daemon via bollard. This is the production backend: containers are real
//! daemon objects, execs are daemon execs with demuxed stdout/stderr
//! streams, and archive copy rides the daemon's tar endpoints.
//!
//! ## Connection
//!
//! - Default: the daemon's standard local detection (unix socket on Linux).
//! - `unix://...` / `tcp://...` / `http://...` URIs select the transport
//!   explicitly (daemon flavor A/B per deployment).
//!
//! ## Error Normalization
//!
//! bollard errors never cross this module's boundary:
//!
//! | Daemon condition              | Taxonomy                |
//! |-------------------------------|-------------------------|
//! | connection refused / hyper IO | `runtime_unavailable`   |
//! | HTTP 404                      | `not_found`             |
//! | HTTP 409/5xx and other API    | `runtime_error`         |
//!
//! ## Exec Signals
//!
//! The daemon has no "kill exec" endpoint. Signal delivery resolves the
//! exec's in-container PID (reported by exec inspect) and runs a root
//! helper exec (`kill -s <SIG> <pid>`) inside the same container.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as DaemonContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ExecSignal, ExecSpec, NetworkMode, OutputChunk,
    RunningExec, RuntimeContainer, RuntimeStatus, StatsSnapshot, StreamKind,
};

/// Buffered chunks between the daemon stream and the reader task.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Retries while waiting for exec inspect to report a PID / exit code.
const EXEC_INSPECT_RETRIES: usize = 10;

/// Delay between exec inspect retries.
const EXEC_INSPECT_BACKOFF: Duration = Duration::from_millis(100);

/// Docker daemon backend.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the daemon's standard local detection.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Connects to an explicit daemon URI (`unix://` or `tcp://`/`http://`).
    pub fn connect_uri(uri: &str) -> Result<Self> {
        let docker = if let Some(path) = uri.strip_prefix("unix://") {
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(uri, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Pulls an image the daemon does not have yet.
    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!(image, "pulling image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| map_daemon_error(e, image))?;
        }
        Ok(())
    }

    async fn try_create(&self, spec: &ContainerSpec, name: &str) -> std::result::Result<String, bollard::errors::Error> {
        let (volume_name, mount_path) = spec.workspace_volume.clone();
        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                target: Some(mount_path),
                source: Some(volume_name),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]),
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: spec
                .no_new_privileges
                .then(|| vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(spec.read_only_rootfs),
            privileged: Some(false),
            memory: Some(spec.limits.memory_bytes as i64),
            cpu_quota: Some(spec.limits.cpu_quota_us),
            cpu_period: Some(spec.limits.cpu_period_us),
            pids_limit: Some(spec.limits.pids_limit),
            network_mode: Some(
                match spec.network {
                    NetworkMode::Bridge => "bridge",
                    NetworkMode::None => "none",
                }
                .to_string(),
            ),
            ..Default::default()
        };

        let config = DaemonContainerConfig {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(created.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let name = spec
            .labels
            .get(crate::constants::LABEL_CONTAINER_ID)
            .cloned()
            .unwrap_or_else(|| format!("devbench-{}", uuid::Uuid::now_v7().simple()));

        match self.try_create(spec, &name).await {
            Ok(id) => Ok(id),
            Err(e) if is_missing_image(&e) => {
                self.pull_image(&spec.image).await?;
                self.try_create(spec, &name)
                    .await
                    .map_err(|e| map_daemon_error(e, &spec.image))
            }
            Err(e) => Err(map_daemon_error(e, &spec.image)),
        }
    }

    async fn start_container(&self, runtime_id: &str) -> Result<()> {
        self.docker
            .start_container(runtime_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_daemon_error(e, runtime_id))
    }

    async fn stop_container(&self, runtime_id: &str, timeout: Duration) -> Result<()> {
        let result = self
            .docker
            .stop_container(
                runtime_id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            // 304: already stopped. Idempotent by contract.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_daemon_error(e, runtime_id)),
        }
    }

    async fn remove_container(
        &self,
        runtime_id: &str,
        force: bool,
        drop_volumes: bool,
    ) -> Result<()> {
        let result = self
            .docker
            .remove_container(
                runtime_id,
                Some(RemoveContainerOptions {
                    force,
                    v: drop_volumes,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            // Removing an already-gone container is success for our purposes.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_daemon_error(e, runtime_id)),
        }
    }

    async fn inspect_container(&self, runtime_id: &str) -> Result<RuntimeContainer> {
        let details = self
            .docker
            .inspect_container(runtime_id, None)
            .await
            .map_err(|e| map_daemon_error(e, runtime_id))?;

        let status = details
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| match s {
                bollard::models::ContainerStateStatusEnum::CREATED => RuntimeStatus::Created,
                bollard::models::ContainerStateStatusEnum::RUNNING => RuntimeStatus::Running,
                bollard::models::ContainerStateStatusEnum::EXITED => RuntimeStatus::Exited,
                _ => RuntimeStatus::Unknown,
            })
            .unwrap_or(RuntimeStatus::Unknown);

        let labels = details
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let image = details
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let volumes = details
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| Some((m.name?, m.destination?)))
            .collect();
        let created_at = details
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc));

        Ok(RuntimeContainer {
            runtime_id: details.id.unwrap_or_else(|| runtime_id.to_string()),
            image,
            status,
            labels,
            volumes,
            created_at,
        })
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<RuntimeContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{label}=true")]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_daemon_error(e, label))?;

        Ok(summaries
            .into_iter()
            .map(|s| RuntimeContainer {
                runtime_id: s.id.unwrap_or_default(),
                image: s.image.unwrap_or_default(),
                status: match s.state.as_deref() {
                    Some("running") => RuntimeStatus::Running,
                    Some("created") => RuntimeStatus::Created,
                    Some("exited") | Some("stopped") => RuntimeStatus::Exited,
                    _ => RuntimeStatus::Unknown,
                },
                labels: s.labels.unwrap_or_default(),
                volumes: s
                    .mounts
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| Some((m.name?, m.destination?)))
                    .collect(),
                created_at: s.created.and_then(|c| Utc.timestamp_opt(c, 0).single()),
            })
            .collect())
    }

    async fn exec_run(&self, runtime_id: &str, spec: &ExecSpec) -> Result<RunningExec> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let created = self
            .docker
            .create_exec(
                runtime_id,
                CreateExecOptions {
                    cmd: Some(spec.argv.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(spec.cwd.clone()),
                    env: Some(env),
                    user: Some(spec.user.clone()),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_daemon_error(e, runtime_id))?;
        let exec_id = created.id;

        let started = self
            .docker
            .start_exec(&exec_id, None::<StartExecOptions>)
            .await
            .map_err(|e| map_daemon_error(e, runtime_id))?;
        let output = match started {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(Error::RuntimeError(
                    "daemon started exec detached despite attach request".to_string(),
                ));
            }
        };

        // The PID appears in inspect shortly after start; poll briefly so
        // signal delivery works for the engine.
        let mut pid = None;
        for _ in 0..EXEC_INSPECT_RETRIES {
            match self.docker.inspect_exec(&exec_id).await {
                Ok(details) => {
                    if let Some(p) = details.pid.filter(|p| *p > 0) {
                        pid = Some(p);
                        break;
                    }
                    if details.running == Some(false) {
                        break;
                    }
                }
                Err(_) => break,
            }
            tokio::time::sleep(EXEC_INSPECT_BACKOFF).await;
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let docker = self.docker.clone();
        let inspect_id = exec_id.clone();

        tokio::spawn(async move {
            let mut output = output;
            while let Some(item) = output.next().await {
                let chunk = match item {
                    Ok(bollard::container::LogOutput::StdOut { message }) => OutputChunk {
                        stream: StreamKind::Stdout,
                        data: message.to_vec(),
                    },
                    Ok(bollard::container::LogOutput::StdErr { message }) => OutputChunk {
                        stream: StreamKind::Stderr,
                        data: message.to_vec(),
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "exec output stream error");
                        break;
                    }
                };
                // Bounded send applies back-pressure to the daemon read.
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            drop(tx);

            // The stream closed; the exit code lands in inspect once the
            // daemon reaps the process.
            let mut exit_code = -1;
            for _ in 0..EXEC_INSPECT_RETRIES {
                match docker.inspect_exec(&inspect_id).await {
                    Ok(details) if details.running != Some(true) => {
                        exit_code = details.exit_code.unwrap_or(-1);
                        break;
                    }
                    Ok(_) => tokio::time::sleep(EXEC_INSPECT_BACKOFF).await,
                    Err(e) => {
                        warn!(error = %e, "exec inspect failed after stream close");
                        break;
                    }
                }
            }
            let _ = exit_tx.send(exit_code);
        });

        Ok(RunningExec {
            runtime_exec_id: exec_id,
            pid,
            chunks: rx,
            exit: exit_rx,
        })
    }

    async fn signal_exec(&self, runtime_id: &str, pid: i64, signal: ExecSignal) -> Result<()> {
        // No daemon endpoint kills an exec; a root helper exec delivers the
        // signal to the in-container PID instead.
        let created = self
            .docker
            .create_exec(
                runtime_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "kill".to_string(),
                        "-s".to_string(),
                        signal.name().to_string(),
                        pid.to_string(),
                    ]),
                    user: Some("0".to_string()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_daemon_error(e, runtime_id))?;
        self.docker
            .start_exec(&created.id, Some(StartExecOptions {
                detach: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_daemon_error(e, runtime_id))?;
        Ok(())
    }

    async fn copy_in(&self, runtime_id: &str, dest_dir: &str, tar_bytes: Vec<u8>) -> Result<()> {
        self.docker
            .upload_to_container(
                runtime_id,
                Some(UploadToContainerOptions {
                    path: dest_dir.to_string(),
                    ..Default::default()
                }),
                tar_bytes.into(),
            )
            .await
            .map_err(|e| map_daemon_error(e, runtime_id))
    }

    async fn copy_out(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>> {
        let mut stream = self.docker.download_from_container(
            runtime_id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| map_daemon_error(e, path))?;
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    async fn stats_snapshot(&self, runtime_id: &str) -> Result<StatsSnapshot> {
        let mut stream = self.docker.stats(
            runtime_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = match stream.next().await {
            Some(s) => s.map_err(|e| map_daemon_error(e, runtime_id))?,
            None => return Ok(StatsSnapshot::default()),
        };
        let cpu_ns = stats.cpu_stats.cpu_usage.total_usage;
        let mem_bytes = stats.memory_stats.usage.unwrap_or(0);
        let mem_peak = stats.memory_stats.max_usage.unwrap_or(mem_bytes);
        Ok(StatsSnapshot {
            cpu_ns,
            mem_bytes,
            mem_peak_bytes: mem_peak,
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let result = self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_daemon_error(e, name)),
        }
    }
}

// =============================================================================
// Error Normalization
// =============================================================================

fn is_missing_image(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } if message.contains("No such image")
    )
}

/// Maps a bollard error into the crate taxonomy. `subject` names the
/// container/image/path for the `not_found` case.
fn map_daemon_error(e: bollard::errors::Error, subject: &str) -> Error {
    use bollard::errors::Error as B;
    match e {
        B::DockerResponseServerError {
            status_code: 404, ..
        } => Error::ContainerNotFound(subject.to_string()),
        B::DockerResponseServerError {
            status_code,
            message,
        } => Error::RuntimeError(format!("daemon returned {status_code}: {message}")),
        B::RequestTimeoutError => Error::RuntimeUnavailable("daemon request timed out".to_string()),
        B::IOError { .. } | B::HyperResponseError { .. } => {
            Error::RuntimeUnavailable(e.to_string())
        }
        other => Error::RuntimeError(other.to_string()),
    }
}
