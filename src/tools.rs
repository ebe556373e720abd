//! # Tool Surface
//!
//! Typed input/output contracts for every exposed tool, and the handler
//! that dispatches them into the subsystems. The RPC framing, transport,
//! and authentication live in the embedding server; this module is the
//! complete semantic boundary - a transport maps wire requests onto these
//! structs, calls [`Tools`], and maps [`Error::code`](crate::error::Error::code)
//! onto its wire error format.
//!
//! Mutating lifecycle tools (`spawn`, `attach`, `exec_start`) are gated by
//! the shutdown coordinator; polls and reads keep working through the
//! drain window so streaming clients can finish.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::exec::ring::{Frame, FrameBody};
use crate::exec::ExecRequest;
use crate::reconcile::{MaintenanceStats, ReconcileStats};
use crate::server::ServerContext;
use crate::store::{ContainerRecord, ExecRecord, ExecUsage};
use crate::workspace::FileInfo;

/// Bytes per chunk in a tar export response.
const EXPORT_CHUNK_BYTES: usize = 512 * 1024;

// =============================================================================
// Lifecycle Tools
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnInput {
    pub image: String,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub ttl_s: Option<i64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpawnOutput {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachInput {
    pub target: String,
    pub client_name: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachOutput {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub roots: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillInput {
    pub container_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillOutput {
    pub status: String,
}

// =============================================================================
// Execution Tools
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ExecStartInput {
    pub container_id: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub as_root: bool,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecStartOutput {
    pub exec_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecCancelInput {
    pub exec_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecCancelOutput {
    pub status: String,
    pub exec_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecPollInput {
    pub exec_id: String,
    #[serde(default)]
    pub after_seq: u64,
}

/// One streamed message. Data frames carry `stream`/`data`; the terminal
/// control frame carries `exit_code` and `usage`; a server shutdown frame
/// carries `shutdown: true`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecStreamMessage {
    pub seq: u64,
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ExecUsage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub shutdown: bool,
}

impl From<Frame> for ExecStreamMessage {
    fn from(frame: Frame) -> Self {
        match frame.body {
            FrameBody::Data { stream, data } => Self {
                seq: frame.seq,
                stream: stream.to_string(),
                data: Some(String::from_utf8_lossy(&data).into_owned()),
                ts: frame.ts,
                exit_code: None,
                usage: None,
                shutdown: false,
            },
            FrameBody::Exit { exit_code, usage } => Self {
                seq: frame.seq,
                stream: "control".to_string(),
                data: None,
                ts: frame.ts,
                exit_code: Some(exit_code),
                usage: Some(usage),
                shutdown: false,
            },
            FrameBody::Shutdown => Self {
                seq: frame.seq,
                stream: "control".to_string(),
                data: None,
                ts: frame.ts,
                exit_code: None,
                usage: None,
                shutdown: true,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecPollOutput {
    pub messages: Vec<ExecStreamMessage>,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_from_seq: Option<u64>,
}

// =============================================================================
// Filesystem Tools
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct FsReadInput {
    pub container_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsReadOutput {
    pub content: Vec<u8>,
    pub size: u64,
    pub etag: String,
    pub mtime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsWriteInput {
    pub container_id: String,
    pub path: String,
    pub content: Vec<u8>,
    #[serde(default)]
    pub if_match_etag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsWriteOutput {
    pub path: String,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsDeleteInput {
    pub container_id: String,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsDeleteOutput {
    pub status: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsStatInput {
    pub container_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsStatOutput {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mode: String,
    pub mtime: DateTime<Utc>,
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl From<FileInfo> for FsStatOutput {
    fn from(info: FileInfo) -> Self {
        Self {
            path: info.path,
            size: info.size,
            is_dir: info.is_dir,
            mode: info.mode,
            mtime: info.mtime,
            etag: info.etag,
            mime_type: info.mime_type,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsListInput {
    pub container_id: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsListOutput {
    pub path: String,
    pub entries: Vec<FsStatOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TarExportInput {
    pub container_id: String,
    pub path: String,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TarExportOutput {
    pub chunks: Vec<Vec<u8>>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TarImportInput {
    pub container_id: String,
    pub dest: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TarImportOutput {
    pub entries: usize,
    pub bytes: u64,
}

// =============================================================================
// Admin Tools
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub image: String,
    pub persistent: bool,
    pub warm: bool,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<ContainerRecord> for ContainerInfo {
    fn from(rec: ContainerRecord) -> Self {
        Self {
            container_id: rec.id,
            alias: rec.alias,
            image: rec.image,
            persistent: rec.persistent,
            warm: rec.warm,
            status: rec.status.to_string(),
            created_at: rec.created_at,
            last_seen_at: rec.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecInfo {
    pub exec_id: String,
    pub container_id: String,
    pub argv: Vec<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

impl From<ExecRecord> for ExecInfo {
    fn from(rec: ExecRecord) -> Self {
        Self {
            exec_id: rec.exec_id,
            container_id: rec.container_id,
            argv: rec.argv,
            status: rec.status.to_string(),
            started_at: rec.started_at,
            ended_at: rec.ended_at,
            exit_code: rec.exit_code,
            fail_reason: rec.fail_reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusOutput {
    pub status: String,
    pub runtime_connected: bool,
    pub containers_running: i64,
    pub active_execs: usize,
    pub active_attachments: i64,
    pub counters: crate::audit::CounterSnapshot,
    pub version: String,
}

// =============================================================================
// Handler
// =============================================================================

/// Tool dispatcher. One instance serves every transport connection.
pub struct Tools {
    ctx: Arc<ServerContext>,
}

impl Tools {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    // ----- lifecycle ---------------------------------------------------------

    pub async fn spawn(&self, input: SpawnInput) -> Result<SpawnOutput> {
        self.ctx.shutdown.ensure_accepting()?;
        let spawned = self
            .ctx
            .manager
            .spawn(crate::manager::SpawnRequest {
                image: input.image,
                persistent: input.persistent,
                alias: input.alias,
                ttl_seconds: input.ttl_s,
                idempotency_key: input.idempotency_key,
            })
            .await?;
        Ok(SpawnOutput {
            container_id: spawned.container_id,
            alias: spawned.alias,
            status: spawned.status.to_string(),
        })
    }

    pub fn attach(&self, input: AttachInput) -> Result<AttachOutput> {
        self.ctx.shutdown.ensure_accepting()?;
        let result = self
            .ctx
            .manager
            .attach(&input.target, &input.client_name, &input.session_id)?;
        Ok(AttachOutput {
            container_id: result.container_id,
            alias: result.alias,
            roots: result.roots,
        })
    }

    pub async fn kill(&self, input: KillInput) -> Result<KillOutput> {
        let status = self.ctx.manager.kill(&input.container_id, input.force).await?;
        Ok(KillOutput {
            status: status.to_string(),
        })
    }

    // ----- execution ---------------------------------------------------------

    pub async fn exec_start(&self, input: ExecStartInput) -> Result<ExecStartOutput> {
        self.ctx.shutdown.ensure_accepting()?;
        let container = self.ctx.manager.resolve(&input.container_id)?;
        let exec_id = self
            .ctx
            .engine
            .exec_start(
                &container,
                ExecRequest {
                    argv: input.cmd,
                    cwd: input.cwd,
                    env: input.env.unwrap_or_default(),
                    as_root: input.as_root,
                    timeout: input.timeout_s.map(std::time::Duration::from_secs),
                    idempotency_key: input.idempotency_key,
                },
            )
            .await?;
        Ok(ExecStartOutput {
            exec_id,
            status: "running".to_string(),
        })
    }

    pub fn exec_cancel(&self, input: ExecCancelInput) -> Result<ExecCancelOutput> {
        let status = self.ctx.engine.exec_cancel(&input.exec_id)?;
        Ok(ExecCancelOutput {
            status: status.to_string(),
            exec_id: input.exec_id,
        })
    }

    pub fn exec_poll(&self, input: ExecPollInput) -> Result<ExecPollOutput> {
        let result = self.ctx.engine.exec_poll(&input.exec_id, input.after_seq)?;
        Ok(ExecPollOutput {
            messages: result.frames.into_iter().map(Into::into).collect(),
            complete: result.complete,
            gap_from_seq: result.gap_from_seq,
        })
    }

    // ----- filesystem --------------------------------------------------------

    pub async fn fs_read(&self, input: FsReadInput) -> Result<FsReadOutput> {
        let container = self.ctx.manager.resolve(&input.container_id)?;
        let result = self.ctx.workspace.read(&container, &input.path).await?;
        Ok(FsReadOutput {
            size: result.info.size,
            etag: result.info.etag,
            mtime: result.info.mtime,
            mime_type: result.info.mime_type,
            content: result.content,
        })
    }

    pub async fn fs_write(&self, input: FsWriteInput) -> Result<FsWriteOutput> {
        let container = self.ctx.manager.resolve(&input.container_id)?;
        let (etag, size) = self
            .ctx
            .workspace
            .write(
                &container,
                &input.path,
                &input.content,
                input.if_match_etag.as_deref(),
            )
            .await?;
        Ok(FsWriteOutput {
            path: input.path,
            etag,
            size,
        })
    }

    pub async fn fs_delete(&self, input: FsDeleteInput) -> Result<FsDeleteOutput> {
        let container = self.ctx.manager.resolve(&input.container_id)?;
        self.ctx
            .workspace
            .delete(&container, &input.path, input.recursive)
            .await?;
        Ok(FsDeleteOutput {
            status: "deleted".to_string(),
            path: input.path,
        })
    }

    pub async fn fs_stat(&self, input: FsStatInput) -> Result<FsStatOutput> {
        let container = self.ctx.manager.resolve(&input.container_id)?;
        let info = self.ctx.workspace.stat(&container, &input.path).await?;
        Ok(info.into())
    }

    pub async fn fs_list(&self, input: FsListInput) -> Result<FsListOutput> {
        let container = self.ctx.manager.resolve(&input.container_id)?;
        let path = input
            .path
            .unwrap_or_else(|| self.ctx.workspace.mount().to_string());
        let entries = self.ctx.workspace.list(&container, &path).await?;
        Ok(FsListOutput {
            path,
            entries: entries.into_iter().map(Into::into).collect(),
        })
    }

    pub async fn tar_export(&self, input: TarExportInput) -> Result<TarExportOutput> {
        let container = self.ctx.manager.resolve(&input.container_id)?;
        let bytes = self
            .ctx
            .workspace
            .tar_export(
                &container,
                &input.path,
                &input.include_globs,
                &input.exclude_globs,
            )
            .await?;
        let total_bytes = bytes.len() as u64;
        let chunks = bytes
            .chunks(EXPORT_CHUNK_BYTES)
            .map(<[u8]>::to_vec)
            .collect();
        Ok(TarExportOutput {
            chunks,
            total_bytes,
        })
    }

    pub async fn tar_import(&self, input: TarImportInput) -> Result<TarImportOutput> {
        let container = self.ctx.manager.resolve(&input.container_id)?;
        let summary = self
            .ctx
            .workspace
            .tar_import(&container, &input.dest, &input.data)
            .await?;
        Ok(TarImportOutput {
            entries: summary.entries,
            bytes: summary.bytes,
        })
    }

    // ----- admin -------------------------------------------------------------

    pub async fn reconcile(&self) -> Result<ReconcileStats> {
        Ok(self.ctx.reconciler.reconcile().await)
    }

    pub async fn gc(&self) -> Result<MaintenanceStats> {
        Ok(self.ctx.reconciler.maintenance().await)
    }

    pub fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .ctx
            .manager
            .list(include_stopped)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    pub fn list_execs(&self, container_id: Option<&str>) -> Result<Vec<ExecInfo>> {
        Ok(self
            .ctx
            .store
            .list_execs(container_id, false)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    pub async fn status(&self) -> Result<StatusOutput> {
        let runtime_connected = self.ctx.runtime.ping().await.is_ok();
        let containers_running = self
            .ctx
            .store
            .count_by_status(crate::store::ContainerStatus::Running)?;
        Ok(StatusOutput {
            status: if runtime_connected { "ok" } else { "degraded" }.to_string(),
            runtime_connected,
            containers_running,
            active_execs: self.ctx.engine.active_count(),
            active_attachments: self.ctx.store.count_active_attachments()?,
            counters: self.ctx.audit.snapshot(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
