//! # Durable State Store
//!
//! Transactional SQLite record of containers, attachments, executions, and
//! idempotency keys. This store - not the daemon - is the source of truth
//! for which containers belong to the system; reconciliation brings the
//! daemon back into agreement with it after any disruption.
//!
//! ## Contracts
//!
//! - WAL journaling; the database survives process crashes mid-write.
//! - Every mutation is a single transaction.
//! - Unique indexes enforce alias uniqueness among live containers and
//!   idempotency-key uniqueness; violation maps to the taxonomy
//!   (`already_exists`) rather than leaking SQL errors.
//! - Migrations run to completion in [`StateStore::open`] before the server
//!   accepts work.
//! - Execution status transitions are validated against the state machine;
//!   illegal transitions are rejected, and terminal rows are immutable.
//!
//! ## Concurrency
//!
//! A single connection behind a mutex gives single-writer-per-row
//! semantics. Operations are short (indexed point reads and single-row
//! writes against a local WAL database), so callers on the async side use
//! the store directly without a blocking pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

// =============================================================================
// Status Enums
// =============================================================================

/// Lifecycle status of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Row reserved; daemon-side container not yet created.
    Creating,
    /// Running in the daemon.
    Running,
    /// Graceful stop in progress.
    Stopping,
    /// Stopped or removed daemon-side.
    Stopped,
    /// Creation or lifecycle operation failed.
    Error,
}

impl ContainerStatus {
    /// Terminal statuses: the container no longer accepts work and its
    /// alias is released.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(Error::internal(format!("unknown container status '{other}'"))),
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an execution.
///
/// ```text
/// queued → running → {exited | timed_out | cancelled | failed}
/// running → cancelling → {cancelled | exited}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Queued,
    Running,
    Cancelling,
    Exited,
    TimedOut,
    Cancelled,
    Failed,
}

impl ExecStatus {
    /// Terminal statuses are absorbing; no output frames follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Exited | Self::TimedOut | Self::Cancelled | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Exited => "exited",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "exited" => Ok(Self::Exited),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(Error::internal(format!("unknown exec status '{other}'"))),
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: ExecStatus) -> bool {
        use ExecStatus::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) | (Queued, Failed) => true,
            (Running, Exited)
            | (Running, TimedOut)
            | (Running, Cancelled)
            | (Running, Failed)
            | (Running, Cancelling) => true,
            (Cancelling, Cancelled) | (Cancelling, Exited) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of idempotency records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyKind {
    Spawn,
    Exec,
}

impl IdempotencyKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Exec => "exec",
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A managed container row.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub runtime_id: Option<String>,
    pub alias: Option<String>,
    pub image: String,
    pub digest: Option<String>,
    pub persistent: bool,
    pub warm: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ttl_seconds: Option<i64>,
    pub workspace_volume: Option<String>,
    pub status: ContainerStatus,
}

/// A recorded client attachment.
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub id: i64,
    pub container_id: String,
    pub client_name: String,
    pub session_id: String,
    pub attached_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
}

/// Resource usage recorded with a terminal execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecUsage {
    pub cpu_ms: u64,
    pub mem_peak_bytes: u64,
    pub wall_ms: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

/// An execution row.
#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub exec_id: String,
    pub container_id: String,
    pub argv: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub as_root: bool,
    pub timeout_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub usage: Option<ExecUsage>,
    pub status: ExecStatus,
    pub fail_reason: Option<String>,
}

// =============================================================================
// Store
// =============================================================================

const SCHEMA_VERSION: i64 = 1;

/// Durable, transactional state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Opens (or creates) the database at `path` and runs migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::Store(format!("open {}: {e}", path.as_ref().display())))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.bootstrap()?;
        info!(path = %path.as_ref().display(), "state store opened");
        Ok(store)
    }

    /// Opens an in-memory database. Test-only convenience.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Store(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.bootstrap()?;
        Ok(store)
    }

    fn bootstrap(&self) -> Result<()> {
        let conn = self.lock();
        // journal_mode and busy_timeout pragmas return a result row, so
        // they cannot ride execute_batch.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

                 CREATE TABLE IF NOT EXISTS containers (
                     id               TEXT PRIMARY KEY,
                     runtime_id       TEXT,
                     alias            TEXT,
                     image            TEXT NOT NULL,
                     digest           TEXT,
                     persistent       INTEGER NOT NULL DEFAULT 0,
                     warm             INTEGER NOT NULL DEFAULT 0,
                     created_at       INTEGER NOT NULL,
                     last_seen_at     INTEGER NOT NULL,
                     ttl_seconds      INTEGER,
                     workspace_volume TEXT,
                     status           TEXT NOT NULL
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_alias_live
                     ON containers(alias)
                     WHERE alias IS NOT NULL AND status NOT IN ('stopped', 'error');
                 CREATE INDEX IF NOT EXISTS idx_containers_last_seen
                     ON containers(last_seen_at);

                 CREATE TABLE IF NOT EXISTS attachments (
                     id           INTEGER PRIMARY KEY AUTOINCREMENT,
                     container_id TEXT NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
                     client_name  TEXT NOT NULL,
                     session_id   TEXT NOT NULL,
                     attached_at  INTEGER NOT NULL,
                     detached_at  INTEGER
                 );

                 CREATE TABLE IF NOT EXISTS execs (
                     exec_id         TEXT PRIMARY KEY,
                     container_id    TEXT NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
                     argv            TEXT NOT NULL,
                     cwd             TEXT NOT NULL,
                     env             TEXT NOT NULL DEFAULT '{}',
                     as_root         INTEGER NOT NULL DEFAULT 0,
                     timeout_seconds INTEGER NOT NULL,
                     started_at      INTEGER NOT NULL,
                     ended_at        INTEGER,
                     exit_code       INTEGER,
                     usage           TEXT,
                     status          TEXT NOT NULL,
                     fail_reason     TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_execs_container_status
                     ON execs(container_id, status);

                 CREATE TABLE IF NOT EXISTS idempotency_keys (
                     key        TEXT PRIMARY KEY,
                     kind       TEXT NOT NULL,
                     target_id  TEXT NOT NULL,
                     created_at INTEGER NOT NULL
                 );

                 DELETE FROM schema_version;
                 INSERT INTO schema_version (version) VALUES (1);
                 COMMIT;",
            )?;
            debug!(version = SCHEMA_VERSION, "schema migrated");
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; continuing is safe
        // because every mutation is transactional.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Reserves a container row in `creating`. Enforces alias uniqueness
    /// among live containers.
    pub fn reserve_container(
        &self,
        id: &str,
        image: &str,
        digest: Option<&str>,
        alias: Option<&str>,
        persistent: bool,
        ttl_seconds: Option<i64>,
        workspace_volume: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO containers
                 (id, alias, image, digest, persistent, warm, created_at, last_seen_at,
                  ttl_seconds, workspace_volume, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?7, ?8, 'creating')",
            params![
                id,
                alias,
                image,
                digest,
                persistent,
                micros(now),
                ttl_seconds,
                workspace_volume,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::AliasExists(alias.unwrap_or(id).to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Transitions a reserved container to `running` with its daemon id.
    pub fn activate_container(&self, id: &str, runtime_id: &str) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE containers SET runtime_id = ?2, status = 'running', last_seen_at = ?3
             WHERE id = ?1",
            params![id, runtime_id, micros(Utc::now())],
        )?;
        if changed == 0 {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Updates container status.
    pub fn set_container_status(&self, id: &str, status: ContainerStatus) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE containers SET status = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), micros(Utc::now())],
        )?;
        if changed == 0 {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Refreshes `last_seen_at`.
    pub fn touch_container(&self, id: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE containers SET last_seen_at = ?2 WHERE id = ?1",
            params![id, micros(Utc::now())],
        )?;
        Ok(())
    }

    /// Inserts a fully-formed row (used by boot adoption).
    pub fn insert_adopted(&self, rec: &ContainerRecord) -> Result<()> {
        self.lock().execute(
            "INSERT INTO containers
                 (id, runtime_id, alias, image, digest, persistent, warm, created_at,
                  last_seen_at, ttl_seconds, workspace_volume, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rec.id,
                rec.runtime_id,
                rec.alias,
                rec.image,
                rec.digest,
                rec.persistent,
                rec.warm,
                micros(rec.created_at),
                micros(rec.last_seen_at),
                rec.ttl_seconds,
                rec.workspace_volume,
                rec.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Point lookup by opaque id.
    pub fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.lock();
        let rec = conn
            .query_row(
                &format!("SELECT {CONTAINER_COLS} FROM containers WHERE id = ?1"),
                params![id],
                map_container,
            )
            .optional()?;
        rec.transpose()
    }

    /// Resolves an id or alias to a live (non-terminal) container.
    pub fn resolve(&self, id_or_alias: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.lock();
        let rec = conn
            .query_row(
                &format!(
                    "SELECT {CONTAINER_COLS} FROM containers
                     WHERE (id = ?1 OR alias = ?1) AND status NOT IN ('stopped', 'error')"
                ),
                params![id_or_alias],
                map_container,
            )
            .optional()?;
        rec.transpose()
    }

    /// Lists containers, optionally including terminal rows.
    pub fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerRecord>> {
        let conn = self.lock();
        let sql = if include_stopped {
            format!("SELECT {CONTAINER_COLS} FROM containers ORDER BY created_at")
        } else {
            format!(
                "SELECT {CONTAINER_COLS} FROM containers
                 WHERE status NOT IN ('stopped', 'error') ORDER BY created_at"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_container)?;
        rows.map(|r| r?).collect()
    }

    /// Deletes a container row (cascades attachments and execs).
    pub fn delete_container(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Lists transient, non-warm containers eligible for age GC: rows
    /// older than `cutoff`, or past their own `ttl_seconds` when one was
    /// set at spawn. Persistent rows are never returned.
    pub fn list_transient_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<ContainerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTAINER_COLS} FROM containers
             WHERE persistent = 0 AND warm = 0
               AND (last_seen_at < ?1
                    OR (ttl_seconds IS NOT NULL
                        AND last_seen_at + ttl_seconds * 1000000 < ?2))"
        ))?;
        let rows = stmt.query_map(params![micros(cutoff), micros(Utc::now())], map_container)?;
        rows.map(|r| r?).collect()
    }

    // =========================================================================
    // Warm Pool
    // =========================================================================

    /// Marks a container as a warm-pool member.
    pub fn set_warm(&self, id: &str, warm: bool) -> Result<()> {
        self.lock().execute(
            "UPDATE containers SET warm = ?2 WHERE id = ?1",
            params![id, warm],
        )?;
        Ok(())
    }

    /// Lists live warm-pool members.
    pub fn list_warm(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTAINER_COLS} FROM containers
             WHERE warm = 1 AND status NOT IN ('stopped', 'error')"
        ))?;
        let rows = stmt.query_map([], map_container)?;
        rows.map(|r| r?).collect()
    }

    /// Atomically claims a warm container: flips `warm=0` and applies the
    /// spawn parameters, guarded by a `warm=1` CAS predicate. Returns false
    /// when another claimant won the row.
    pub fn claim_warm(
        &self,
        id: &str,
        alias: Option<&str>,
        persistent: bool,
        ttl_seconds: Option<i64>,
    ) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = tx.execute(
            "UPDATE containers
             SET warm = 0, alias = ?2, persistent = ?3, ttl_seconds = ?4, last_seen_at = ?5
             WHERE id = ?1 AND warm = 1 AND status = 'running'",
            params![id, alias, persistent, ttl_seconds, micros(Utc::now())],
        );
        let changed = match result {
            Ok(n) => n,
            Err(e) if is_unique_violation(&e) => {
                // The requested alias is taken by another live container.
                drop(tx);
                return Err(Error::AliasExists(alias.unwrap_or(id).to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit()?;
        Ok(changed == 1)
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    /// Records a client attachment.
    pub fn insert_attachment(
        &self,
        container_id: &str,
        client_name: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO attachments (container_id, client_name, session_id, attached_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![container_id, client_name, session_id, micros(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Closes all open attachments for one container.
    pub fn detach_container(&self, container_id: &str) -> Result<usize> {
        let n = self.lock().execute(
            "UPDATE attachments SET detached_at = ?2
             WHERE container_id = ?1 AND detached_at IS NULL",
            params![container_id, micros(Utc::now())],
        )?;
        Ok(n)
    }

    /// Closes every open attachment. Used on shutdown and boot (attachments
    /// do not survive a restart).
    pub fn detach_all(&self) -> Result<usize> {
        let n = self.lock().execute(
            "UPDATE attachments SET detached_at = ?1 WHERE detached_at IS NULL",
            params![micros(Utc::now())],
        )?;
        Ok(n)
    }

    /// Counts open attachments.
    pub fn count_active_attachments(&self) -> Result<i64> {
        let conn = self.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM attachments WHERE detached_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Persists a new execution row.
    pub fn insert_exec(&self, rec: &ExecRecord) -> Result<()> {
        let argv = serde_json::to_string(&rec.argv).map_err(|e| Error::Store(e.to_string()))?;
        let env = serde_json::to_string(&rec.env).map_err(|e| Error::Store(e.to_string()))?;
        self.lock().execute(
            "INSERT INTO execs
                 (exec_id, container_id, argv, cwd, env, as_root, timeout_seconds,
                  started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rec.exec_id,
                rec.container_id,
                argv,
                rec.cwd,
                env,
                rec.as_root,
                rec.timeout_seconds,
                micros(rec.started_at),
                rec.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Point lookup by exec id.
    pub fn get_exec(&self, exec_id: &str) -> Result<Option<ExecRecord>> {
        let conn = self.lock();
        let rec = conn
            .query_row(
                &format!("SELECT {EXEC_COLS} FROM execs WHERE exec_id = ?1"),
                params![exec_id],
                map_exec,
            )
            .optional()?;
        rec.transpose()
    }

    /// Lists executions, optionally scoped to one container / live only.
    pub fn list_execs(
        &self,
        container_id: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<ExecRecord>> {
        let conn = self.lock();
        let mut sql = format!("SELECT {EXEC_COLS} FROM execs WHERE 1=1");
        if container_id.is_some() {
            sql.push_str(" AND container_id = ?1");
        }
        if active_only {
            sql.push_str(" AND status IN ('queued', 'running', 'cancelling')");
        }
        sql.push_str(" ORDER BY started_at");
        let mut stmt = conn.prepare(&sql)?;
        match container_id {
            Some(cid) => {
                let rows = stmt.query_map(params![cid], map_exec)?;
                rows.map(|r| r?).collect()
            }
            None => {
                let rows = stmt.query_map([], map_exec)?;
                rows.map(|r| r?).collect()
            }
        }
    }

    /// Validated non-terminal transition (`queued → running`,
    /// `running → cancelling`). Terminal transitions go through
    /// [`StateStore::complete_exec`].
    pub fn transition_exec(&self, exec_id: &str, next: ExecStatus) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_status(&tx, exec_id)?;
        if !current.can_transition_to(next) {
            return Err(illegal_transition(exec_id, current, next));
        }
        tx.execute(
            "UPDATE execs SET status = ?2 WHERE exec_id = ?1",
            params![exec_id, next.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Terminal transition: sets status, `ended_at`, `exit_code`, and usage
    /// together in one transaction.
    pub fn complete_exec(
        &self,
        exec_id: &str,
        status: ExecStatus,
        exit_code: i64,
        usage: &ExecUsage,
        fail_reason: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::internal(format!(
                "complete_exec called with non-terminal status '{status}'"
            )));
        }
        let usage_json = serde_json::to_string(usage).map_err(|e| Error::Store(e.to_string()))?;
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_status(&tx, exec_id)?;
        if current.is_terminal() {
            // Terminal states are absorbing; a duplicate completion (e.g.
            // cancel racing natural exit) is dropped, not an error.
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(illegal_transition(exec_id, current, status));
        }
        tx.execute(
            "UPDATE execs
             SET status = ?2, exit_code = ?3, usage = ?4, fail_reason = ?5, ended_at = ?6
             WHERE exec_id = ?1",
            params![
                exec_id,
                status.as_str(),
                exit_code,
                usage_json,
                fail_reason,
                micros(ended_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Marks every non-terminal execution `failed` with the given reason.
    /// Used by boot reconciliation (`server_restart`).
    pub fn fail_all_live_execs(&self, reason: &str) -> Result<usize> {
        let n = self.lock().execute(
            "UPDATE execs
             SET status = 'failed', fail_reason = ?1, ended_at = ?2, exit_code = -1
             WHERE status IN ('queued', 'running', 'cancelling')",
            params![reason, micros(Utc::now())],
        )?;
        Ok(n)
    }

    /// Deletes terminal executions that ended before `cutoff`. Returns the
    /// removed exec ids so callers can drop their ring buffers.
    pub fn purge_execs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT exec_id FROM execs
                 WHERE status IN ('exited', 'timed_out', 'cancelled', 'failed')
                   AND ended_at IS NOT NULL AND ended_at < ?1",
            )?;
            let rows = stmt.query_map(params![micros(cutoff)], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        tx.execute(
            "DELETE FROM execs
             WHERE status IN ('exited', 'timed_out', 'cancelled', 'failed')
               AND ended_at IS NOT NULL AND ended_at < ?1",
            params![micros(cutoff)],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    // =========================================================================
    // Idempotency
    // =========================================================================

    /// Records a key → target binding. First writer wins; a duplicate key
    /// reports the existing target instead.
    pub fn put_idempotency(
        &self,
        key: &str,
        kind: IdempotencyKind,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO idempotency_keys (key, kind, target_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, kind.as_str(), target_id, micros(now)],
        );
        match result {
            Ok(_) => Ok(target_id.to_string()),
            Err(e) if is_unique_violation(&e) => {
                let existing: String = conn.query_row(
                    "SELECT target_id FROM idempotency_keys WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Looks up an unexpired key of the given kind.
    pub fn get_idempotency(
        &self,
        key: &str,
        kind: IdempotencyKind,
        not_before: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let conn = self.lock();
        let target = conn
            .query_row(
                "SELECT target_id FROM idempotency_keys
                 WHERE key = ?1 AND kind = ?2 AND created_at >= ?3",
                params![key, kind.as_str(), micros(not_before)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(target)
    }

    /// Removes keys created before `cutoff`.
    pub fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let n = self.lock().execute(
            "DELETE FROM idempotency_keys WHERE created_at < ?1",
            params![micros(cutoff)],
        )?;
        Ok(n)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Reclaims free pages.
    pub fn vacuum(&self) -> Result<()> {
        self.lock().execute_batch("VACUUM")?;
        Ok(())
    }

    /// Counts containers by live status, for the status tool.
    pub fn count_by_status(&self, status: ContainerStatus) -> Result<i64> {
        let conn = self.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM containers WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

const CONTAINER_COLS: &str = "id, runtime_id, alias, image, digest, persistent, warm, \
     created_at, last_seen_at, ttl_seconds, workspace_volume, status";

const EXEC_COLS: &str = "exec_id, container_id, argv, cwd, env, as_root, timeout_seconds, \
     started_at, ended_at, exit_code, usage, status, fail_reason";

fn map_container(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ContainerRecord>> {
    let status: String = row.get(11)?;
    let created: i64 = row.get(7)?;
    let last_seen: i64 = row.get(8)?;
    Ok((|| {
        Ok(ContainerRecord {
            id: row.get(0)?,
            runtime_id: row.get(1)?,
            alias: row.get(2)?,
            image: row.get(3)?,
            digest: row.get(4)?,
            persistent: row.get(5)?,
            warm: row.get(6)?,
            created_at: from_micros(created),
            last_seen_at: from_micros(last_seen),
            ttl_seconds: row.get(9)?,
            workspace_volume: row.get(10)?,
            status: ContainerStatus::parse(&status)?,
        })
    })())
}

fn map_exec(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ExecRecord>> {
    let argv: String = row.get(2)?;
    let env: String = row.get(4)?;
    let started: i64 = row.get(7)?;
    let ended: Option<i64> = row.get(8)?;
    let usage: Option<String> = row.get(10)?;
    let status: String = row.get(11)?;
    Ok((|| {
        Ok(ExecRecord {
            exec_id: row.get(0)?,
            container_id: row.get(1)?,
            argv: serde_json::from_str(&argv).map_err(|e| Error::Store(e.to_string()))?,
            cwd: row.get(3)?,
            env: serde_json::from_str(&env).map_err(|e| Error::Store(e.to_string()))?,
            as_root: row.get(5)?,
            timeout_seconds: row.get(6)?,
            started_at: from_micros(started),
            ended_at: ended.map(from_micros),
            exit_code: row.get(9)?,
            usage: usage
                .map(|u| serde_json::from_str(&u).map_err(|e| Error::Store(e.to_string())))
                .transpose()?,
            status: ExecStatus::parse(&status)?,
            fail_reason: row.get(12)?,
        })
    })())
}

fn current_status(tx: &rusqlite::Transaction<'_>, exec_id: &str) -> Result<ExecStatus> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM execs WHERE exec_id = ?1",
            params![exec_id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        Some(s) => ExecStatus::parse(&s),
        None => Err(Error::ExecNotFound(exec_id.to_string())),
    }
}

fn illegal_transition(exec_id: &str, from: ExecStatus, to: ExecStatus) -> Error {
    if from.is_terminal() {
        Error::ExecTerminal {
            exec_id: exec_id.to_string(),
            status: from.to_string(),
        }
    } else {
        Error::internal(format!(
            "illegal exec transition {from} -> {to} for '{exec_id}'"
        ))
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(us).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn store_with_container(id: &str, alias: Option<&str>) -> StateStore {
        let store = StateStore::in_memory().unwrap();
        store
            .reserve_container(id, "docker.io/library/python:3.11-slim", None, alias,
                false, Some(3600), Some("devbench_transient_x"), Utc::now())
            .unwrap();
        store
    }

    fn running_exec(store: &StateStore, exec_id: &str, container_id: &str) {
        store
            .insert_exec(&ExecRecord {
                exec_id: exec_id.into(),
                container_id: container_id.into(),
                argv: vec!["echo".into(), "hi".into()],
                cwd: "/workspace".into(),
                env: HashMap::new(),
                as_root: false,
                timeout_seconds: 600,
                started_at: Utc::now(),
                ended_at: None,
                exit_code: None,
                usage: None,
                status: ExecStatus::Running,
                fail_reason: None,
            })
            .unwrap();
    }

    #[test]
    fn test_alias_unique_among_live() {
        let store = store_with_container("c_1", Some("w1"));
        let err = store
            .reserve_container("c_2", "docker.io/library/alpine", None, Some("w1"),
                false, None, None, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "already_exists");

        // Terminal rows release the alias.
        store.set_container_status("c_1", ContainerStatus::Stopped).unwrap();
        store
            .reserve_container("c_3", "docker.io/library/alpine", None, Some("w1"),
                false, None, None, Utc::now())
            .unwrap();
    }

    #[test]
    fn test_resolve_by_id_and_alias() {
        let store = store_with_container("c_1", Some("w1"));
        store.activate_container("c_1", "deadbeef").unwrap();
        assert_eq!(store.resolve("c_1").unwrap().unwrap().id, "c_1");
        assert_eq!(store.resolve("w1").unwrap().unwrap().id, "c_1");
        assert!(store.resolve("nope").unwrap().is_none());

        store.set_container_status("c_1", ContainerStatus::Stopped).unwrap();
        assert!(store.resolve("c_1").unwrap().is_none(), "terminal rows do not resolve");
    }

    #[test]
    fn test_activate_sets_runtime_id_and_status() {
        let store = store_with_container("c_1", None);
        store.activate_container("c_1", "deadbeef").unwrap();
        let rec = store.get_container("c_1").unwrap().unwrap();
        assert_eq!(rec.runtime_id.as_deref(), Some("deadbeef"));
        assert_eq!(rec.status, ContainerStatus::Running);
    }

    #[test]
    fn test_exec_state_machine() {
        let store = store_with_container("c_1", None);
        running_exec(&store, "e_1", "c_1");

        // running → cancelling is legal.
        store.transition_exec("e_1", ExecStatus::Cancelling).unwrap();
        // cancelling → running is not.
        assert!(store.transition_exec("e_1", ExecStatus::Running).is_err());

        // cancelling → cancelled terminal, atomic with exit/usage/ended_at.
        store
            .complete_exec("e_1", ExecStatus::Cancelled, 137, &ExecUsage::default(), None, Utc::now())
            .unwrap();
        let rec = store.get_exec("e_1").unwrap().unwrap();
        assert_eq!(rec.status, ExecStatus::Cancelled);
        assert_eq!(rec.exit_code, Some(137));
        assert!(rec.ended_at.is_some());

        // Terminal states absorb duplicate completions silently.
        store
            .complete_exec("e_1", ExecStatus::Exited, 0, &ExecUsage::default(), None, Utc::now())
            .unwrap();
        assert_eq!(store.get_exec("e_1").unwrap().unwrap().exit_code, Some(137));

        // ...but reject live transitions out of a terminal state.
        let err = store.transition_exec("e_1", ExecStatus::Cancelling).unwrap_err();
        assert_eq!(err.code(), "cancelled");
    }

    #[test]
    fn test_usage_round_trip() {
        let store = store_with_container("c_1", None);
        running_exec(&store, "e_1", "c_1");
        let usage = ExecUsage {
            cpu_ms: 42,
            mem_peak_bytes: 1024,
            wall_ms: 100,
            timed_out: true,
        };
        store
            .complete_exec("e_1", ExecStatus::TimedOut, 124, &usage, None, Utc::now())
            .unwrap();
        assert_eq!(store.get_exec("e_1").unwrap().unwrap().usage, Some(usage));
    }

    #[test]
    fn test_idempotency_keys() {
        let store = StateStore::in_memory().unwrap();
        let now = Utc::now();
        let bound = store
            .put_idempotency("k-42", IdempotencyKind::Exec, "e_7", now)
            .unwrap();
        assert_eq!(bound, "e_7");

        // Same key returns the first binding.
        let again = store
            .put_idempotency("k-42", IdempotencyKind::Exec, "e_8", now)
            .unwrap();
        assert_eq!(again, "e_7");

        // Unexpired lookup hits; expired lookup misses.
        let not_before = now - ChronoDuration::hours(24);
        assert_eq!(
            store.get_idempotency("k-42", IdempotencyKind::Exec, not_before).unwrap(),
            Some("e_7".to_string())
        );
        assert_eq!(
            store
                .get_idempotency("k-42", IdempotencyKind::Exec, now + ChronoDuration::seconds(1))
                .unwrap(),
            None
        );

        // Kinds are disjoint.
        assert_eq!(
            store.get_idempotency("k-42", IdempotencyKind::Spawn, not_before).unwrap(),
            None
        );

        let purged = store.purge_idempotency_before(now + ChronoDuration::seconds(1)).unwrap();
        assert_eq!(purged, 1);
    }

    #[test]
    fn test_warm_claim_cas() {
        let store = store_with_container("c_1", None);
        store.activate_container("c_1", "deadbeef").unwrap();
        store.set_warm("c_1", true).unwrap();

        assert!(store.claim_warm("c_1", Some("w1"), true, None).unwrap());
        // Second claim loses the CAS.
        assert!(!store.claim_warm("c_1", Some("w2"), false, None).unwrap());

        let rec = store.get_container("c_1").unwrap().unwrap();
        assert!(!rec.warm);
        assert!(rec.persistent);
        assert_eq!(rec.alias.as_deref(), Some("w1"));
    }

    #[test]
    fn test_fail_all_live_execs() {
        let store = store_with_container("c_1", None);
        running_exec(&store, "e_1", "c_1");
        running_exec(&store, "e_2", "c_1");
        store
            .complete_exec("e_2", ExecStatus::Exited, 0, &ExecUsage::default(), None, Utc::now())
            .unwrap();

        let failed = store.fail_all_live_execs("server_restart").unwrap();
        assert_eq!(failed, 1);
        let rec = store.get_exec("e_1").unwrap().unwrap();
        assert_eq!(rec.status, ExecStatus::Failed);
        assert_eq!(rec.fail_reason.as_deref(), Some("server_restart"));
        // The already-terminal exec is untouched.
        assert_eq!(store.get_exec("e_2").unwrap().unwrap().status, ExecStatus::Exited);
    }

    #[test]
    fn test_purge_execs_before() {
        let store = store_with_container("c_1", None);
        running_exec(&store, "e_1", "c_1");
        store
            .complete_exec("e_1", ExecStatus::Exited, 0, &ExecUsage::default(), None, Utc::now())
            .unwrap();
        let purged = store
            .purge_execs_before(Utc::now() + ChronoDuration::seconds(1))
            .unwrap();
        assert_eq!(purged, vec!["e_1".to_string()]);
        assert!(store.get_exec("e_1").unwrap().is_none());
    }

    #[test]
    fn test_attachments() {
        let store = store_with_container("c_1", None);
        store
            .insert_attachment("c_1", "agent", "sess-1", Utc::now())
            .unwrap();
        store
            .insert_attachment("c_1", "agent", "sess-2", Utc::now())
            .unwrap();
        assert_eq!(store.count_active_attachments().unwrap(), 2);
        assert_eq!(store.detach_container("c_1").unwrap(), 2);
        assert_eq!(store.count_active_attachments().unwrap(), 0);
    }

    #[test]
    fn test_transient_gc_listing() {
        let store = store_with_container("c_1", None);
        let cutoff = Utc::now() + ChronoDuration::seconds(1);
        let old = store.list_transient_older_than(cutoff).unwrap();
        assert_eq!(old.len(), 1);

        // Persistent rows are never eligible.
        store
            .reserve_container("c_2", "docker.io/library/alpine", None, None,
                true, None, None, Utc::now())
            .unwrap();
        let old = store.list_transient_older_than(cutoff).unwrap();
        assert_eq!(old.iter().filter(|c| c.id == "c_2").count(), 0);
    }
}
