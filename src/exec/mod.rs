//! # Execution Engine
//!
//! Runs commands inside containers concurrently and streams their output
//! through bounded ring buffers with cursor-addressable replay.
//!
//! ## Shape
//!
//! ```text
//!  exec_start ──► slot (semaphore, N per container)
//!                   │
//!                   ▼
//!            runtime exec_run ──► driver task ──► ring buffer ◄── exec_poll
//!                                   │  ▲
//!                        timeout ───┘  └─── exec_cancel
//! ```
//!
//! - `exec_start` returns once the execution is persisted and its driver is
//!   scheduled, never waiting for completion. A daemon failure at start
//!   surfaces immediately and leaves no persisted row.
//! - The per-container slot is acquired before the daemon exec is created
//!   and released on the terminal transition, so at most N executions per
//!   container are ever `running`.
//! - Timeout and cancellation share one escalation path: graceful signal,
//!   bounded grace, force kill, bounded abandon.
//! - The terminal store update (status + exit code + usage + ended_at) is
//!   one transaction; the terminal frame is appended after it commits.
//!
//! Ring buffers live for the execution plus a retention window; they are
//! process memory and do not survive restarts (polling a pre-restart exec
//! returns `not_found`).

pub mod ring;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::Audit;
use crate::constants::{EXEC_KILL_GRACE, IDEMPOTENCY_TTL, POLL_RESPONSE_CAP_BYTES};
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ExecSignal, ExecSpec, RunningExec};
use crate::security::SecurityDefaults;
use crate::store::{
    ContainerRecord, ExecRecord, ExecStatus, ExecUsage, IdempotencyKind, StateStore,
};

use self::ring::{PollResult, RingBuffer};

/// Parameters for starting one execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub as_root: bool,
    pub timeout: Option<Duration>,
    pub idempotency_key: Option<String>,
}

/// Live state of one execution held by the engine.
struct ExecHandle {
    ring: Mutex<RingBuffer>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct EngineState {
    semaphores: HashMap<String, Arc<Semaphore>>,
    execs: HashMap<String, Arc<ExecHandle>>,
}

/// Concurrency-limited, ring-buffered command execution.
pub struct ExecEngine {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    audit: Arc<Audit>,
    security: SecurityDefaults,
    slots_per_container: usize,
    output_budget: usize,
    default_timeout: Duration,
    workspace_mount: String,
    state: Mutex<EngineState>,
    active: Arc<AtomicUsize>,
}

impl ExecEngine {
    pub fn new(
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        audit: Arc<Audit>,
        slots_per_container: usize,
        output_budget: usize,
        default_timeout: Duration,
        workspace_mount: String,
    ) -> Self {
        Self {
            store,
            runtime,
            audit,
            security: SecurityDefaults::default(),
            slots_per_container,
            output_budget,
            default_timeout,
            workspace_mount,
            state: Mutex::new(EngineState::default()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    // =========================================================================
    // exec_start
    // =========================================================================

    /// Starts an execution in `container`. Returns the exec id once the
    /// row is persisted and the driver task is scheduled.
    pub async fn exec_start(&self, container: &ContainerRecord, req: ExecRequest) -> Result<String> {
        if let Some(key) = &req.idempotency_key {
            let not_before = Utc::now()
                - chrono::Duration::from_std(IDEMPOTENCY_TTL)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
            if let Some(existing) =
                self.store
                    .get_idempotency(key, IdempotencyKind::Exec, not_before)?
            {
                debug!(%key, exec_id = %existing, "idempotent exec replay");
                return Ok(existing);
            }
        }

        let runtime_id = container
            .runtime_id
            .clone()
            .ok_or_else(|| Error::ContainerNotFound(container.id.clone()))?;

        // Non-blocking slot acquisition: at capacity the request fails
        // instead of queueing.
        let semaphore = self.semaphore_for(&container.id);
        let permit = semaphore
            .try_acquire_owned()
            .map_err(|_| Error::ConcurrencyLimit {
                container: container.id.clone(),
                limit: self.slots_per_container,
            })?;

        let timeout = req.timeout.unwrap_or(self.default_timeout);
        let spec = ExecSpec {
            argv: req.argv.clone(),
            cwd: req
                .cwd
                .clone()
                .unwrap_or_else(|| self.workspace_mount.clone()),
            env: req.env.clone(),
            user: self.security.exec_user(req.as_root),
        };

        // Daemon-side create+attach happens before anything is persisted:
        // a daemon 500 here leaves neither an orphan exec nor a row.
        let running = self.runtime.exec_run(&runtime_id, &spec).await?;

        let exec_id = format!("e_{}", uuid::Uuid::now_v7().simple());
        let started_at = Utc::now();
        self.store.insert_exec(&ExecRecord {
            exec_id: exec_id.clone(),
            container_id: container.id.clone(),
            argv: req.argv.clone(),
            cwd: spec.cwd.clone(),
            env: req.env.clone(),
            as_root: req.as_root,
            timeout_seconds: timeout.as_secs() as i64,
            started_at,
            ended_at: None,
            exit_code: None,
            usage: None,
            status: ExecStatus::Running,
            fail_reason: None,
        })?;

        if let Some(key) = &req.idempotency_key {
            let bound = self
                .store
                .put_idempotency(key, IdempotencyKind::Exec, &exec_id, started_at)?;
            if bound != exec_id {
                // A concurrent identical request won the key; tear ours down
                // and return the winner.
                if let Some(pid) = running.pid {
                    let _ = self
                        .runtime
                        .signal_exec(&runtime_id, pid, ExecSignal::Kill)
                        .await;
                }
                self.store.complete_exec(
                    &exec_id,
                    ExecStatus::Cancelled,
                    -1,
                    &ExecUsage::default(),
                    Some("superseded_by_idempotent_twin"),
                    Utc::now(),
                )?;
                return Ok(bound);
            }
        }

        let handle = Arc::new(ExecHandle {
            ring: Mutex::new(RingBuffer::new(self.output_budget)),
            cancel: CancellationToken::new(),
        });
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .execs
            .insert(exec_id.clone(), handle.clone());
        self.active.fetch_add(1, Ordering::SeqCst);

        self.audit
            .exec_started(&exec_id, &container.id, &req.argv, req.as_root);

        let driver = Driver {
            store: self.store.clone(),
            runtime: self.runtime.clone(),
            audit: self.audit.clone(),
            active: self.active.clone(),
            exec_id: exec_id.clone(),
            runtime_id,
            handle,
            timeout,
        };
        tokio::spawn(driver.run(running, permit));

        Ok(exec_id)
    }

    fn semaphore_for(&self, container_id: &str) -> Arc<Semaphore> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .semaphores
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.slots_per_container)))
            .clone()
    }

    // =========================================================================
    // exec_poll
    // =========================================================================

    /// Polls frames after `after_seq`.
    pub fn exec_poll(&self, exec_id: &str, after_seq: u64) -> Result<PollResult> {
        let handle = self.handle(exec_id)?;
        let ring = handle.ring.lock().unwrap_or_else(|p| p.into_inner());
        Ok(ring.poll(after_seq, POLL_RESPONSE_CAP_BYTES))
    }

    // =========================================================================
    // exec_cancel
    // =========================================================================

    /// Requests cancellation. Safe to repeat: a terminal execution reports
    /// its terminal status and nothing else happens.
    pub fn exec_cancel(&self, exec_id: &str) -> Result<ExecStatus> {
        let record = self
            .store
            .get_exec(exec_id)?
            .ok_or_else(|| Error::ExecNotFound(exec_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }
        if record.status == ExecStatus::Cancelling {
            return Ok(ExecStatus::Cancelling);
        }

        match self.store.transition_exec(exec_id, ExecStatus::Cancelling) {
            Ok(()) => {}
            // Lost the race against natural completion; report the terminal
            // status the execution actually reached.
            Err(Error::ExecTerminal { .. }) => {
                let rec = self
                    .store
                    .get_exec(exec_id)?
                    .ok_or_else(|| Error::ExecNotFound(exec_id.to_string()))?;
                return Ok(rec.status);
            }
            Err(e) => return Err(e),
        }
        self.audit.exec_cancel_requested(exec_id);
        if let Ok(handle) = self.handle(exec_id) {
            handle.cancel.cancel();
        }
        Ok(ExecStatus::Cancelling)
    }

    /// Cancels every live execution of one container (used by `kill`).
    pub fn cancel_container(&self, container_id: &str) -> Result<usize> {
        let live = self.store.list_execs(Some(container_id), true)?;
        let mut cancelled = 0;
        for exec in live {
            if self.exec_cancel(&exec.exec_id).is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    // =========================================================================
    // Shutdown / Maintenance Support
    // =========================================================================

    /// Count of executions whose driver has not reached a terminal state.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until every execution is terminal or `deadline` passes.
    /// Returns true when fully drained.
    pub async fn drain(&self, deadline: Instant) -> bool {
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Cancels every live execution.
    pub fn cancel_all(&self) {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for handle in state.execs.values() {
            handle.cancel.cancel();
        }
    }

    /// Appends a shutdown control frame to every still-open ring.
    pub fn seal_all(&self) {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for handle in state.execs.values() {
            let mut ring = handle.ring.lock().unwrap_or_else(|p| p.into_inner());
            ring.push_shutdown();
        }
    }

    /// Drops retained ring buffers for purged executions.
    pub fn drop_buffers(&self, exec_ids: &[String]) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for id in exec_ids {
            state.execs.remove(id);
        }
    }

    /// Releases per-container engine state after a container is killed.
    pub fn forget_container(&self, container_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.semaphores.remove(container_id);
    }

    fn handle(&self, exec_id: &str) -> Result<Arc<ExecHandle>> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .execs
            .get(exec_id)
            .cloned()
            .ok_or_else(|| Error::ExecNotFound(exec_id.to_string()))
    }
}

// =============================================================================
// Driver Task
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Natural,
    TimedOut,
    Cancelled,
}

struct Driver {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    audit: Arc<Audit>,
    active: Arc<AtomicUsize>,
    exec_id: String,
    runtime_id: String,
    handle: Arc<ExecHandle>,
    timeout: Duration,
}

impl Driver {
    async fn run(self, running: RunningExec, permit: OwnedSemaphorePermit) {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let pid = running.pid;
        let mut chunks = running.chunks;
        let mut outcome = Outcome::Natural;
        let mut kill_at: Option<Instant> = None;
        let mut abandon_at: Option<Instant> = None;

        loop {
            tokio::select! {
                maybe = chunks.recv() => match maybe {
                    Some(chunk) => {
                        self.audit.exec_output(chunk.data.len());
                        let mut ring = self.handle.ring.lock().unwrap_or_else(|p| p.into_inner());
                        ring.push_data(chunk.stream, chunk.data);
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if outcome == Outcome::Natural => {
                    outcome = Outcome::TimedOut;
                    kill_at = Some(Instant::now() + EXEC_KILL_GRACE);
                    self.signal(pid, ExecSignal::Term).await;
                },
                _ = self.handle.cancel.cancelled(), if outcome == Outcome::Natural => {
                    outcome = Outcome::Cancelled;
                    kill_at = Some(Instant::now() + EXEC_KILL_GRACE);
                    self.signal(pid, ExecSignal::Term).await;
                },
                _ = maybe_sleep(kill_at), if kill_at.is_some() => {
                    kill_at = None;
                    abandon_at = Some(Instant::now() + EXEC_KILL_GRACE);
                    self.signal(pid, ExecSignal::Kill).await;
                },
                _ = maybe_sleep(abandon_at), if abandon_at.is_some() => {
                    warn!(exec_id = %self.exec_id, "output stream did not close after kill; abandoning");
                    break;
                },
            }
        }

        // Streams closed (or abandoned); collect the exit code with a
        // bounded wait so a wedged backend cannot hold the slot forever.
        let exit_code = match tokio::time::timeout(EXEC_KILL_GRACE, running.exit).await {
            Ok(Ok(code)) => Some(code),
            Ok(Err(_)) | Err(_) => None,
        };

        let wall_ms = started.elapsed().as_millis() as u64;
        let stats = self
            .runtime
            .stats_snapshot(&self.runtime_id)
            .await
            .unwrap_or_default();
        let usage = ExecUsage {
            cpu_ms: stats.cpu_ns / 1_000_000,
            mem_peak_bytes: stats.mem_peak_bytes,
            wall_ms,
            timed_out: outcome == Outcome::TimedOut,
        };

        let (status, code, reason) = match (outcome, exit_code) {
            (Outcome::TimedOut, code) => (ExecStatus::TimedOut, code.unwrap_or(-1), None),
            (Outcome::Cancelled, code) => (ExecStatus::Cancelled, code.unwrap_or(-1), None),
            (Outcome::Natural, Some(code)) => (ExecStatus::Exited, code, None),
            (Outcome::Natural, None) => (
                ExecStatus::Failed,
                -1,
                Some("runtime lost track of the exec"),
            ),
        };

        if let Err(e) =
            self.store
                .complete_exec(&self.exec_id, status, code, &usage, reason, Utc::now())
        {
            warn!(exec_id = %self.exec_id, error = %e, "terminal transition failed");
        }
        {
            let mut ring = self.handle.ring.lock().unwrap_or_else(|p| p.into_inner());
            ring.push_exit(code, usage.clone());
        }
        self.audit.exec_completed(&self.exec_id, status, code, wall_ms);

        drop(permit);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn signal(&self, pid: Option<i64>, signal: ExecSignal) {
        let Some(pid) = pid else {
            debug!(exec_id = %self.exec_id, "no pid; signal skipped");
            return;
        };
        if let Err(e) = self.runtime.signal_exec(&self.runtime_id, pid, signal).await {
            warn!(exec_id = %self.exec_id, ?signal, error = %e, "signal delivery failed");
        }
    }
}

/// Sleeps until the instant when present; pending forever otherwise (the
/// guarding `if` on the select branch keeps this from being polled when
/// `None`).
async fn maybe_sleep(at: Option<Instant>) {
    match at {
        Some(instant) => sleep_until(instant).await,
        None => std::future::pending().await,
    }
}
