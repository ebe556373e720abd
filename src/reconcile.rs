//! # Reconciler & Maintenance
//!
//! Brings the state store and the daemon back into agreement after any
//! disruption, and runs periodic housekeeping.
//!
//! ## Boot Reconciliation
//!
//! Runs before the server accepts work:
//!
//! 1. All open attachments are closed (sessions do not survive a restart).
//! 2. Executions that were live at last persist become `failed` with
//!    reason `server_restart`. Their ring buffers were process memory, so
//!    a later poll returns `not_found`; the row keeps the explanation.
//! 3. Every daemon container carrying the namespace label is matched
//!    against the store: known ids get their status adopted; unknown but
//!    recent ones get a row created from labels and mounts; unknown
//!    transients older than the GC window are removed daemon-side.
//! 4. Store rows whose daemon object is gone become `stopped` (`error`
//!    for rows that never finished creating).
//!
//! Reconciliation is idempotent - a second run with no intervening events
//! changes nothing - and a dead daemon makes it a logged no-op, retried on
//! the next trigger.
//!
//! ## Periodic Maintenance
//!
//! Hourly (and on demand via the `gc` tool): drop aged transient rows,
//! purge terminal executions past retention (with their ring buffers),
//! expire idempotency keys, refresh drift, vacuum.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::Audit;
use crate::config::Config;
use crate::constants::{
    EXEC_RETENTION, IDEMPOTENCY_TTL, LABEL_ALIAS, LABEL_CONTAINER_ID, LABEL_NAMESPACE,
    MAINTENANCE_INTERVAL, MAINTENANCE_RETRY, PERSIST_VOLUME_PREFIX,
};
use crate::error::{Error, Result};
use crate::exec::ExecEngine;
use crate::runtime::{ContainerRuntime, RuntimeContainer, RuntimeStatus};
use crate::store::{ContainerRecord, ContainerStatus, StateStore};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Labeled containers the daemon reported.
    pub discovered: usize,
    /// Unknown containers adopted into the store.
    pub adopted: usize,
    /// Store rows marked stopped/error because the daemon object is gone.
    pub cleaned_up: usize,
    /// Aged orphan transients removed daemon-side.
    pub removed: usize,
    /// Executions failed with `server_restart`.
    pub execs_failed: usize,
    /// Non-fatal errors along the way.
    pub errors: usize,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MaintenanceStats {
    pub transient_rows_purged: usize,
    pub execs_purged: usize,
    pub idempotency_keys_purged: usize,
    pub drift_corrections: usize,
    pub errors: usize,
}

/// Store/daemon reconciliation and periodic maintenance.
pub struct Reconciler {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    engine: Arc<ExecEngine>,
    audit: Arc<Audit>,
    transient_gc_days: u32,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        config: &Config,
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        engine: Arc<ExecEngine>,
        audit: Arc<Audit>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            runtime,
            engine,
            audit,
            transient_gc_days: config.transient_gc_days,
            shutdown,
        }
    }

    // =========================================================================
    // Boot
    // =========================================================================

    /// Full boot recovery. Must complete before the server accepts work.
    pub async fn boot(&self) -> Result<ReconcileStats> {
        let detached = self.store.detach_all()?;
        if detached > 0 {
            info!(detached, "closed attachments from previous run");
        }
        let execs_failed = self.store.fail_all_live_execs("server_restart")?;
        if execs_failed > 0 {
            info!(execs_failed, "failed executions interrupted by restart");
        }
        let mut stats = self.reconcile().await;
        stats.execs_failed = execs_failed;
        Ok(stats)
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// One reconciliation pass. A dead daemon is non-fatal: the pass logs,
    /// counts an error, and the next trigger retries.
    pub async fn reconcile(&self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        let daemon_side = match self.runtime.list_labeled(LABEL_NAMESPACE).await {
            Ok(list) => list,
            Err(e) if e.is_runtime_unavailable() => {
                warn!(error = %e, "daemon unreachable; reconciliation skipped");
                stats.errors += 1;
                return stats;
            }
            Err(e) => {
                warn!(error = %e, "listing labeled containers failed");
                stats.errors += 1;
                return stats;
            }
        };
        stats.discovered = daemon_side.len();

        let rows = match self.store.list_containers(true) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "listing store rows failed");
                stats.errors += 1;
                return stats;
            }
        };
        let known_runtime_ids: std::collections::HashSet<&str> = rows
            .iter()
            .filter_map(|r| r.runtime_id.as_deref())
            .collect();

        for daemon in &daemon_side {
            if known_runtime_ids.contains(daemon.runtime_id.as_str()) {
                if let Err(e) = self.adopt_status(&rows, daemon) {
                    warn!(runtime_id = %daemon.runtime_id, error = %e, "status adoption failed");
                    stats.errors += 1;
                }
            } else {
                match self.adopt_or_remove(daemon).await {
                    Ok(Adoption::Adopted) => stats.adopted += 1,
                    Ok(Adoption::Removed) => stats.removed += 1,
                    Ok(Adoption::Skipped) => {}
                    Err(e) => {
                        warn!(runtime_id = %daemon.runtime_id, error = %e, "adoption failed");
                        stats.errors += 1;
                    }
                }
            }
        }

        // Store rows with no daemon object behind them.
        let daemon_ids: std::collections::HashSet<&str> =
            daemon_side.iter().map(|c| c.runtime_id.as_str()).collect();
        for row in &rows {
            if row.status.is_terminal() {
                continue;
            }
            let gone = match &row.runtime_id {
                Some(rid) => !daemon_ids.contains(rid.as_str()),
                None => true,
            };
            if gone {
                let target = if row.status == ContainerStatus::Creating {
                    ContainerStatus::Error
                } else {
                    ContainerStatus::Stopped
                };
                match self.store.set_container_status(&row.id, target) {
                    Ok(()) => stats.cleaned_up += 1,
                    Err(e) => {
                        warn!(container_id = %row.id, error = %e, "marking missing container failed");
                        stats.errors += 1;
                    }
                }
            }
        }

        self.audit
            .reconcile_completed(stats.adopted, stats.cleaned_up, stats.removed);
        info!(?stats, "reconciliation completed");
        stats
    }

    fn adopt_status(&self, rows: &[ContainerRecord], daemon: &RuntimeContainer) -> Result<()> {
        let row = rows
            .iter()
            .find(|r| r.runtime_id.as_deref() == Some(daemon.runtime_id.as_str()))
            .ok_or_else(|| Error::internal("adopt_status row lookup"))?;
        let target = match daemon.status {
            RuntimeStatus::Running => ContainerStatus::Running,
            RuntimeStatus::Created | RuntimeStatus::Exited => ContainerStatus::Stopped,
            RuntimeStatus::Unknown => ContainerStatus::Error,
        };
        if row.status != target && !row.status.is_terminal() {
            self.store.set_container_status(&row.id, target)?;
            debug!(container_id = %row.id, from = %row.status, to = %target, "status adopted");
        } else {
            self.store.touch_container(&row.id)?;
        }
        Ok(())
    }

    async fn adopt_or_remove(&self, daemon: &RuntimeContainer) -> Result<Adoption> {
        let Some(container_id) = daemon.label(LABEL_CONTAINER_ID) else {
            warn!(runtime_id = %daemon.runtime_id, "labeled container missing id label; skipping");
            return Ok(Adoption::Skipped);
        };

        let workspace_volume = daemon.volumes.first().map(|(name, _)| name.clone());
        let persistent = workspace_volume
            .as_deref()
            .map(|v| v.starts_with(PERSIST_VOLUME_PREFIX))
            .unwrap_or(false);
        let created_at = daemon.created_at.unwrap_or_else(Utc::now);
        let age_cutoff = Utc::now() - ChronoDuration::days(i64::from(self.transient_gc_days));

        if !persistent && created_at < age_cutoff {
            info!(runtime_id = %daemon.runtime_id, "removing aged orphan transient");
            self.runtime
                .remove_container(&daemon.runtime_id, true, false)
                .await?;
            if let Some(volume) = &workspace_volume {
                let _ = self.runtime.remove_volume(volume).await;
            }
            return Ok(Adoption::Removed);
        }

        let status = match daemon.status {
            RuntimeStatus::Running => ContainerStatus::Running,
            RuntimeStatus::Created | RuntimeStatus::Exited => ContainerStatus::Stopped,
            RuntimeStatus::Unknown => ContainerStatus::Error,
        };
        self.store.insert_adopted(&ContainerRecord {
            id: container_id.to_string(),
            runtime_id: Some(daemon.runtime_id.clone()),
            alias: daemon.label(LABEL_ALIAS).map(str::to_string),
            image: daemon.image.clone(),
            digest: None,
            persistent,
            warm: daemon.label(crate::constants::LABEL_WARM) == Some("true"),
            created_at,
            last_seen_at: Utc::now(),
            ttl_seconds: None,
            workspace_volume,
            status,
        })?;
        info!(container_id, runtime_id = %daemon.runtime_id, "container adopted");
        Ok(Adoption::Adopted)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// One maintenance pass: retention purges, drift sync, vacuum.
    pub async fn maintenance(&self) -> MaintenanceStats {
        let mut stats = MaintenanceStats::default();
        let now = Utc::now();

        // Aged transient rows (never persistent ones - invariant I3).
        let cutoff = now - ChronoDuration::days(i64::from(self.transient_gc_days));
        match self.store.list_transient_older_than(cutoff) {
            Ok(aged) => {
                for row in aged {
                    if row.status == ContainerStatus::Running {
                        continue;
                    }
                    if let Some(runtime_id) = &row.runtime_id {
                        let _ = self.runtime.remove_container(runtime_id, true, false).await;
                    }
                    if let Some(volume) = &row.workspace_volume {
                        let _ = self.runtime.remove_volume(volume).await;
                    }
                    match self.store.delete_container(&row.id) {
                        Ok(()) => stats.transient_rows_purged += 1,
                        Err(e) => {
                            warn!(container_id = %row.id, error = %e, "transient purge failed");
                            stats.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "aged-transient listing failed");
                stats.errors += 1;
            }
        }

        // Terminal executions past retention, ring buffers included.
        let exec_cutoff = now
            - ChronoDuration::from_std(EXEC_RETENTION).unwrap_or_else(|_| ChronoDuration::hours(24));
        match self.store.purge_execs_before(exec_cutoff) {
            Ok(purged) => {
                stats.execs_purged = purged.len();
                self.engine.drop_buffers(&purged);
            }
            Err(e) => {
                warn!(error = %e, "exec purge failed");
                stats.errors += 1;
            }
        }

        // Expired idempotency keys.
        let key_cutoff = now
            - ChronoDuration::from_std(IDEMPOTENCY_TTL).unwrap_or_else(|_| ChronoDuration::hours(24));
        match self.store.purge_idempotency_before(key_cutoff) {
            Ok(n) => stats.idempotency_keys_purged = n,
            Err(e) => {
                warn!(error = %e, "idempotency purge failed");
                stats.errors += 1;
            }
        }

        stats.drift_corrections = self.sync_drift().await;

        if let Err(e) = self.store.vacuum() {
            warn!(error = %e, "vacuum failed");
            stats.errors += 1;
        }

        self.audit
            .gc_completed(stats.transient_rows_purged, stats.execs_purged);
        info!(?stats, "maintenance completed");
        stats
    }

    /// Verifies live rows against daemon inspection, refreshing
    /// `last_seen_at` and correcting drifted statuses.
    async fn sync_drift(&self) -> usize {
        let rows = match self.store.list_containers(false) {
            Ok(rows) => rows,
            Err(_) => return 0,
        };
        let mut corrections = 0;
        for row in rows {
            let Some(runtime_id) = &row.runtime_id else {
                continue;
            };
            match self.runtime.inspect_container(runtime_id).await {
                Ok(daemon) => {
                    let expected = match daemon.status {
                        RuntimeStatus::Running => ContainerStatus::Running,
                        _ => ContainerStatus::Stopped,
                    };
                    if row.status != expected {
                        if self.store.set_container_status(&row.id, expected).is_ok() {
                            corrections += 1;
                        }
                    } else {
                        let _ = self.store.touch_container(&row.id);
                    }
                }
                Err(Error::ContainerNotFound(_)) => {
                    if self
                        .store
                        .set_container_status(&row.id, ContainerStatus::Stopped)
                        .is_ok()
                    {
                        corrections += 1;
                    }
                }
                Err(e) if e.is_runtime_unavailable() => return corrections,
                Err(_) => {}
            }
        }
        corrections
    }

    /// Runs maintenance on an interval until shutdown.
    pub async fn run_periodic(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
            }
            let stats = self.maintenance().await;
            if stats.errors > 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(MAINTENANCE_RETRY) => {}
                }
            }
        }
        debug!("maintenance loop stopped");
    }
}

enum Adoption {
    Adopted,
    Removed,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtimes::LocalProcessRuntime;
    use crate::store::{ExecRecord, ExecStatus};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        reconciler: Reconciler,
        store: Arc<StateStore>,
        runtime: Arc<LocalProcessRuntime>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let runtime = Arc::new(LocalProcessRuntime::new(tmp.path()).unwrap());
        let store = Arc::new(StateStore::in_memory().unwrap());
        let audit = Arc::new(Audit::new());
        let config = Config::default();
        let engine = Arc::new(ExecEngine::new(
            store.clone(),
            runtime.clone(),
            audit.clone(),
            4,
            1024,
            std::time::Duration::from_secs(10),
            "/workspace".to_string(),
        ));
        let reconciler = Reconciler::new(
            &config,
            store.clone(),
            runtime.clone(),
            engine,
            audit,
            CancellationToken::new(),
        );
        Fixture {
            _tmp: tmp,
            reconciler,
            store,
            runtime,
        }
    }

    async fn daemon_container(
        runtime: &LocalProcessRuntime,
        container_id: &str,
        volume: &str,
    ) -> String {
        let spec = crate::runtime::ContainerSpec {
            image: "docker.io/library/python:3.11-slim".to_string(),
            labels: HashMap::from([
                (LABEL_NAMESPACE.to_string(), "true".to_string()),
                (LABEL_CONTAINER_ID.to_string(), container_id.to_string()),
            ]),
            workspace_volume: (volume.to_string(), "/workspace".to_string()),
            user: "1000:1000".to_string(),
            working_dir: "/workspace".to_string(),
            cap_drop: vec!["ALL".to_string()],
            no_new_privileges: true,
            read_only_rootfs: true,
            limits: crate::runtime::ResourceLimits {
                memory_bytes: 1024,
                cpu_quota_us: 100_000,
                cpu_period_us: 100_000,
                pids_limit: 16,
            },
            network: crate::runtime::NetworkMode::None,
        };
        let runtime_id = runtime.create_container(&spec).await.unwrap();
        runtime.start_container(&runtime_id).await.unwrap();
        runtime_id
    }

    #[tokio::test]
    async fn test_boot_adopts_unknown_daemon_container() {
        let fx = fixture();
        daemon_container(&fx.runtime, "c_orphan", "devbench_transient_c_orphan").await;

        let stats = fx.reconciler.boot().await.unwrap();
        assert_eq!(stats.discovered, 1);
        assert_eq!(stats.adopted, 1);

        let rec = fx.store.get_container("c_orphan").unwrap().unwrap();
        assert_eq!(rec.status, ContainerStatus::Running);
        assert!(!rec.persistent);
        assert_eq!(
            rec.workspace_volume.as_deref(),
            Some("devbench_transient_c_orphan")
        );
    }

    #[tokio::test]
    async fn test_boot_marks_missing_rows_stopped() {
        let fx = fixture();
        fx.store
            .reserve_container("c_gone", "img", None, None, false, None, None, Utc::now())
            .unwrap();
        fx.store.activate_container("c_gone", "rt_gone").unwrap();

        let stats = fx.reconciler.boot().await.unwrap();
        assert_eq!(stats.cleaned_up, 1);
        assert_eq!(
            fx.store.get_container("c_gone").unwrap().unwrap().status,
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_boot_fails_live_execs_with_server_restart() {
        let fx = fixture();
        fx.store
            .reserve_container("c_1", "img", None, None, false, None, None, Utc::now())
            .unwrap();
        fx.store.activate_container("c_1", "rt_1").unwrap();
        fx.store
            .insert_exec(&ExecRecord {
                exec_id: "e_1".to_string(),
                container_id: "c_1".to_string(),
                argv: vec!["sleep".to_string()],
                cwd: "/workspace".to_string(),
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

        let stats = fx.reconciler.boot().await.unwrap();
        assert_eq!(stats.execs_failed, 1);
        let rec = fx.store.get_exec("e_1").unwrap().unwrap();
        assert_eq!(rec.status, ExecStatus::Failed);
        assert_eq!(rec.fail_reason.as_deref(), Some("server_restart"));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let fx = fixture();
        daemon_container(&fx.runtime, "c_one", "devbench_transient_c_one").await;

        let first = fx.reconciler.reconcile().await;
        assert_eq!(first.adopted, 1);
        let second = fx.reconciler.reconcile().await;
        assert_eq!(second.adopted, 0);
        assert_eq!(second.cleaned_up, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(second.errors, 0);
    }

    #[tokio::test]
    async fn test_maintenance_purges_by_retention() {
        let fx = fixture();
        fx.store
            .reserve_container("c_old", "img", None, None, false, None, None, Utc::now())
            .unwrap();
        fx.store
            .set_container_status("c_old", ContainerStatus::Stopped)
            .unwrap();
        fx.store
            .insert_exec(&ExecRecord {
                exec_id: "e_old".to_string(),
                container_id: "c_old".to_string(),
                argv: vec!["true".to_string()],
                cwd: "/workspace".to_string(),
                env: HashMap::new(),
                as_root: false,
                timeout_seconds: 10,
                started_at: Utc::now() - ChronoDuration::days(2),
                ended_at: None,
                exit_code: None,
                usage: None,
                status: ExecStatus::Running,
                fail_reason: None,
            })
            .unwrap();
        fx.store
            .complete_exec(
                "e_old",
                ExecStatus::Exited,
                0,
                &Default::default(),
                None,
                Utc::now() - ChronoDuration::days(2),
            )
            .unwrap();

        let stats = fx.reconciler.maintenance().await;
        assert_eq!(stats.execs_purged, 1);
        assert!(fx.store.get_exec("e_old").unwrap().is_none());
        // The stopped transient row is fresh (last_seen now), so it stays.
        assert!(fx.store.get_container("c_old").unwrap().is_some());
    }
}
