//! Audit events and process counters.
//!
//! Every externally-visible operation emits a structured audit event
//! through `tracing` (target `devbench::audit`) and bumps a process
//! counter. Environment values and file contents are never part of an
//! event; command argv is logged, its environment is not.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use crate::store::ExecStatus;

const TARGET: &str = "devbench::audit";

/// Monotone process counters, exposed by the `status` tool.
#[derive(Debug, Default)]
pub struct Counters {
    pub spawns: AtomicU64,
    pub attaches: AtomicU64,
    pub kills: AtomicU64,
    pub execs_started: AtomicU64,
    pub execs_exited: AtomicU64,
    pub execs_timed_out: AtomicU64,
    pub execs_cancelled: AtomicU64,
    pub execs_failed: AtomicU64,
    pub as_root_execs: AtomicU64,
    pub fs_ops: AtomicU64,
    pub tar_imports: AtomicU64,
    pub tar_exports: AtomicU64,
    pub output_bytes: AtomicU64,
    pub reconcile_runs: AtomicU64,
    pub gc_runs: AtomicU64,
}

/// Point-in-time view of [`Counters`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub spawns: u64,
    pub attaches: u64,
    pub kills: u64,
    pub execs_started: u64,
    pub execs_exited: u64,
    pub execs_timed_out: u64,
    pub execs_cancelled: u64,
    pub execs_failed: u64,
    pub as_root_execs: u64,
    pub fs_ops: u64,
    pub tar_imports: u64,
    pub tar_exports: u64,
    pub output_bytes: u64,
    pub reconcile_runs: u64,
    pub gc_runs: u64,
}

/// Audit surface, passed explicitly to every subsystem.
#[derive(Debug, Default)]
pub struct Audit {
    counters: Counters,
}

impl Audit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CounterSnapshot {
            spawns: get(&c.spawns),
            attaches: get(&c.attaches),
            kills: get(&c.kills),
            execs_started: get(&c.execs_started),
            execs_exited: get(&c.execs_exited),
            execs_timed_out: get(&c.execs_timed_out),
            execs_cancelled: get(&c.execs_cancelled),
            execs_failed: get(&c.execs_failed),
            as_root_execs: get(&c.as_root_execs),
            fs_ops: get(&c.fs_ops),
            tar_imports: get(&c.tar_imports),
            tar_exports: get(&c.tar_exports),
            output_bytes: get(&c.output_bytes),
            reconcile_runs: get(&c.reconcile_runs),
            gc_runs: get(&c.gc_runs),
        }
    }

    // =========================================================================
    // Container Events
    // =========================================================================

    pub fn container_spawned(&self, container_id: &str, image: &str, warm_claim: bool) {
        self.counters.spawns.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "container_spawn", container_id, image, warm_claim);
    }

    pub fn container_attached(&self, container_id: &str, client_name: &str, session_id: &str) {
        self.counters.attaches.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "container_attach", container_id, client_name, session_id);
    }

    pub fn container_killed(&self, container_id: &str, force: bool) {
        self.counters.kills.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "container_kill", container_id, force);
    }

    // =========================================================================
    // Exec Events
    // =========================================================================

    pub fn exec_started(&self, exec_id: &str, container_id: &str, argv: &[String], as_root: bool) {
        self.counters.execs_started.fetch_add(1, Ordering::Relaxed);
        if as_root {
            self.counters.as_root_execs.fetch_add(1, Ordering::Relaxed);
            info!(target: TARGET, event = "security_as_root", exec_id, container_id);
        }
        info!(target: TARGET, event = "exec_start", exec_id, container_id, argv = ?argv, as_root);
    }

    pub fn exec_cancel_requested(&self, exec_id: &str) {
        info!(target: TARGET, event = "exec_cancel", exec_id);
    }

    pub fn exec_completed(&self, exec_id: &str, status: ExecStatus, exit_code: i64, wall_ms: u64) {
        let counter = match status {
            ExecStatus::Exited => &self.counters.execs_exited,
            ExecStatus::TimedOut => &self.counters.execs_timed_out,
            ExecStatus::Cancelled => &self.counters.execs_cancelled,
            _ => &self.counters.execs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "exec_complete", exec_id, status = %status, exit_code, wall_ms);
    }

    pub fn exec_output(&self, bytes: usize) {
        self.counters
            .output_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    // =========================================================================
    // Filesystem Events
    // =========================================================================

    pub fn fs_op(&self, op: &str, container_id: &str, path: &str) {
        self.counters.fs_ops.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "fs_op", op, container_id, path);
    }

    pub fn tar_export(&self, container_id: &str, path: &str, bytes: usize) {
        self.counters.tar_exports.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "transfer_export", container_id, path, bytes);
    }

    pub fn tar_import(&self, container_id: &str, dest: &str, entries: usize) {
        self.counters.tar_imports.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "transfer_import", container_id, dest, entries);
    }

    pub fn path_violation(&self, container_id: &str, path: &str) {
        info!(target: TARGET, event = "security_policy_violation", container_id, path);
    }

    // =========================================================================
    // System Events
    // =========================================================================

    pub fn reconcile_completed(&self, adopted: usize, cleaned: usize, removed: usize) {
        self.counters.reconcile_runs.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "system_reconcile", adopted, cleaned, removed);
    }

    pub fn gc_completed(&self, containers_removed: usize, execs_purged: usize) {
        self.counters.gc_runs.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "system_gc", containers_removed, execs_purged);
    }

    pub fn startup(&self) {
        info!(target: TARGET, event = "system_startup");
    }

    pub fn shutdown(&self) {
        info!(target: TARGET, event = "system_shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let audit = Audit::new();
        audit.container_spawned("c_1", "python", false);
        audit.exec_started("e_1", "c_1", &["true".to_string()], true);
        audit.exec_completed("e_1", ExecStatus::Exited, 0, 10);
        audit.exec_completed("e_2", ExecStatus::TimedOut, 124, 1000);
        audit.exec_output(512);
        audit.fs_op("read", "c_1", "/workspace/x");

        let snap = audit.snapshot();
        assert_eq!(snap.spawns, 1);
        assert_eq!(snap.execs_started, 1);
        assert_eq!(snap.as_root_execs, 1);
        assert_eq!(snap.execs_exited, 1);
        assert_eq!(snap.execs_timed_out, 1);
        assert_eq!(snap.output_bytes, 512);
        assert_eq!(snap.fs_ops, 1);
    }
}
