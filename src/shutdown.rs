//! # Shutdown Coordinator
//!
//! Drives the graceful exit sequence:
//!
//! 1. stop accepting new spawn/attach/exec requests,
//! 2. let in-flight executions finish within the drain grace,
//! 3. cancel the stragglers and seal their streams with a `shutdown`
//!    control frame,
//! 4. stop and remove transient containers,
//! 5. leave persistent containers running in the daemon,
//! 6. close open attachments and let the WAL settle,
//! 7. return so the process can exit.
//!
//! The same cancellation token gates request admission and stops the
//! background workers (warm pool, maintenance loop).

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::Audit;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::ExecEngine;
use crate::manager::ContainerManager;
use crate::store::StateStore;

/// Coordinates graceful drain-and-stop.
pub struct ShutdownCoordinator {
    store: Arc<StateStore>,
    engine: Arc<ExecEngine>,
    manager: Arc<ContainerManager>,
    audit: Arc<Audit>,
    drain_grace: std::time::Duration,
    gate: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(
        config: &Config,
        store: Arc<StateStore>,
        engine: Arc<ExecEngine>,
        manager: Arc<ContainerManager>,
        audit: Arc<Audit>,
        gate: CancellationToken,
    ) -> Self {
        Self {
            store,
            engine,
            manager,
            audit,
            drain_grace: config.drain_grace,
            gate,
        }
    }

    /// Token shared with background workers; cancelled when shutdown
    /// begins.
    pub fn gate(&self) -> CancellationToken {
        self.gate.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// Admission check for mutating tools.
    pub fn ensure_accepting(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::Cancelled("server is shutting down".to_string()));
        }
        Ok(())
    }

    /// Runs the full shutdown sequence. Idempotent enough to call once
    /// from the signal handler.
    pub async fn run(&self) {
        info!(grace_s = self.drain_grace.as_secs(), "shutdown initiated");
        self.gate.cancel();

        // Drain in-flight executions.
        let drained = self
            .engine
            .drain(Instant::now() + self.drain_grace)
            .await;
        if !drained {
            let remaining = self.engine.active_count();
            warn!(remaining, "drain grace elapsed; cancelling stragglers");
            self.engine.cancel_all();
            // A short second window lets cancellation terminal frames land.
            self.engine
                .drain(Instant::now() + crate::constants::EXEC_KILL_GRACE * 2)
                .await;
        }
        // Anything still open gets the shutdown control frame.
        self.engine.seal_all();

        // Stop and remove transients; persistents stay running daemon-side.
        match self.store.list_containers(false) {
            Ok(rows) => {
                let mut stopped = 0usize;
                for row in rows {
                    if row.persistent {
                        continue;
                    }
                    match self.manager.kill(&row.id, false).await {
                        Ok(_) => stopped += 1,
                        Err(e) => {
                            warn!(container_id = %row.id, error = %e, "transient stop failed during shutdown")
                        }
                    }
                }
                info!(stopped, "transient containers stopped");
            }
            Err(e) => warn!(error = %e, "listing containers during shutdown failed"),
        }

        if let Err(e) = self.store.detach_all() {
            warn!(error = %e, "closing attachments failed");
        }

        self.audit.shutdown();
        info!("graceful shutdown completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerRuntime;
    use crate::runtimes::LocalProcessRuntime;
    use crate::store::ContainerStatus;
    use tempfile::TempDir;

    fn harness() -> (TempDir, Arc<StateStore>, ShutdownCoordinator, Arc<ContainerManager>) {
        let tmp = TempDir::new().unwrap();
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(LocalProcessRuntime::new(tmp.path()).unwrap());
        let store = Arc::new(StateStore::in_memory().unwrap());
        let audit = Arc::new(Audit::new());
        let mut config = Config::default();
        config.warm_pool_enabled = false;
        config.drain_grace = std::time::Duration::from_millis(200);
        let engine = Arc::new(ExecEngine::new(
            store.clone(),
            runtime.clone(),
            audit.clone(),
            4,
            1024,
            std::time::Duration::from_secs(5),
            "/workspace".to_string(),
        ));
        let manager = Arc::new(ContainerManager::new(
            &config,
            store.clone(),
            runtime,
            engine.clone(),
            audit.clone(),
        ));
        let coordinator = ShutdownCoordinator::new(
            &config,
            store.clone(),
            engine,
            manager.clone(),
            audit,
            CancellationToken::new(),
        );
        (tmp, store, coordinator, manager)
    }

    #[tokio::test]
    async fn test_gate_rejects_after_shutdown_begins() {
        let (_tmp, _store, coordinator, _manager) = harness();
        assert!(coordinator.ensure_accepting().is_ok());
        coordinator.gate().cancel();
        let err = coordinator.ensure_accepting().unwrap_err();
        assert_eq!(err.code(), "cancelled");
    }

    #[tokio::test]
    async fn test_shutdown_stops_transients_preserves_persistents() {
        let (_tmp, store, coordinator, manager) = harness();
        let transient = manager
            .spawn(crate::manager::SpawnRequest {
                image: "python:3.11-slim".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let persistent = manager
            .spawn(crate::manager::SpawnRequest {
                image: "python:3.11-slim".to_string(),
                persistent: true,
                ..Default::default()
            })
            .await
            .unwrap();

        coordinator.run().await;

        assert_eq!(
            store
                .get_container(&transient.container_id)
                .unwrap()
                .unwrap()
                .status,
            ContainerStatus::Stopped
        );
        assert_eq!(
            store
                .get_container(&persistent.container_id)
                .unwrap()
                .unwrap()
                .status,
            ContainerStatus::Running
        );
    }
}
