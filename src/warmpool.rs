//! # Warm Pool
//!
//! Keeps K pre-created containers of the default image running so a spawn
//! can skip daemon-side creation entirely. Claiming is a single-row CAS in
//! the state store (`warm=1 → warm=0`, performed by the manager's spawn
//! path); this worker replenishes the pool after claims and replaces
//! members that fail their health check.
//!
//! Pool members carry the `devbench.warm` label and wiped workspaces, so a
//! claimed container is indistinguishable from a cold-spawned one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::manager::ContainerManager;
use crate::runtime::{ContainerRuntime, ExecSpec};
use crate::security::SecurityDefaults;
use crate::store::{ContainerStatus, StateStore};

/// Warm-pool supervisor.
pub struct WarmPool {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    manager: Arc<ContainerManager>,
    enabled: bool,
    size: usize,
    default_image: String,
    health_interval: std::time::Duration,
    workspace_mount: String,
    shutdown: CancellationToken,
}

impl WarmPool {
    pub fn new(
        config: &Config,
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        manager: Arc<ContainerManager>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            runtime,
            manager,
            enabled: config.warm_pool_enabled,
            size: config.warm_pool_size,
            default_image: config.default_image.clone(),
            health_interval: config.warm_health_check_interval,
            workspace_mount: config.workspace_mount_path.clone(),
            shutdown,
        }
    }

    /// Runs the supervisor until shutdown: initial fill, then health
    /// checks on an interval and re-fills whenever a claim is reported.
    pub async fn run(self: Arc<Self>, mut rewarm_rx: mpsc::UnboundedReceiver<()>) {
        if !self.enabled {
            info!("warm pool disabled");
            return;
        }
        info!(size = self.size, image = %self.default_image, "warm pool starting");
        if let Err(e) = self.replenish().await {
            warn!(error = %e, "initial warm fill failed");
        }

        let mut ticker = tokio::time::interval(self.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.health_pass().await {
                        warn!(error = %e, "warm pool health pass failed");
                    }
                }
                claimed = rewarm_rx.recv() => {
                    if claimed.is_none() {
                        break;
                    }
                    if let Err(e) = self.replenish().await {
                        warn!(error = %e, "re-warm after claim failed");
                    }
                }
            }
        }
        debug!("warm pool stopped");
    }

    /// Creates warm members until the pool holds `size` running ones.
    async fn replenish(&self) -> Result<()> {
        loop {
            let current = self
                .store
                .list_warm()?
                .into_iter()
                .filter(|c| c.status == ContainerStatus::Running)
                .count();
            if current >= self.size {
                return Ok(());
            }
            let spawned = self.manager.spawn_warm(&self.default_image).await?;
            self.wipe_workspace(&spawned.container_id).await;
            info!(container_id = %spawned.container_id, "warm container ready");
        }
    }

    /// Ensures a fresh member hands over an empty workspace.
    async fn wipe_workspace(&self, container_id: &str) {
        let Ok(Some(rec)) = self.store.get_container(container_id) else {
            return;
        };
        let Some(runtime_id) = rec.runtime_id else {
            return;
        };
        let spec = ExecSpec {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "find . -mindepth 1 -maxdepth 1 -exec rm -rf -- {} + 2>/dev/null; true".to_string(),
            ],
            cwd: self.workspace_mount.clone(),
            env: Default::default(),
            user: SecurityDefaults::default().exec_user(false),
        };
        match self.runtime.exec_run(&runtime_id, &spec).await {
            Ok(mut running) => {
                while running.chunks.recv().await.is_some() {}
                let _ = running.exit.await;
            }
            Err(e) => warn!(container_id, error = %e, "workspace wipe failed"),
        }
    }

    /// Replaces pool members that are not running or fail a trivial exec.
    async fn health_pass(&self) -> Result<()> {
        for member in self.store.list_warm()? {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            if self.is_healthy(&member.runtime_id).await {
                self.store.touch_container(&member.id)?;
                continue;
            }
            warn!(container_id = %member.id, "warm container unhealthy; replacing");
            if let Err(e) = self.manager.kill(&member.id, true).await {
                warn!(container_id = %member.id, error = %e, "unhealthy member removal failed");
            }
        }
        self.replenish().await
    }

    async fn is_healthy(&self, runtime_id: &Option<String>) -> bool {
        let Some(runtime_id) = runtime_id else {
            return false;
        };
        let inspected = match self.runtime.inspect_container(runtime_id).await {
            Ok(c) => c,
            Err(_) => return false,
        };
        if inspected.status != crate::runtime::RuntimeStatus::Running {
            return false;
        }
        let spec = ExecSpec {
            argv: vec!["echo".to_string(), "health_check".to_string()],
            cwd: self.workspace_mount.clone(),
            env: Default::default(),
            user: SecurityDefaults::default().exec_user(false),
        };
        match self.runtime.exec_run(runtime_id, &spec).await {
            Ok(mut running) => {
                while running.chunks.recv().await.is_some() {}
                running.exit.await.map(|code| code == 0).unwrap_or(false)
            }
            Err(_) => false,
        }
    }
}
