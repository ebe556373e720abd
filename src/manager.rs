//! # Container Manager
//!
//! Lifecycle rules for managed containers: spawn with image policy and
//! hardened defaults, attach bookkeeping, kill with execution cleanup,
//! alias resolution. The manager coordinates the state store (system of
//! record) and the runtime adapter (daemon mutations); neither is touched
//! directly by the tool layer.
//!
//! Spawn ordering keeps the store authoritative: the row is reserved in
//! `creating` before the daemon sees anything, and a daemon failure marks
//! the reservation `error` (terminal - the alias is released and the row
//! never resolves) after best-effort removal of daemon-side leftovers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::audit::Audit;
use crate::config::Config;
use crate::constants::{
    validate_alias, CONTAINER_STOP_TIMEOUT, IDEMPOTENCY_TTL, LABEL_ALIAS, LABEL_CONTAINER_ID,
    LABEL_NAMESPACE, PERSIST_VOLUME_PREFIX, TRANSIENT_VOLUME_PREFIX,
};
use crate::error::{Error, Result};
use crate::exec::ExecEngine;
use crate::policy::ImagePolicy;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::security::SecurityDefaults;
use crate::store::{ContainerRecord, ContainerStatus, IdempotencyKind, StateStore};

/// Parameters for `spawn`.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub image: String,
    pub persistent: bool,
    pub alias: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub idempotency_key: Option<String>,
}

/// Result of `spawn`.
#[derive(Debug, Clone)]
pub struct SpawnedContainer {
    pub container_id: String,
    pub alias: Option<String>,
    pub status: ContainerStatus,
}

/// Result of `attach`.
#[derive(Debug, Clone)]
pub struct AttachResult {
    pub container_id: String,
    pub alias: Option<String>,
    pub roots: Vec<String>,
}

/// Container lifecycle manager.
pub struct ContainerManager {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    engine: Arc<ExecEngine>,
    audit: Arc<Audit>,
    policy: ImagePolicy,
    security: SecurityDefaults,
    workspace_mount: String,
    warm_pool_enabled: bool,
    rewarm_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl ContainerManager {
    pub fn new(
        config: &Config,
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        engine: Arc<ExecEngine>,
        audit: Arc<Audit>,
    ) -> Self {
        Self {
            store,
            runtime,
            engine,
            audit,
            policy: ImagePolicy::new(config),
            security: SecurityDefaults::default(),
            workspace_mount: config.workspace_mount_path.clone(),
            warm_pool_enabled: config.warm_pool_enabled,
            rewarm_tx: Mutex::new(None),
        }
    }

    /// Wires the warm pool's re-warm trigger. Called once at startup.
    pub fn set_rewarm_notifier(&self, tx: mpsc::UnboundedSender<()>) {
        *self.rewarm_tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
    }

    // =========================================================================
    // spawn
    // =========================================================================

    /// Provisions a container: policy validation, idempotency replay, warm
    /// claim when possible, cold spawn otherwise.
    pub async fn spawn(&self, req: SpawnRequest) -> Result<SpawnedContainer> {
        if let Some(alias) = &req.alias {
            if !validate_alias(alias) {
                return Err(Error::Config {
                    option: "alias".to_string(),
                    reason: "alias must be 1-100 chars of [A-Za-z0-9_-]".to_string(),
                });
            }
        }

        if let Some(key) = &req.idempotency_key {
            let not_before = Utc::now()
                - chrono::Duration::from_std(IDEMPOTENCY_TTL)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
            if let Some(existing) =
                self.store
                    .get_idempotency(key, IdempotencyKind::Spawn, not_before)?
            {
                if let Some(rec) = self.store.get_container(&existing)? {
                    info!(%key, container_id = %existing, "idempotent spawn replay");
                    return Ok(SpawnedContainer {
                        container_id: rec.id,
                        alias: rec.alias,
                        status: rec.status,
                    });
                }
            }
        }

        let resolved = self.policy.resolve(&req.image)?;

        if self.warm_pool_enabled {
            if let Some(claimed) = self.try_claim_warm(&req, &resolved.resolved_ref)? {
                if let Some(key) = &req.idempotency_key {
                    self.store
                        .put_idempotency(key, IdempotencyKind::Spawn, &claimed.id, Utc::now())?;
                }
                self.audit
                    .container_spawned(&claimed.id, &resolved.resolved_ref, true);
                return Ok(SpawnedContainer {
                    container_id: claimed.id,
                    alias: req.alias,
                    status: ContainerStatus::Running,
                });
            }
        }

        let spawned = self.cold_spawn(&req, &resolved.resolved_ref, resolved.digest.as_deref(), false).await?;
        if let Some(key) = &req.idempotency_key {
            self.store.put_idempotency(
                key,
                IdempotencyKind::Spawn,
                &spawned.container_id,
                Utc::now(),
            )?;
        }
        Ok(spawned)
    }

    /// Atomic warm claim: a CAS in the state store flips the row out of
    /// the pool and applies the spawn parameters. A successful claim
    /// triggers an asynchronous re-warm.
    fn try_claim_warm(
        &self,
        req: &SpawnRequest,
        resolved_ref: &str,
    ) -> Result<Option<ContainerRecord>> {
        for candidate in self.store.list_warm()? {
            if candidate.image != resolved_ref || candidate.status != ContainerStatus::Running {
                continue;
            }
            if self.store.claim_warm(
                &candidate.id,
                req.alias.as_deref(),
                req.persistent,
                req.ttl_seconds,
            )? {
                info!(container_id = %candidate.id, "warm container claimed");
                if let Some(tx) = self.rewarm_tx.lock().unwrap_or_else(|p| p.into_inner()).as_ref()
                {
                    let _ = tx.send(());
                }
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Full daemon-side container creation. `warm` marks pool members.
    pub async fn cold_spawn(
        &self,
        req: &SpawnRequest,
        resolved_ref: &str,
        digest: Option<&str>,
        warm: bool,
    ) -> Result<SpawnedContainer> {
        let container_id = format!("c_{}", uuid::Uuid::now_v7().simple());
        let volume_name = if req.persistent {
            format!("{PERSIST_VOLUME_PREFIX}{container_id}")
        } else {
            format!("{TRANSIENT_VOLUME_PREFIX}{container_id}")
        };

        self.store.reserve_container(
            &container_id,
            resolved_ref,
            digest,
            req.alias.as_deref(),
            req.persistent,
            req.ttl_seconds,
            Some(&volume_name),
            Utc::now(),
        )?;

        let mut labels = HashMap::from([
            (LABEL_NAMESPACE.to_string(), "true".to_string()),
            (LABEL_CONTAINER_ID.to_string(), container_id.clone()),
        ]);
        if let Some(alias) = &req.alias {
            labels.insert(LABEL_ALIAS.to_string(), alias.clone());
        }
        if warm {
            labels.insert(crate::constants::LABEL_WARM.to_string(), "true".to_string());
        }

        let spec = ContainerSpec {
            image: resolved_ref.to_string(),
            labels,
            workspace_volume: (volume_name.clone(), self.workspace_mount.clone()),
            user: self.security.container_user(),
            working_dir: self.workspace_mount.clone(),
            cap_drop: self.security.cap_drop.clone(),
            no_new_privileges: self.security.no_new_privileges,
            read_only_rootfs: self.security.read_only_rootfs,
            limits: self.security.limits,
            network: self.security.network_mode(),
        };

        let runtime_id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.store
                    .set_container_status(&container_id, ContainerStatus::Error)?;
                return Err(e);
            }
        };
        if let Err(e) = self.runtime.start_container(&runtime_id).await {
            warn!(%container_id, error = %e, "start failed; removing daemon-side leftovers");
            let _ = self.runtime.remove_container(&runtime_id, true, true).await;
            let _ = self.runtime.remove_volume(&volume_name).await;
            self.store
                .set_container_status(&container_id, ContainerStatus::Error)?;
            return Err(e);
        }

        self.store.activate_container(&container_id, &runtime_id)?;
        if warm {
            self.store.set_warm(&container_id, true)?;
        }
        self.audit
            .container_spawned(&container_id, resolved_ref, false);
        info!(%container_id, %runtime_id, image = resolved_ref, "container spawned");

        Ok(SpawnedContainer {
            container_id,
            alias: req.alias.clone(),
            status: ContainerStatus::Running,
        })
    }

    /// Spawns a transient warm-pool member (no alias, `warm=1`).
    pub async fn spawn_warm(&self, image: &str) -> Result<SpawnedContainer> {
        let resolved = self.policy.resolve(image)?;
        let req = SpawnRequest {
            image: image.to_string(),
            ..Default::default()
        };
        self.cold_spawn(&req, &resolved.resolved_ref, resolved.digest.as_deref(), true)
            .await
    }

    // =========================================================================
    // attach / resolve / list
    // =========================================================================

    /// Records a client session against a container. Does not modify the
    /// container or gate later operations.
    pub fn attach(&self, target: &str, client_name: &str, session_id: &str) -> Result<AttachResult> {
        let rec = self.resolve(target)?;
        self.store
            .insert_attachment(&rec.id, client_name, session_id, Utc::now())?;
        self.audit.container_attached(&rec.id, client_name, session_id);
        Ok(AttachResult {
            roots: vec![format!("workspace:{}", rec.id)],
            container_id: rec.id,
            alias: rec.alias,
        })
    }

    /// Resolves an id or alias to a live container row.
    pub fn resolve(&self, id_or_alias: &str) -> Result<ContainerRecord> {
        self.store
            .resolve(id_or_alias)?
            .ok_or_else(|| Error::ContainerNotFound(id_or_alias.to_string()))
    }

    /// Lists container rows.
    pub fn list(&self, include_stopped: bool) -> Result<Vec<ContainerRecord>> {
        self.store.list_containers(include_stopped)
    }

    // =========================================================================
    // kill
    // =========================================================================

    /// Stops and removes a container. Idempotent: killing an
    /// already-stopped container reports `stopped` without error.
    /// Persistent workspace volumes are preserved; transient ones are
    /// dropped with the container.
    pub async fn kill(&self, container_id: &str, force: bool) -> Result<ContainerStatus> {
        let rec = match self.store.get_container(container_id)? {
            Some(rec) => rec,
            None => return Err(Error::ContainerNotFound(container_id.to_string())),
        };
        if rec.status.is_terminal() {
            return Ok(ContainerStatus::Stopped);
        }

        let cancelled = self.engine.cancel_container(&rec.id)?;
        if cancelled > 0 {
            info!(container_id = %rec.id, cancelled, "cancelled live executions for kill");
        }
        self.store
            .set_container_status(&rec.id, ContainerStatus::Stopping)?;

        if let Some(runtime_id) = &rec.runtime_id {
            let stop_timeout = if force {
                std::time::Duration::ZERO
            } else {
                CONTAINER_STOP_TIMEOUT
            };
            match self.runtime.stop_container(runtime_id, stop_timeout).await {
                Ok(()) | Err(Error::ContainerNotFound(_)) => {}
                Err(e) if force => warn!(container_id = %rec.id, error = %e, "stop failed; forcing removal"),
                Err(e) => return Err(e),
            }
            self.runtime.remove_container(runtime_id, true, false).await?;
        }
        if !rec.persistent {
            if let Some(volume) = &rec.workspace_volume {
                if let Err(e) = self.runtime.remove_volume(volume).await {
                    warn!(container_id = %rec.id, %volume, error = %e, "transient volume removal failed");
                }
            }
        }

        self.store.detach_container(&rec.id)?;
        self.store
            .set_container_status(&rec.id, ContainerStatus::Stopped)?;
        self.engine.forget_container(&rec.id);
        self.audit.container_killed(&rec.id, force);
        info!(container_id = %rec.id, force, "container killed");
        Ok(ContainerStatus::Stopped)
    }
}
