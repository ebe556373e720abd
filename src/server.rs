//! Server context: explicit dependency wiring.
//!
//! One [`ServerContext`] is constructed at startup and passed to every
//! handler - there are no global singletons. Construction opens the state
//! store (running migrations to completion), wires the subsystems
//! together, and hands back the context; [`ServerContext::start`] performs
//! boot reconciliation and launches the supervised background workers.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audit::Audit;
use crate::config::Config;
use crate::error::Result;
use crate::exec::ExecEngine;
use crate::manager::ContainerManager;
use crate::reconcile::Reconciler;
use crate::runtime::ContainerRuntime;
use crate::shutdown::ShutdownCoordinator;
use crate::store::StateStore;
use crate::warmpool::WarmPool;
use crate::workspace::WorkspaceGateway;

/// Everything a tool handler needs, built once and passed explicitly.
pub struct ServerContext {
    pub config: Config,
    pub store: Arc<StateStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub audit: Arc<Audit>,
    pub engine: Arc<ExecEngine>,
    pub manager: Arc<ContainerManager>,
    pub workspace: Arc<WorkspaceGateway>,
    pub reconciler: Arc<Reconciler>,
    pub warm_pool: Arc<WarmPool>,
    pub shutdown: Arc<ShutdownCoordinator>,
    rewarm_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl ServerContext {
    /// Opens the store, runs migrations, and wires every subsystem.
    pub fn build(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Arc<Self>> {
        let store = Arc::new(StateStore::open(&config.state_db_path)?);
        let audit = Arc::new(Audit::new());
        let gate = CancellationToken::new();

        let engine = Arc::new(ExecEngine::new(
            store.clone(),
            runtime.clone(),
            audit.clone(),
            config.concurrent_execs_per_container,
            config.exec_output_budget_bytes,
            config.default_exec_timeout,
            config.workspace_mount_path.clone(),
        ));
        let manager = Arc::new(ContainerManager::new(
            &config,
            store.clone(),
            runtime.clone(),
            engine.clone(),
            audit.clone(),
        ));
        let workspace = Arc::new(WorkspaceGateway::new(
            runtime.clone(),
            audit.clone(),
            config.workspace_mount_path.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            &config,
            store.clone(),
            runtime.clone(),
            engine.clone(),
            audit.clone(),
            gate.clone(),
        ));
        let warm_pool = Arc::new(WarmPool::new(
            &config,
            store.clone(),
            runtime.clone(),
            manager.clone(),
            gate.clone(),
        ));
        let shutdown = Arc::new(ShutdownCoordinator::new(
            &config,
            store.clone(),
            engine.clone(),
            manager.clone(),
            audit.clone(),
            gate,
        ));

        let (rewarm_tx, rewarm_rx) = mpsc::unbounded_channel();
        manager.set_rewarm_notifier(rewarm_tx);

        Ok(Arc::new(Self {
            config,
            store,
            runtime,
            audit,
            engine,
            manager,
            workspace,
            reconciler,
            warm_pool,
            shutdown,
            rewarm_rx: Mutex::new(Some(rewarm_rx)),
        }))
    }

    /// Boot reconciliation plus background workers. Call once, before the
    /// transport starts accepting tool calls.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.audit.startup();
        let stats = self.reconciler.boot().await?;
        info!(?stats, "boot reconciliation done");

        let rewarm_rx = self
            .rewarm_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| crate::error::Error::internal("start called twice"))?;
        tokio::spawn(self.warm_pool.clone().run(rewarm_rx));
        tokio::spawn(self.reconciler.clone().run_periodic());
        Ok(())
    }
}
