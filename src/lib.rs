//! # devbench
//!
//! **Container-Backed Workspace Server - Control Plane**
//!
//! This crate provisions isolated container sandboxes on behalf of remote
//! clients (typically AI agents) and exposes lifecycle, asynchronous
//! command execution with streamed output, and a workspace filesystem API
//! as typed tool contracts. A local container daemon is the execution
//! substrate; an embedded SQLite database is the authoritative record, so
//! the server recovers cleanly from crashes, daemon restarts, and planned
//! shutdowns.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Tool Surface (typed)                          │
//! │   spawn / attach / kill · exec_start / cancel / poll · fs_* · admin  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐  ┌─────────────────┐  ┌────────────────────┐  │
//! │  │ Container Manager │  │ Execution Engine│  │ Workspace Gateway  │  │
//! │  │ policy · aliases  │  │ slots · rings   │  │ containment · tar  │  │
//! │  │ warm-claim · kill │  │ timeout · cancel│  │ etags · staging    │  │
//! │  └─────────┬─────────┘  └────────┬────────┘  └─────────┬──────────┘  │
//! │            │                     │                     │             │
//! │  ┌─────────▼─────────────────────▼─────────────────────▼──────────┐  │
//! │  │              ContainerRuntime (capability trait)               │  │
//! │  │        DockerRuntime (bollard) │ LocalProcessRuntime           │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │        StateStore (SQLite, WAL) - the system of record         │  │
//! │  │   containers · attachments · execs · idempotency_keys          │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │     Reconciler & Warm Pool · Shutdown Coordinator · Audit surface    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Recovery Model
//!
//! Every container we create carries a namespace label and its opaque id,
//! so the daemon alone is sufficient to recover identity. On boot the
//! reconciler adopts labeled containers the store has never seen, marks
//! rows whose daemon object is gone, and fails executions interrupted by
//! the restart. Warm-pool claims are a single-row compare-and-swap in the
//! store, which is also what makes the spawn fast path safe under
//! concurrency.
//!
//! # Output Streaming
//!
//! Executions never hold a long-lived connection. Output lands in a
//! per-exec bounded ring buffer (64 MiB default); clients poll by cursor
//! and may resume, re-read, or fall behind - eviction advances a
//! watermark that polls observe as an explicit gap. The terminal frame
//! carries the exit code and resource usage exactly once.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use devbench::{Config, DockerRuntime, ServerContext, Tools};
//!
//! #[tokio::main]
//! async fn main() -> devbench::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = Arc::new(DockerRuntime::connect()?);
//!     let ctx = ServerContext::build(config, runtime)?;
//!     ctx.start().await?;
//!
//!     let tools = Tools::new(ctx.clone());
//!     let spawned = tools
//!         .spawn(devbench::tools::SpawnInput {
//!             image: "python:3.11-slim".into(),
//!             persistent: false,
//!             alias: Some("w1".into()),
//!             ttl_s: None,
//!             idempotency_key: None,
//!         })
//!         .await?;
//!     println!("workspace ready: {}", spawned.container_id);
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod constants;
mod policy;
mod security;

// =============================================================================
// Public Modules
// =============================================================================

pub mod audit;
pub mod config;
pub mod error;
pub mod exec;
pub mod manager;
pub mod reconcile;
pub mod runtime;
pub mod runtimes;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod tools;
pub mod warmpool;
pub mod workspace;

// =============================================================================
// Re-exports (primary API surface)
// =============================================================================

pub use config::Config;
pub use error::{Error, Result};
pub use exec::{ExecEngine, ExecRequest};
pub use manager::{ContainerManager, SpawnRequest};
pub use runtime::ContainerRuntime;
pub use runtimes::{DockerRuntime, LocalProcessRuntime};
pub use server::ServerContext;
pub use store::{ContainerStatus, ExecStatus, StateStore};
pub use tools::Tools;
pub use workspace::WorkspaceGateway;
