//! devbenchd - container-backed workspace server daemon.
//!
//! Hosts the workspace control plane: opens the state database, connects
//! to the container daemon, reconciles, starts the warm pool and
//! maintenance workers, and drains gracefully on SIGTERM/SIGINT. The
//! tool-RPC transport (framing, auth) is provided by the embedding server,
//! which mounts [`devbench::Tools`] on this process's context.
//!
//! ## Usage
//!
//! ```sh
//! devbenchd [--process-runtime] [--version] [--help]
//! ```
//!
//! Configuration comes from `DEVBENCH_*` environment variables (see
//! `devbench::Config`). `--process-runtime` swaps the Docker daemon for
//! the local-process backend, for daemon-less development.

use std::process::ExitCode;
use std::sync::Arc;

use devbench::runtime::ContainerRuntime;
use devbench::runtimes::{DockerRuntime, LocalProcessRuntime};
use devbench::{Config, ServerContext, Tools};
use tracing::{error, info};

#[derive(Debug, Default)]
struct Args {
    process_runtime: bool,
    version: bool,
    help: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--process-runtime" => args.process_runtime = true,
            "--version" | "-V" => args.version = true,
            "--help" | "-h" => args.help = true,
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(args)
}

fn print_help() {
    println!(
        "devbenchd {} - container-backed workspace server\n\n\
         USAGE:\n    devbenchd [--process-runtime]\n\n\
         OPTIONS:\n    --process-runtime    use the local-process backend instead of Docker\n    \
         -V, --version        print version\n    -h, --help           print this help\n\n\
         Configuration is read from DEVBENCH_* environment variables.",
        env!("CARGO_PKG_VERSION")
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.help {
        print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        println!("devbenchd {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> devbench::Result<()> {
    let config = Config::from_env()?;

    let runtime: Arc<dyn ContainerRuntime> = if args.process_runtime {
        Arc::new(LocalProcessRuntime::new("./devbench-workspaces")?)
    } else {
        match &config.docker_host {
            Some(uri) => Arc::new(DockerRuntime::connect_uri(uri)?),
            None => Arc::new(DockerRuntime::connect()?),
        }
    };
    runtime.ping().await?;
    info!(backend = runtime.name(), "container runtime connected");

    let ctx = ServerContext::build(config, runtime)?;
    ctx.start().await?;

    // The transport layer mounts the tool surface on this context.
    let _tools = Tools::new(ctx.clone());
    info!("devbenchd ready");

    wait_for_signal().await;
    ctx.shutdown.run().await;
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("SIGINT received"),
            Err(e) => error!(error = %e, "signal wait failed"),
        },
    }
}
