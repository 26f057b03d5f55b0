use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ra_domain::config::{Config, ExecutorMode};
use ra_gateway::api;
use ra_gateway::runtime::cleanup::spawn_cleanup_worker;
use ra_gateway::runtime::executor::Executor;
use ra_gateway::runtime::scheduler::Scheduler;
use ra_gateway::runtime::store::RuntimeStore;
use ra_gateway::runtime::stub::StubExecutor;
use ra_gateway::state::AppState;
use ra_workspace::{LocalArtifactStorage, LocalWorkspaceProvider};

#[derive(Parser)]
#[command(name = "resumeagent", about = "Resume-agent gateway server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server (default).
    Serve,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(Arc::new(Config::from_env())).await
        }
        Some(Command::Version) => {
            println!("resumeagent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ra_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(
        provider = %config.provider_name,
        model = %config.model_name,
        retry_max_attempts = config.retry.max_attempts,
        fallback_chain_size = config.fallback_chain.len(),
        "resume-agent gateway starting"
    );

    // ── Storage providers ────────────────────────────────────────────
    let workspace = Arc::new(LocalWorkspaceProvider::new(config.workspace_root.clone()));
    let artifacts = Arc::new(LocalArtifactStorage::new(config.artifact_root.clone()));
    tracing::info!(
        workspace_root = %config.workspace_root.display(),
        artifact_root = %config.artifact_root.display(),
        "storage providers ready"
    );

    // ── Runtime store (loads state + recovery normalization) ─────────
    let store = RuntimeStore::open(config.clone(), workspace, Some(artifacts))
        .context("opening runtime store")?;
    match &config.state_file {
        Some(path) => tracing::info!(path = %path.display(), "runtime store ready (durable)"),
        None => tracing::warn!("runtime store ready (volatile — RA_STATE_FILE is empty)"),
    }

    // ── Executor ─────────────────────────────────────────────────────
    let executor: Arc<dyn Executor> = match config.executor_mode {
        ExecutorMode::Stub => Arc::new(StubExecutor::new()),
        ExecutorMode::Real => {
            // The real mode needs an LLM agent backend wired through
            // `runtime::executor::AgentExecutor`; none ships in this
            // binary.
            anyhow::bail!(
                "RA_EXECUTOR_MODE=real requires an embedded agent backend; \
                 this build only ships the stub executor"
            );
        }
    };

    // ── Scheduler worker ─────────────────────────────────────────────
    let scheduler = Scheduler::start(store.clone(), executor);
    tracing::info!("run scheduler ready");

    // ── Cleanup worker (only when a TTL is configured) ───────────────
    let cleanup_handle = if config.session_ttl_seconds > 0 || config.artifact_ttl_seconds > 0 {
        tracing::info!(
            session_ttl_seconds = config.session_ttl_seconds,
            artifact_ttl_seconds = config.artifact_ttl_seconds,
            interval_seconds = config.cleanup_interval_seconds,
            "cleanup worker ready"
        );
        Some(spawn_cleanup_worker(store.clone()))
    } else {
        None
    };

    // ── HTTP server ──────────────────────────────────────────────────
    let state = AppState::new(config.clone(), store, scheduler.clone());
    let app = api::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    // Drain the run queue before exiting so nothing is left mid-flight.
    tracing::info!("shutting down — draining run queue");
    scheduler.shutdown().await;
    if let Some(handle) = cleanup_handle {
        handle.abort();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
    }
}
