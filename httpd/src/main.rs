//! `runnerd` — HTTP control plane entry point (C8), plus the recurring
//! scheduler (C9) which submits through the same internal path as the API.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use core_engine::config::RunnerConfig;
use core_engine::history::HistoryStore;
use core_engine::path_policy::PathPolicy;
use core_engine::registry::RunRegistry;

use runnerd::api;
use runnerd::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "runnerd", about = "HTTP control plane for the script execution engine")]
struct CliArgs {
    #[arg(long, default_value = "127.0.0.1:8085")]
    listen_address: String,

    #[arg(long, default_value = "runnerd_history.db")]
    history_db: PathBuf,

    #[arg(long, default_value = "runnerd_registry.db")]
    registry_db: PathBuf,

    #[arg(long, default_value = "./uploads")]
    uploads_dir: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    allowed_root: Option<PathBuf>,

    #[arg(long, default_value_t = 60)]
    scheduler_interval_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => RunnerConfig::load(path).context("failed to load config file")?,
        None => RunnerConfig::default(),
    };

    let allow_root = args
        .allowed_root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    let path_policy = PathPolicy::default_profile(allow_root);

    let registry = RunRegistry::open(&args.registry_db).context("failed to open run registry")?;
    let history = HistoryStore::open(&args.history_db).context("failed to open history store")?;

    let state = AppState::new(registry, history, path_policy, config, args.uploads_dir.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let scheduler_state = state.clone();
    let scheduler_interval = std::time::Duration::from_secs(args.scheduler_interval_seconds);
    let scheduler_task = tokio::spawn(async move {
        scheduler_state
            .scheduler
            .run_forever(
                scheduler_interval,
                |request| {
                    let state = scheduler_state.clone();
                    async move { api::submit_run(state, request).await.map(|_| ()).map_err(|e| {
                        core_engine::CoreError::Runtime(e.to_string())
                    }) }
                },
                shutdown_rx,
            )
            .await;
    });

    let app = api::create_router(state);

    let addr: SocketAddr = args
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address: {}", args.listen_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(address = %addr, "runnerd listening");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(());
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "scheduler task panicked during shutdown");
    }

    Ok(())
}
