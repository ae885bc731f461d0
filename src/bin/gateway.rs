//! Demo gateway binary: a minimal axum HTTP front door exercising the
//! facade of the pool. This is the "outer transport" the design
//! explicitly treats as an external collaborator, not part of the core —
//! it exists only so the facade has somewhere to be driven from, the same
//! status as the teacher's own CLI/demo-server wrappers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use moltbot_pool_rs::gateway::Gateway;
use moltbot_pool_rs::{PoolConfig, WorkerPool};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "moltbot-pool", about = "Sticky-routing worker pool gateway")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    #[arg(long)]
    worker_count: Option<usize>,

    #[arg(long)]
    sandbox_base_dir: Option<std::path::PathBuf>,

    /// Socket address the Prometheus exporter listens on.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Seconds given to in-flight requests to finish on shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = PoolConfig::default();
    config.apply_env_overrides();
    if let Some(n) = cli.worker_count {
        config.worker_count = n;
    }
    if let Some(dir) = cli.sandbox_base_dir.clone() {
        config.sandbox_base_dir = dir;
    }

    let log_dir = config.sandbox_base_dir.join("_pool-logs");
    let _log_guard = moltbot_pool_rs::logging::init(Some(&log_dir), "pool");

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = moltbot_pool_rs::metrics::install(addr) {
            error!(error = %e, "failed to install metrics exporter");
        }
    }

    let pool = Arc::new(WorkerPool::new(config));
    let gateway = Arc::new(Gateway::new(pool));
    gateway.start().await.context("pool failed to start")?;
    info!("pool started, serving gateway");

    let app = moltbot_pool_rs::http::build_router(gateway.clone());

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited with an error")?;

    gateway
        .stop(Duration::from_secs(cli.shutdown_grace_secs))
        .await
        .context("pool failed to stop cleanly")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}
