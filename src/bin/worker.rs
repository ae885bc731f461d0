//! The worker child process. Spawned by the supervisor with piped
//! stdin/stdout as its IPC channel and a filtered + sandbox-overlaid
//! environment already in place; reads its `Init` envelope off that
//! channel before booting the runtime.

use std::time::Duration;

use anyhow::{Context, Result};
use moltbot_pool_rs::config::WorkerConfig;
use moltbot_pool_rs::ipc::message::ToWorker;
use moltbot_pool_rs::ipc::IpcChannel;
use moltbot_pool_rs::worker::{run, NullHandler};
use tracing::error;

/// How long the worker waits for its `Init` envelope before giving up.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    install_panic_hook();

    // MOLTBOT_LOGS_DIR is part of the sandbox environment overlay the
    // supervisor applies before spawning, so it's already set even though
    // the Init envelope (carrying the rest of the config) hasn't arrived yet.
    let log_dir = std::env::var("MOLTBOT_LOGS_DIR").ok().map(std::path::PathBuf::from);
    let worker_id = std::env::var("MOLTBOT_WORKER_ID").unwrap_or_else(|_| "worker".to_string());
    let _log_guard = moltbot_pool_rs::logging::init(log_dir.as_deref(), "worker");

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let channel = IpcChannel::new(stdin, stdout);

    let config = wait_for_init(&channel)
        .await
        .context("worker did not receive an Init envelope in time")?;

    tracing::info!(worker_id = %worker_id, "worker booting");
    run(channel, config, NullHandler)
        .await
        .context("worker runtime exited with an error")?;
    Ok(())
}

async fn wait_for_init(
    channel: &IpcChannel<tokio::io::Stdin, tokio::io::Stdout>,
) -> Result<WorkerConfig> {
    let envelope = channel
        .wait_for::<ToWorker, _>(INIT_TIMEOUT, |m| matches!(m, ToWorker::Init { .. }))
        .await
        .map_err(anyhow::Error::from)?;
    match envelope.message {
        ToWorker::Init { config } => Ok(config),
        _ => unreachable!("wait_for only returns matching messages"),
    }
}

/// Uncaught panics are fatal per the worker's documented failure handling:
/// log them as a fatal condition before the default panic behavior tears
/// the process down with a non-zero exit code. There is no synchronous way
/// to push an `Error{fatal:true}` envelope from inside a panic hook, so this
/// is the best-effort half of that contract; the supervisor still observes
/// the exit and applies the restart policy either way.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "worker process panicked, exiting");
        default_hook(info);
    }));
}
