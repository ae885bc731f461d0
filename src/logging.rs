//! Tracing/logging setup for the two binaries (`moltbot-pool`,
//! `moltbot-worker`). A console layer filtered by `RUST_LOG` (default
//! `info`), plus an optional daily-rotating file layer writing into the
//! pool's own log directory — distinct from each worker's private
//! `logs/` sandbox subdirectory, which is application-log space, not
//! this process's own diagnostic log.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info";

/// Installs the global tracing subscriber. Returns the file appender's
/// guard, which must be held for the process lifetime or buffered log
/// lines are dropped on exit.
pub fn init(log_dir: Option<&Path>, file_name: &str) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_layer, guard) = match log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let filter = EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
                (
                    Some(
                        tracing_subscriber::fmt::layer()
                            .with_writer(writer)
                            .with_ansi(false)
                            .with_filter(filter),
                    ),
                    Some(guard),
                )
            }
            Err(e) => {
                eprintln!("warning: failed to create log directory {dir:?}: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    // stdout is the worker's IPC wire (NDJSON, one stream per child); a log
    // line interleaved there would desync the supervisor's reader, so the
    // console layer goes to stderr for both binaries.
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    // Bridge any dependency still emitting through the `log` facade (tower,
    // hyper's transitive deps) into the same subscriber.
    let _ = tracing_log::LogTracer::init();

    guard
}
