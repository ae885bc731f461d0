//! Prometheus metrics exporter wiring. Ambient observability, independent of
//! any single component — the supervisor and gateway call the `record_*`
//! helpers; nothing downstream depends on whether an exporter is running.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::errors::{PoolError, PoolResult};

/// Installs the process-global Prometheus recorder and starts its HTTP
/// listener. Call once, near the top of `main`.
pub fn install(listen_addr: SocketAddr) -> PoolResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .map_err(|e| PoolError::Configuration(format!("failed to install metrics exporter: {e}")))?;
    info!(%listen_addr, "metrics exporter listening");
    Ok(())
}

pub fn record_dispatch(worker_id: &str, success: bool, duration_ms: u64) {
    metrics::counter!("moltbot_pool_requests_total", "worker_id" => worker_id.to_string(), "success" => success.to_string())
        .increment(1);
    metrics::histogram!("moltbot_pool_request_duration_ms", "worker_id" => worker_id.to_string())
        .record(duration_ms as f64);
}

pub fn record_restart(worker_id: &str) {
    metrics::counter!("moltbot_pool_worker_restarts_total", "worker_id" => worker_id.to_string())
        .increment(1);
}

pub fn record_crash(worker_id: &str) {
    metrics::counter!("moltbot_pool_worker_crashes_total", "worker_id" => worker_id.to_string())
        .increment(1);
}

pub fn set_healthy_workers(count: u64) {
    metrics::gauge!("moltbot_pool_healthy_workers").set(count as f64);
}
