//! In-child dispatcher: boot, request handling, heartbeats, limit checks,
//! graceful shutdown. Mirrors the teacher's single-shared-state-plus-tasks
//! shape (a `Shared` record plus spawned tasks reading from it) generalized
//! from HTTP request proxying to IPC request/response over a framed channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::errors::{PoolError, PoolResult};
use crate::ipc::message::{
    EventReason, HealthSnapshot, PartialHealth, RequestKind, ToSupervisor, ToWorker, WorkerEvent,
    WorkerResponse, WorkerState as WireWorkerState,
};
use crate::ipc::IpcChannel;
use crate::sandbox::Sandbox;

use super::handler::{HandlerError, RequestHandler};

/// A worker request type handled as a programmatic shutdown trigger has no
/// grace period of its own on the wire; this is the grace period applied.
const REQUEST_SHUTDOWN_GRACE_MS: u64 = 5_000;

struct Shared {
    config: WorkerConfig,
    sandbox: Sandbox,
    lifecycle: Mutex<WireWorkerState>,
    active_requests: Mutex<HashMap<String, Instant>>,
    requests_processed: AtomicU64,
    error_count: AtomicU64,
    started_at: Instant,
    shutdown_requested: AtomicBool,
}

impl Shared {
    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            pid: Some(std::process::id()),
            state: *self.lifecycle.lock(),
            memory_bytes: current_memory_bytes(),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            active_requests: self.active_requests.lock().len(),
            last_heartbeat_ms: crate::ipc::message::now_unix_ms(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            error_count: self.error_count.load(Ordering::Relaxed),
            cpu_usage: 0.0,
        }
    }

    fn partial_health(&self) -> PartialHealth {
        PartialHealth {
            state: *self.lifecycle.lock(),
            active_requests: self.active_requests.lock().len(),
            memory_bytes: current_memory_bytes(),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
        }
    }
}

/// Runs the worker's message loop to completion. Consumes the channel;
/// returns once the worker has transitioned to `Stopped`.
pub async fn run<R, W, H>(
    channel: IpcChannel<R, W>,
    config: WorkerConfig,
    handler: H,
) -> PoolResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    H: RequestHandler,
{
    let channel = Arc::new(channel);
    let handler = Arc::new(handler);

    let worker_id = config.worker_id.clone();
    let sandbox = Sandbox::from_root(&worker_id, config.sandbox_root.clone());
    sandbox.init()?;

    // Merge the sandbox environment overlay into this process's environment,
    // so any application code honoring XDG/tempdir variables is re-rooted.
    for (key, value) in sandbox.environment() {
        std::env::set_var(key, value);
    }

    let shared = Arc::new(Shared {
        config: config.clone(),
        sandbox,
        lifecycle: Mutex::new(WireWorkerState::Starting),
        active_requests: Mutex::new(HashMap::new()),
        requests_processed: AtomicU64::new(0),
        error_count: AtomicU64::new(0),
        started_at: Instant::now(),
        shutdown_requested: AtomicBool::new(false),
    });

    let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms);
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<u64>();

    channel
        .send(ToSupervisor::Ready {
            worker_id: worker_id.clone(),
        })
        .await?;
    *shared.lifecycle.lock() = WireWorkerState::Ready;
    info!(worker_id = %worker_id, "worker ready");

    let signal_tx = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        signal_watch(signal_tx).await;
    });

    let heartbeat_channel = channel.clone();
    let heartbeat_shared = shared.clone();
    let heartbeat_worker_id = worker_id.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            let health = heartbeat_shared.partial_health();
            if heartbeat_channel
                .send(ToSupervisor::Heartbeat {
                    worker_id: heartbeat_worker_id.clone(),
                    health,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            grace_ms = shutdown_rx.recv() => {
                if let Some(grace_ms) = grace_ms {
                    graceful_shutdown(&channel, &shared, grace_ms).await?;
                    break;
                }
            }
            envelope = channel.recv::<ToWorker>() => {
                match envelope? {
                    None => {
                        warn!(worker_id = %worker_id, "ipc channel closed, exiting");
                        break;
                    }
                    Some(envelope) => match envelope.message {
                        ToWorker::Init { .. } => {
                            warn!(worker_id = %worker_id, "ignoring duplicate Init");
                        }
                        ToWorker::HealthCheck => {
                            channel.send(ToSupervisor::Health { health: shared.snapshot() }).await?;
                        }
                        ToWorker::Shutdown { grace_period_ms } => {
                            graceful_shutdown(&channel, &shared, grace_period_ms).await?;
                            break;
                        }
                        ToWorker::Kill => {
                            info!(worker_id = %worker_id, "received Kill, exiting immediately");
                            break;
                        }
                        ToWorker::Request { request } => {
                            let channel = channel.clone();
                            let shared = shared.clone();
                            let handler = handler.clone();
                            let shutdown_tx = shutdown_tx.clone();
                            let panic_channel = channel.clone();
                            let request_id = request.request_id.clone();
                            let join = tokio::spawn(async move {
                                handle_request(channel, shared, handler, request, shutdown_tx).await;
                            });
                            // A panicking request handler is an unhandled async
                            // failure, not a fatal one: log it and keep serving.
                            tokio::spawn(async move {
                                if let Err(join_err) = join.await {
                                    if join_err.is_panic() {
                                        let _ = panic_channel
                                            .send(ToSupervisor::Error {
                                                message: format!(
                                                    "request {request_id} handler panicked: {join_err}"
                                                ),
                                                code: Some("HANDLER_PANIC".to_string()),
                                                fatal: false,
                                            })
                                            .await;
                                    }
                                }
                            });
                        }
                    },
                }
            }
        }
    }

    heartbeat_task.abort();
    signal_task.abort();
    Ok(())
}

/// `SIGTERM` requests a 5s graceful shutdown, `SIGINT` a 1s one, matching
/// the worker's documented signal handling. On non-Unix targets only
/// Ctrl-C (treated as `SIGINT`) is available.
#[cfg(unix)]
async fn signal_watch(shutdown_tx: mpsc::UnboundedSender<u64>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, starting 5s graceful shutdown");
            let _ = shutdown_tx.send(5_000);
        }
        _ = sigint.recv() => {
            info!("received SIGINT, starting 1s graceful shutdown");
            let _ = shutdown_tx.send(1_000);
        }
    }
}

#[cfg(not(unix))]
async fn signal_watch(shutdown_tx: mpsc::UnboundedSender<u64>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received ctrl-c, starting 1s graceful shutdown");
        let _ = shutdown_tx.send(1_000);
    }
}

async fn handle_request<R, W, H>(
    channel: Arc<IpcChannel<R, W>>,
    shared: Arc<Shared>,
    handler: Arc<H>,
    request: crate::ipc::message::WorkerRequest,
    shutdown_tx: mpsc::UnboundedSender<u64>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    H: RequestHandler,
{
    let request_id = request.request_id.clone();
    shared
        .active_requests
        .lock()
        .insert(request_id.clone(), Instant::now());
    *shared.lifecycle.lock() = WireWorkerState::Busy;
    let _ = shared.sandbox.touch();

    let start = Instant::now();
    let outcome = dispatch(&shared, &handler, &request, &shutdown_tx).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let response = match outcome {
        Ok(payload) => WorkerResponse {
            request_id: request_id.clone(),
            success: true,
            payload: Some(payload),
            error: None,
            error_code: None,
            duration_ms,
        },
        Err(err) => {
            shared.error_count.fetch_add(1, Ordering::Relaxed);
            WorkerResponse {
                request_id: request_id.clone(),
                success: false,
                payload: None,
                error: Some(err.message),
                error_code: err.code,
                duration_ms,
            }
        }
    };

    if let Err(e) = channel.send(ToSupervisor::Response { response }).await {
        error!(request_id = %request_id, error = %e, "failed to send response");
    }

    shared.requests_processed.fetch_add(1, Ordering::Relaxed);
    shared.active_requests.lock().remove(&request_id);
    if shared.active_requests.lock().is_empty() {
        *shared.lifecycle.lock() = WireWorkerState::Ready;
    }

    check_limits(&channel, &shared).await;
}

async fn dispatch<R, W, H>(
    shared: &Arc<Shared>,
    handler: &Arc<H>,
    request: &crate::ipc::message::WorkerRequest,
    shutdown_tx: &mpsc::UnboundedSender<u64>,
) -> Result<serde_json::Value, HandlerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    H: RequestHandler,
{
    match request.kind {
        RequestKind::SessionGet => {
            let name = session_name(&request.payload)?;
            Ok(shared
                .sandbox
                .read_session(&name)
                .unwrap_or(serde_json::Value::Null))
        }
        RequestKind::SessionSet => {
            let name = session_name(&request.payload)?;
            let value = request
                .payload
                .get("value")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            shared
                .sandbox
                .write_session(&name, &value)
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(serde_json::json!({"ok": true}))
        }
        RequestKind::SessionDelete => {
            let name = session_name(&request.payload)?;
            shared
                .sandbox
                .delete_session(&name)
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(serde_json::json!({"ok": true}))
        }
        RequestKind::SessionList => {
            let sessions = shared
                .sandbox
                .list_sessions()
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(serde_json::json!({"sessions": sessions}))
        }
        RequestKind::HealthCheck => Ok(serde_json::to_value(shared.snapshot()).unwrap()),
        RequestKind::Shutdown => {
            let _ = shutdown_tx.send(REQUEST_SHUTDOWN_GRACE_MS);
            Ok(serde_json::json!({"shuttingDown": true}))
        }
        RequestKind::AgentMessage | RequestKind::AgentCommand => handler
            .handle(request.kind, request.payload.clone(), &shared.sandbox)
            .await,
    }
}

fn session_name(payload: &serde_json::Value) -> Result<String, HandlerError> {
    payload
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| HandlerError::with_code("missing \"name\" field", "BAD_REQUEST"))
}

async fn check_limits<R, W>(channel: &Arc<IpcChannel<R, W>>, shared: &Arc<Shared>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let memory_bytes = current_memory_bytes();
    if memory_bytes > shared.config.max_memory_bytes {
        let _ = channel
            .send(ToSupervisor::Event {
                event: WorkerEvent {
                    reason: EventReason::MemoryLimit,
                    detail: Some(serde_json::json!({"memoryBytes": memory_bytes})),
                },
            })
            .await;
    }

    let processed = shared.requests_processed.load(Ordering::Relaxed);
    if processed >= shared.config.max_requests {
        let _ = channel
            .send(ToSupervisor::Event {
                event: WorkerEvent {
                    reason: EventReason::RequestLimit,
                    detail: Some(serde_json::json!({"requestsProcessed": processed})),
                },
            })
            .await;
    }
}

async fn graceful_shutdown<R, W>(
    channel: &Arc<IpcChannel<R, W>>,
    shared: &Arc<Shared>,
    grace_period_ms: u64,
) -> PoolResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    shared.shutdown_requested.store(true, Ordering::Relaxed);
    *shared.lifecycle.lock() = WireWorkerState::Stopping;

    let deadline = Instant::now() + Duration::from_millis(grace_period_ms);
    loop {
        if shared.active_requests.lock().is_empty() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let remaining: Vec<String> = shared
        .active_requests
        .lock()
        .drain()
        .map(|(id, _)| id)
        .collect();
    for request_id in remaining {
        channel
            .send(ToSupervisor::Response {
                response: WorkerResponse {
                    request_id,
                    success: false,
                    payload: None,
                    error: Some("Worker shutting down".to_string()),
                    error_code: Some("WORKER_SHUTDOWN".to_string()),
                    duration_ms: 0,
                },
            })
            .await?;
    }

    channel
        .send(ToSupervisor::Event {
            event: WorkerEvent {
                reason: EventReason::Stopped,
                detail: None,
            },
        })
        .await?;
    *shared.lifecycle.lock() = WireWorkerState::Stopped;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

#[cfg(target_os = "linux")]
fn current_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                line.strip_prefix("VmRSS:").map(|rest| {
                    rest.trim()
                        .trim_end_matches(" kB")
                        .trim()
                        .parse::<u64>()
                        .unwrap_or(0)
                        * 1024
                })
            })
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn current_memory_bytes() -> u64 {
    0
}

/// Expose HealthSnapshot serialization used internally by `dispatch` for
/// the HealthCheck request kind; also used directly by tests.
pub use crate::ipc::message::HealthSnapshot as WorkerHealthSnapshot;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{Envelope, WorkerRequest};
    use crate::worker::handler::NullHandler;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use tokio::io::duplex;

    fn test_config(root: &std::path::Path) -> WorkerConfig {
        WorkerConfig {
            worker_id: "worker-0".to_string(),
            sandbox_root: root.join("worker-0"),
            instance_id: "unused".to_string(),
            key_fingerprint: "unused".to_string(),
            max_concurrent: 10,
            request_timeout_ms: 5_000,
            heartbeat_interval_ms: 50,
            max_memory_bytes: u64::MAX,
            max_requests: u64::MAX,
        }
    }

    #[tokio::test]
    async fn boot_then_session_round_trip_then_kill() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let (supervisor_side, worker_side) = duplex(8192);
        let (sup_read, sup_write) = tokio::io::split(supervisor_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);

        let supervisor_channel = IpcChannel::new(sup_read, sup_write);
        let worker_channel = IpcChannel::new(worker_read, worker_write);

        let worker_task = tokio::spawn(run(worker_channel, config, NullHandler));

        let ready: Envelope<ToSupervisor> = supervisor_channel
            .wait_for(Duration::from_secs(2), |m| matches!(m, ToSupervisor::Ready { .. }))
            .await
            .unwrap();
        assert!(matches!(ready.message, ToSupervisor::Ready { .. }));

        supervisor_channel
            .send(ToWorker::Request {
                request: WorkerRequest {
                    request_id: "r-1".to_string(),
                    user_id: "user-a".to_string(),
                    kind: RequestKind::SessionSet,
                    payload: serde_json::json!({"name": "prefs", "value": {"theme": "dark"}}),
                    timeout_ms: None,
                },
            })
            .await
            .unwrap();

        let response: Envelope<ToSupervisor> = supervisor_channel
            .wait_for(Duration::from_secs(2), |m| matches!(m, ToSupervisor::Response { .. }))
            .await
            .unwrap();
        match response.message {
            ToSupervisor::Response { response } => assert!(response.success),
            other => panic!("unexpected message: {other:?}"),
        }

        supervisor_channel.send(ToWorker::Kill).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), worker_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let _ = PathBuf::new();
    }
}
