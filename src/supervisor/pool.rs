//! The worker pool supervisor: spawns, monitors, restarts, and drains
//! worker-<i> slots, and routes requests to them through the sticky router.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::ipc::message::{ToSupervisor, ToWorker, WorkerRequest, WorkerState};
use crate::ipc::IpcChannel;
use crate::router::StickyRouter;
use crate::sandbox::SandboxManager;

use super::env_filter;
use super::record::{PendingRequest, WorkerChannel, WorkerSlot};

/// A request handed to the pool by the gateway facade, prior to routing.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub user_id: String,
    pub kind: crate::ipc::message::RequestKind,
    pub payload: serde_json::Value,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WorkerHealthEntry {
    pub worker_id: String,
    pub health: crate::ipc::message::HealthSnapshot,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub busy_workers: usize,
    pub queued_requests: usize,
    pub routing_table_size: usize,
    pub workers: Vec<WorkerHealthEntry>,
}

pub struct WorkerPool {
    config: PoolConfig,
    router: Arc<StickyRouter>,
    sandbox_manager: SandboxManager,
    slots: DashMap<String, Arc<WorkerSlot>>,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let router = Arc::new(StickyRouter::new(config.virtual_nodes));
        let sandbox_manager = SandboxManager::new(config.sandbox_base_dir.clone());
        Self {
            config,
            router,
            sandbox_manager,
            slots: DashMap::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &Arc<StickyRouter> {
        &self.router
    }

    fn worker_ids(&self) -> Vec<String> {
        (0..self.config.worker_count)
            .map(|i| format!("worker-{i}"))
            .collect()
    }

    fn worker_binary_path(&self) -> PathBuf {
        if let Some(path) = &self.config.worker_binary {
            return path.clone();
        }
        let mut path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("moltbot-worker"));
        path.set_file_name(if cfg!(windows) {
            "moltbot-worker.exe"
        } else {
            "moltbot-worker"
        });
        path
    }

    /// Registers every slot with the router, then spawns all slots in
    /// parallel. Resolves once every slot has reached `Ready`, or fails with
    /// a startup timeout/failure for whichever slot did not.
    pub async fn start(self: Arc<Self>) -> PoolResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::PoolAlreadyStarted);
        }

        self.sandbox_manager.ensure_base_dir()?;

        for worker_id in self.worker_ids() {
            self.router.add_worker(&worker_id);
            self.slots.insert(
                worker_id.clone(),
                Arc::new(WorkerSlot::new(worker_id, self.config.worker_config_template())),
            );
        }

        let mut handles = Vec::new();
        for worker_id in self.worker_ids() {
            let pool = self.clone();
            handles.push(tokio::spawn(async move { pool.spawn_slot(&worker_id).await }));
        }
        for (worker_id, handle) in self.worker_ids().into_iter().zip(handles) {
            handle
                .await
                .map_err(|e| PoolError::WorkerStartupFailure(worker_id.clone(), e.to_string()))??;
        }

        info!(workers = self.config.worker_count, "pool started");
        Ok(())
    }

    async fn spawn_slot(self: Arc<Self>, worker_id: &str) -> PoolResult<()> {
        let slot = self
            .slots
            .get(worker_id)
            .map(|r| r.clone())
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;

        let sandbox = self.sandbox_manager.sandbox_for(worker_id);
        sandbox.init()?;
        let (_, instance_id, fingerprint) = sandbox.ensure_instance_identity()?;

        let worker_config = crate::config::WorkerConfig {
            worker_id: worker_id.to_string(),
            sandbox_root: sandbox.root().to_path_buf(),
            instance_id,
            key_fingerprint: fingerprint,
            max_concurrent: self.config.max_concurrent,
            request_timeout_ms: self.config.request_timeout_ms,
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            max_memory_bytes: self.config.max_memory_bytes,
            max_requests: self.config.max_requests,
        };
        *slot.config.lock() = worker_config.clone();
        slot.set_state(WorkerState::Starting);

        let mut command = Command::new(self.worker_binary_path());
        command
            .env_clear()
            .envs(env_filter::filtered_environment())
            .envs(sandbox.environment())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PoolError::WorkerStartupFailure(worker_id.to_string(), e.to_string()))?;
        slot.pid.store(child.id().unwrap_or(0), Ordering::Relaxed);

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take();

        let channel: Arc<WorkerChannel> = Arc::new(IpcChannel::new(stdout, stdin));
        channel
            .send(ToWorker::Init {
                config: worker_config,
            })
            .await?;
        *slot.channel.write() = Some(channel.clone());

        if let Some(stderr) = stderr {
            let worker_id = worker_id.to_string();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker_id = %worker_id, "{line}");
                }
            });
        }

        let reader_pool = self.clone();
        let reader_worker_id = worker_id.to_string();
        let reader_channel = channel.clone();
        tokio::spawn(async move {
            reader_pool.reader_loop(reader_worker_id, reader_channel).await;
        });

        let exit_pool = self.clone();
        let exit_worker_id = worker_id.to_string();
        let exit_slot = slot.clone();
        tokio::spawn(async move {
            exit_pool.exit_watch(exit_worker_id, exit_slot, child).await;
        });

        self.wait_until_ready(&slot, Duration::from_secs(30)).await
    }

    async fn wait_until_ready(&self, slot: &Arc<WorkerSlot>, timeout: Duration) -> PoolResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match slot.state() {
                WorkerState::Ready => return Ok(()),
                WorkerState::Crashed => {
                    return Err(PoolError::WorkerStartupFailure(
                        slot.worker_id.clone(),
                        "worker crashed during startup".to_string(),
                    ))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(PoolError::WorkerStartupTimeout(slot.worker_id.clone()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Reads worker -> supervisor messages for one slot until the channel
    /// closes. Runs for the lifetime of a single child process; a restart
    /// spawns a fresh reader against the new channel.
    async fn reader_loop(self: Arc<Self>, worker_id: String, channel: Arc<WorkerChannel>) {
        loop {
            let envelope = match channel.recv::<ToSupervisor>().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "ipc read error");
                    break;
                }
            };

            let Some(slot) = self.slots.get(&worker_id).map(|r| r.clone()) else {
                break;
            };

            match envelope.message {
                ToSupervisor::Ready { .. } => {
                    slot.set_state(WorkerState::Ready);
                    info!(worker_id = %worker_id, "worker:ready");
                    self.update_healthy_gauge();
                }
                ToSupervisor::Response { response } => {
                    if let Some(pending) = slot.take_pending(&response.request_id) {
                        let result = if response.success {
                            Ok(response.payload.unwrap_or(serde_json::Value::Null))
                        } else {
                            Err(PoolError::HandlerError(
                                response.error.unwrap_or_else(|| "unknown error".to_string()),
                            ))
                        };
                        let _ = pending.responder.send(result);
                    } else {
                        warn!(worker_id = %worker_id, request_id = %response.request_id, "response for unknown request id");
                    }
                }
                ToSupervisor::Health { health } => {
                    slot.set_state(health.state);
                    *slot.health.lock() = Some(health);
                    self.update_healthy_gauge();
                }
                ToSupervisor::Heartbeat { health, .. } => {
                    let mut guard = slot.health.lock();
                    match guard.as_mut() {
                        Some(existing) => {
                            existing.state = health.state;
                            existing.active_requests = health.active_requests;
                            existing.memory_bytes = health.memory_bytes;
                            existing.requests_processed = health.requests_processed;
                            existing.last_heartbeat_ms = crate::ipc::message::now_unix_ms();
                        }
                        None => {
                            *guard = Some(crate::ipc::message::HealthSnapshot {
                                pid: None,
                                state: health.state,
                                memory_bytes: health.memory_bytes,
                                requests_processed: health.requests_processed,
                                active_requests: health.active_requests,
                                last_heartbeat_ms: crate::ipc::message::now_unix_ms(),
                                uptime_ms: 0,
                                error_count: 0,
                                cpu_usage: 0.0,
                            });
                        }
                    }
                }
                ToSupervisor::Error { message, fatal, .. } => {
                    error!(worker_id = %worker_id, fatal, "{message}");
                    if fatal {
                        slot.set_state(WorkerState::Crashed);
                        self.update_healthy_gauge();
                    }
                }
                ToSupervisor::Event { event } => {
                    if matches!(event.reason, crate::ipc::message::EventReason::Stopped) {
                        slot.set_state(WorkerState::Stopped);
                        info!(worker_id = %worker_id, "worker:stopped");
                        self.update_healthy_gauge();
                    } else {
                        info!(worker_id = %worker_id, reason = %event.reason, "worker event");
                    }
                }
            }
        }
    }

    /// Recomputes the count of `Ready`/`Busy` slots and publishes it to the
    /// `moltbot_pool_healthy_workers` gauge. Called after every state
    /// transition that can change which slots are dispatchable.
    fn update_healthy_gauge(&self) {
        let healthy = self
            .slots
            .iter()
            .filter(|entry| entry.value().is_dispatchable())
            .count();
        crate::metrics::set_healthy_workers(healthy as u64);
    }

    /// Owns the `Child` exclusively: waits for natural exit or a kill
    /// request, then runs the restart policy.
    async fn exit_watch(self: Arc<Self>, worker_id: String, slot: Arc<WorkerSlot>, mut child: tokio::process::Child) {
        loop {
            tokio::select! {
                status = child.wait() => {
                    info!(worker_id = %worker_id, ?status, "child exited");
                    break;
                }
                _ = slot.kill_notify.notified() => {
                    let _ = child.start_kill();
                }
            }
        }

        self.on_worker_exit(&worker_id, &slot).await;
    }

    async fn on_worker_exit(self: Arc<Self>, worker_id: &str, slot: &Arc<WorkerSlot>) {
        for (request_id, pending) in slot.drain_pending() {
            let _ = pending
                .responder
                .send(Err(PoolError::WorkerExited(worker_id.to_string(), request_id)));
        }
        *slot.channel.write() = None;
        slot.pid.store(0, Ordering::Relaxed);

        // A fatal Error{fatal:true} report (ToSupervisor::Error handling,
        // above) marks the slot Crashed ahead of the process actually
        // exiting, but that's not the terminal state — only restart-budget
        // exhaustion below is. Overwrite it with Stopped so the exit still
        // runs the ordinary restart policy.
        slot.set_state(WorkerState::Stopped);
        self.update_healthy_gauge();

        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let attempts = slot.record_restart_attempt(self.config.restart_window());
        if attempts >= self.config.max_restart_attempts {
            slot.set_state(WorkerState::Crashed);
            error!(worker_id = %worker_id, attempts, "worker:crash, restart budget exhausted");
            crate::metrics::record_crash(worker_id);
            self.update_healthy_gauge();
            return;
        }

        tokio::time::sleep(self.config.restart_delay()).await;
        let restart_count = slot.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(worker_id = %worker_id, restart_count, "worker:restart");
        crate::metrics::record_restart(worker_id);

        let pool = self.clone();
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool.spawn_slot(&worker_id).await {
                error!(worker_id = %worker_id, error = %e, "restart failed");
            }
        });
    }

    /// Routes, dispatches, and awaits the response for one request.
    pub async fn dispatch(&self, request: PoolRequest) -> PoolResult<serde_json::Value> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(PoolError::PoolNotStarted);
        }

        let decision = self.router.route(&request.user_id)?;
        let mut worker_id = decision.worker_id;

        let slot = match self.slots.get(&worker_id).map(|r| r.clone()) {
            Some(slot) if slot.is_dispatchable() => slot,
            _ => {
                let fallback = self
                    .slots
                    .iter()
                    .find(|entry| entry.value().is_dispatchable())
                    .map(|entry| entry.value().clone())
                    .ok_or(PoolError::NoHealthyWorkers)?;
                self.router.force_assign(&request.user_id, &fallback.worker_id)?;
                worker_id = fallback.worker_id.clone();
                fallback
            }
        };

        let channel = slot.channel().ok_or(PoolError::NoHealthyWorkers)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let timeout = Duration::from_millis(
            request
                .timeout_ms
                .unwrap_or(self.config.request_timeout_ms),
        );

        let (tx, rx) = oneshot::channel();
        slot.pending
            .lock()
            .insert(request_id.clone(), PendingRequest { responder: tx });

        channel
            .send(ToWorker::Request {
                request: WorkerRequest {
                    request_id: request_id.clone(),
                    user_id: request.user_id.clone(),
                    kind: request.kind,
                    payload: request.payload,
                    timeout_ms: request.timeout_ms,
                },
            })
            .await?;

        let dispatch_start = Instant::now();
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::WorkerExited(worker_id.clone(), request_id.clone())),
            Err(_) => {
                slot.take_pending(&request_id);
                Err(PoolError::RequestTimeout(request_id.clone()))
            }
        };

        crate::metrics::record_dispatch(
            &worker_id,
            outcome.is_ok(),
            dispatch_start.elapsed().as_millis() as u64,
        );
        outcome
    }

    /// Sends `Shutdown` to every live worker, waits up to `grace + 1s` for
    /// exit, force-killing any stragglers, then clears the pool.
    pub async fn stop(&self, grace: Duration) -> PoolResult<()> {
        self.stopping.store(true, Ordering::SeqCst);

        for entry in self.slots.iter() {
            let slot = entry.value();
            if let Some(channel) = slot.channel() {
                let _ = channel
                    .send(ToWorker::Shutdown {
                        grace_period_ms: grace.as_millis() as u64,
                    })
                    .await;
            }
        }

        let deadline = Instant::now() + grace + Duration::from_secs(1);
        for entry in self.slots.iter() {
            let slot = entry.value().clone();
            while slot.state() != WorkerState::Stopped && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if slot.state() != WorkerState::Stopped {
                slot.kill_notify.notify_one();
            }
        }

        self.slots.clear();
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        let mut workers = Vec::new();
        let mut healthy = 0;
        let mut busy = 0;
        let mut queued = 0;

        for entry in self.slots.iter() {
            let slot = entry.value();
            let state = slot.state();
            if matches!(state, WorkerState::Ready | WorkerState::Busy) {
                healthy += 1;
            }
            if matches!(state, WorkerState::Busy) {
                busy += 1;
            }
            queued += slot.pending.lock().len();
            workers.push(WorkerHealthEntry {
                worker_id: slot.worker_id.clone(),
                health: slot.health_or_placeholder(),
            });
        }

        crate::metrics::set_healthy_workers(healthy as u64);

        PoolStatus {
            total_workers: self.slots.len(),
            healthy_workers: healthy,
            busy_workers: busy,
            queued_requests: queued,
            routing_table_size: self.router.routing_table_size(),
            workers,
        }
    }

    pub fn worker_state(&self, worker_id: &str) -> Option<WorkerState> {
        self.slots.get(worker_id).map(|slot| slot.state())
    }
}
