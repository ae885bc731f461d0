//! Per-slot bookkeeping the supervisor owns: process handle, lifecycle
//! state, health, pending correlations, and restart history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Notify};

use crate::config::WorkerConfig;
use crate::ipc::message::{HealthSnapshot, WorkerState};
use crate::ipc::IpcChannel;

pub type WorkerChannel = IpcChannel<ChildStdout, ChildStdin>;

pub struct PendingRequest {
    pub responder: oneshot::Sender<crate::errors::PoolResult<serde_json::Value>>,
}

/// One worker slot, `worker-<i>`. The slot outlives any single child process
/// behind it — a restart replaces `child`/`channel` but keeps the id, the
/// sandbox, and the restart history.
pub struct WorkerSlot {
    pub worker_id: String,
    pub config: Mutex<WorkerConfig>,
    pub state: Mutex<WorkerState>,
    pub health: Mutex<Option<HealthSnapshot>>,
    /// Last known pid, reported for status purposes. The `Child` handle
    /// itself is owned exclusively by the slot's exit-watch task.
    pub pid: AtomicU32,
    pub channel: RwLock<Option<Arc<WorkerChannel>>>,
    pub pending: Mutex<HashMap<String, PendingRequest>>,
    pub restart_times: Mutex<VecDeque<Instant>>,
    pub restart_count: AtomicUsize,
    /// Signaled to ask the slot's exit-watch task to `SIGKILL` the current
    /// child. The task, not this struct, owns the `Child` handle.
    pub kill_notify: Notify,
}

impl WorkerSlot {
    pub fn new(worker_id: String, config: WorkerConfig) -> Self {
        Self {
            worker_id,
            config: Mutex::new(config),
            state: Mutex::new(WorkerState::Starting),
            health: Mutex::new(None),
            pid: AtomicU32::new(0),
            channel: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            restart_times: Mutex::new(VecDeque::new()),
            restart_count: AtomicUsize::new(0),
            kill_notify: Notify::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    pub fn is_dispatchable(&self) -> bool {
        matches!(self.state(), WorkerState::Ready | WorkerState::Busy)
    }

    pub fn channel(&self) -> Option<Arc<WorkerChannel>> {
        self.channel.read().clone()
    }

    /// Synthesizes a placeholder health snapshot for a slot that hasn't
    /// reported one yet, so status aggregation never has a hole.
    pub fn health_or_placeholder(&self) -> HealthSnapshot {
        let pid = self.pid.load(Ordering::Relaxed);
        self.health.lock().clone().unwrap_or(HealthSnapshot {
            pid: if pid == 0 { None } else { Some(pid) },
            state: self.state(),
            memory_bytes: 0,
            requests_processed: 0,
            active_requests: 0,
            last_heartbeat_ms: 0,
            uptime_ms: 0,
            error_count: 0,
            cpu_usage: 0.0,
        })
    }

    /// Records `now` in the restart window and evicts entries older than
    /// `window`, returning the window's new length.
    pub fn record_restart_attempt(&self, window: Duration) -> usize {
        let mut times = self.restart_times.lock();
        let now = Instant::now();
        times.push_back(now);
        while let Some(front) = times.front() {
            if now.duration_since(*front) > window {
                times.pop_front();
            } else {
                break;
            }
        }
        times.len()
    }

    pub fn take_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(request_id)
    }

    pub fn drain_pending(&self) -> Vec<(String, PendingRequest)> {
        self.pending.lock().drain().collect()
    }
}
