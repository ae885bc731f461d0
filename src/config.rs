//! Supervisor and worker configuration, with the defaults table from the design spec.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Pool-wide configuration, owned by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub sandbox_base_dir: PathBuf,
    pub max_concurrent: usize,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_memory_bytes: u64,
    pub max_requests: u64,
    pub restart_delay_ms: u64,
    pub max_restart_attempts: usize,
    pub restart_window_ms: u64,
    pub virtual_nodes: u32,
    /// Path to the worker binary the supervisor forks. Defaults to the
    /// sibling `moltbot-worker` binary next to the running executable.
    pub worker_binary: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            sandbox_base_dir: default_sandbox_base_dir(),
            max_concurrent: 10,
            request_timeout_ms: 120_000,
            heartbeat_interval_ms: 5_000,
            max_memory_bytes: 512 * 1024 * 1024,
            max_requests: 10_000,
            restart_delay_ms: 1_000,
            max_restart_attempts: 5,
            restart_window_ms: 60_000,
            virtual_nodes: 150,
            worker_binary: None,
        }
    }
}

impl PoolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    /// Apply environment-variable overrides, following the teacher's
    /// dotenvy-backed configuration convention. Unset or unparsable
    /// variables leave the existing field untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MOLTBOT_WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                self.worker_count = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_SANDBOX_BASE_DIR") {
            self.sandbox_base_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MOLTBOT_MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                self.max_concurrent = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_REQUEST_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.request_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_HEARTBEAT_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.heartbeat_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_MAX_MEMORY_BYTES") {
            if let Ok(n) = v.parse() {
                self.max_memory_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_MAX_REQUESTS") {
            if let Ok(n) = v.parse() {
                self.max_requests = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_RESTART_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.restart_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_MAX_RESTART_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.max_restart_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_RESTART_WINDOW_MS") {
            if let Ok(n) = v.parse() {
                self.restart_window_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_VIRTUAL_NODES") {
            if let Ok(n) = v.parse() {
                self.virtual_nodes = n;
            }
        }
        if let Ok(v) = std::env::var("MOLTBOT_WORKER_BINARY") {
            self.worker_binary = Some(PathBuf::from(v));
        }
    }

    /// A `WorkerConfig` carrying this pool's policy knobs with identity
    /// fields left blank, filled in once a sandbox exists for the slot.
    pub fn worker_config_template(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: String::new(),
            sandbox_root: PathBuf::new(),
            instance_id: String::new(),
            key_fingerprint: String::new(),
            max_concurrent: self.max_concurrent,
            request_timeout_ms: self.request_timeout_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            max_memory_bytes: self.max_memory_bytes,
            max_requests: self.max_requests,
        }
    }
}

fn default_sandbox_base_dir() -> PathBuf {
    std::env::temp_dir().join("moltbot-workers")
}

/// Per-worker policy knobs handed to the child at `Init` time. A subset of
/// `PoolConfig`, plus the worker's own identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub sandbox_root: PathBuf,
    pub instance_id: String,
    pub key_fingerprint: String,
    pub max_concurrent: usize,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_memory_bytes: u64,
    pub max_requests: u64,
}
