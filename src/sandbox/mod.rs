//! Per-worker sandbox: filesystem layout, persistent instance identity, and
//! the environment overlay a child inherits.
//!
//! The directory layout and metadata shape follow the design spec's §3/§6
//! tables directly. The general approach — a typed spec describing a root
//! directory plus named subdirectories, with sanitizing path helpers guarding
//! every externally-supplied name — is grounded in the sandbox types seen
//! across the retrieval pack's isolation-focused examples.

mod manager;

pub use manager::SandboxManager;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::PoolResult;

const SUBDIRS: &[&str] = &[
    "sessions",
    "temp",
    "cache",
    "state",
    "logs",
    "credentials",
    "config",
    "keys",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub worker_id: String,
    pub created_at: u64,
    pub last_accessed: u64,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
}

/// A worker's private root directory and its derived environment.
pub struct Sandbox {
    worker_id: String,
    root: PathBuf,
}

impl Sandbox {
    pub fn new(worker_id: impl Into<String>, base_dir: impl AsRef<Path>) -> Self {
        let worker_id = worker_id.into();
        let root = base_dir.as_ref().join(&worker_id);
        Self { worker_id, root }
    }

    /// Builds a sandbox handle from its root directory directly, rather than
    /// a base directory the worker id is joined onto. Used by the worker
    /// process itself, which receives its own already-joined `sandboxRoot`.
    pub fn from_root(worker_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            worker_id: worker_id.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn subdir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.subdir("sessions")
    }
    pub fn temp_dir(&self) -> PathBuf {
        self.subdir("temp")
    }
    pub fn cache_dir(&self) -> PathBuf {
        self.subdir("cache")
    }
    pub fn state_dir(&self) -> PathBuf {
        self.subdir("state")
    }
    pub fn logs_dir(&self) -> PathBuf {
        self.subdir("logs")
    }
    pub fn credentials_dir(&self) -> PathBuf {
        self.subdir("credentials")
    }
    pub fn config_dir(&self) -> PathBuf {
        self.subdir("config")
    }
    pub fn keys_dir(&self) -> PathBuf {
        self.subdir("keys")
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join("sandbox.json")
    }

    /// Idempotent: recreates subdirectories, ensures instance keys exist, and
    /// writes `sandbox.json`, preserving `created_at` across re-initialization.
    pub fn init(&self) -> PoolResult<SandboxMetadata> {
        std::fs::create_dir_all(&self.root)?;
        for dir in SUBDIRS {
            std::fs::create_dir_all(self.subdir(dir))?;
        }

        let existing = self.read_metadata();
        let created_at = existing
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or_else(now_unix_ms);

        let (_, instance_id, fingerprint) = self.ensure_instance_identity()?;
        let _ = instance_id;

        let metadata = SandboxMetadata {
            worker_id: self.worker_id.clone(),
            created_at,
            last_accessed: now_unix_ms(),
            version: 1,
            key_fingerprint: Some(fingerprint),
        };
        self.write_metadata(&metadata)?;
        Ok(metadata)
    }

    fn read_metadata(&self) -> Option<SandboxMetadata> {
        let bytes = std::fs::read(self.metadata_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_metadata(&self, metadata: &SandboxMetadata) -> PoolResult<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        std::fs::write(self.metadata_path(), json)?;
        Ok(())
    }

    /// Creates `keys/instance.key` and `keys/instance.id` on first call;
    /// reuses them on subsequent calls, so the worker's identity survives
    /// process restarts as long as the sandbox root is not destroyed.
    pub fn ensure_instance_identity(&self) -> PoolResult<(String, String, String)> {
        let keys_dir = self.keys_dir();
        std::fs::create_dir_all(&keys_dir)?;

        let key_path = keys_dir.join("instance.key");
        let id_path = keys_dir.join("instance.id");

        let key_hex = match std::fs::read_to_string(&key_path) {
            Ok(existing) => existing.trim().to_string(),
            Err(_) => {
                let mut bytes = [0u8; 32];
                rand::rng().fill_bytes(&mut bytes);
                let hex = hex_encode(&bytes);
                write_secret_file(&key_path, &hex)?;
                hex
            }
        };

        let instance_id = match std::fs::read_to_string(&id_path) {
            Ok(existing) => existing.trim().to_string(),
            Err(_) => {
                let mut suffix = [0u8; 4];
                rand::rng().fill_bytes(&mut suffix);
                let id = format!(
                    "{}-{}-{}",
                    self.worker_id,
                    now_unix_ms(),
                    hex_encode(&suffix)
                );
                write_secret_file(&id_path, &id)?;
                id
            }
        };

        let fingerprint = fingerprint_of(&key_hex);
        Ok((key_hex, instance_id, fingerprint))
    }

    /// Sanitizes a session id to `[A-Za-z0-9_-]` and joins it under `sessions/`.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.json", sanitize(session_id, false)))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.state_dir()
            .join(format!("{}.json", sanitize(name, true)))
    }

    pub fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir().join(sanitize(name, true))
    }

    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.temp_dir().join(sanitize(name, true))
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("{}.log", sanitize(name, true)))
    }

    pub fn credentials_path(&self, name: &str) -> PathBuf {
        self.credentials_dir().join(sanitize(name, true))
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir().join(sanitize(name, true))
    }

    /// Returns parsed JSON, or `None` if the file is missing or unreadable —
    /// never surfaces an error to the caller.
    pub fn read_state(&self, name: &str) -> Option<serde_json::Value> {
        let bytes = std::fs::read(self.state_path(name)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn write_state(&self, name: &str, value: &serde_json::Value) -> PoolResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        std::fs::write(self.state_path(name), json)?;
        Ok(())
    }

    pub fn delete_state(&self, name: &str) -> PoolResult<()> {
        let path = self.state_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Session storage lives under `sessions/`, distinct from the general
    /// `state/` store above — this is what `list_sessions` enumerates, so
    /// get/set/delete have to target the same directory or `list` would
    /// never see what `set` wrote.
    pub fn read_session(&self, session_id: &str) -> Option<serde_json::Value> {
        let bytes = std::fs::read(self.session_path(session_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn write_session(&self, session_id: &str, value: &serde_json::Value) -> PoolResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        std::fs::write(self.session_path(session_id), json)?;
        Ok(())
    }

    pub fn delete_session(&self, session_id: &str) -> PoolResult<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Lists the sanitized session ids currently stored under `sessions/`,
    /// stripping the `.json` suffix. This crate's reading of the spec's
    /// otherwise-underspecified `list` session operation.
    pub fn list_sessions(&self) -> PoolResult<Vec<String>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stripped) = name.strip_suffix(".json") {
                    names.push(stripped.to_string());
                }
            }
        }
        Ok(names)
    }

    pub fn touch(&self) -> PoolResult<()> {
        let mut metadata = self.read_metadata().unwrap_or(SandboxMetadata {
            worker_id: self.worker_id.clone(),
            created_at: now_unix_ms(),
            last_accessed: now_unix_ms(),
            version: 1,
            key_fingerprint: None,
        });
        metadata.last_accessed = now_unix_ms();
        self.write_metadata(&metadata)
    }

    pub fn last_accessed(&self) -> Option<u64> {
        self.read_metadata().map(|m| m.last_accessed)
    }

    pub fn clear_temp(&self) -> PoolResult<()> {
        recreate_dir(&self.temp_dir())
    }

    pub fn clear_cache(&self) -> PoolResult<()> {
        recreate_dir(&self.cache_dir())
    }

    pub fn destroy(&self) -> PoolResult<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// The environment overlay the supervisor merges into the child's
    /// environment. Re-roots the standard XDG/tempdir variables and an
    /// app-specific credentials pointer inside the sandbox, so any
    /// downstream library honoring them is automatically isolated.
    pub fn environment(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("MOLTBOT_WORKER_ID".to_string(), self.worker_id.clone());
        env.insert(
            "MOLTBOT_SANDBOX_ROOT".to_string(),
            self.root.display().to_string(),
        );
        env.insert(
            "MOLTBOT_SESSIONS_DIR".to_string(),
            self.sessions_dir().display().to_string(),
        );
        env.insert(
            "MOLTBOT_TEMP_DIR".to_string(),
            self.temp_dir().display().to_string(),
        );
        env.insert(
            "MOLTBOT_CACHE_DIR".to_string(),
            self.cache_dir().display().to_string(),
        );
        env.insert(
            "MOLTBOT_STATE_DIR".to_string(),
            self.state_dir().display().to_string(),
        );
        env.insert(
            "MOLTBOT_LOGS_DIR".to_string(),
            self.logs_dir().display().to_string(),
        );
        env.insert(
            "MOLTBOT_CREDENTIALS_DIR".to_string(),
            self.credentials_dir().display().to_string(),
        );
        env.insert(
            "MOLTBOT_CONFIG_DIR".to_string(),
            self.config_dir().display().to_string(),
        );
        env.insert(
            "MOLTBOT_KEYS_DIR".to_string(),
            self.keys_dir().display().to_string(),
        );

        // Re-root well-known XDG/tempdir variables so any library that
        // honors them can't escape the sandbox.
        env.insert(
            "XDG_CONFIG_HOME".to_string(),
            self.config_dir().display().to_string(),
        );
        env.insert(
            "XDG_CACHE_HOME".to_string(),
            self.cache_dir().display().to_string(),
        );
        env.insert(
            "XDG_STATE_HOME".to_string(),
            self.state_dir().display().to_string(),
        );
        env.insert("TMPDIR".to_string(), self.temp_dir().display().to_string());
        env.insert(
            "MOLTBOT_CREDENTIALS_HOME".to_string(),
            self.credentials_dir().display().to_string(),
        );

        env
    }
}

fn recreate_dir(path: &Path) -> PoolResult<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(unix)]
fn write_secret_file(path: &Path, contents: &str) -> PoolResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_secret_file(path: &Path, contents: &str) -> PoolResult<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// First 8 bytes of the hex-encoded private key, i.e. its first 16 hex chars.
fn fingerprint_of(key_hex: &str) -> String {
    key_hex.chars().take(16).collect()
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Replaces every character outside the allowed set with `_`. This is the
/// sandbox's sole path-traversal defense: no sanitized name can contain `/`
/// or `..`, so a joined path can never escape its parent subdirectory.
fn sanitize(name: &str, allow_dot: bool) -> String {
    name.chars()
        .map(|c| {
            let allowed = c.is_ascii_alphanumeric()
                || c == '_'
                || c == '-'
                || (allow_dot && c == '.');
            if allowed {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_strips_traversal_and_separators() {
        let sanitized = sanitize("../../../etc/passwd", true);
        assert!(!sanitized.contains('/'));
        assert!(!sanitized.contains(".."));
    }

    #[test]
    fn session_write_is_visible_to_list_and_read() {
        let dir = tempdir().unwrap();
        let sandbox = Sandbox::new("worker-0", dir.path());
        sandbox.init().unwrap();

        sandbox
            .write_session("prefs", &serde_json::json!({"theme": "dark"}))
            .unwrap();
        assert_eq!(sandbox.list_sessions().unwrap(), vec!["prefs".to_string()]);
        assert_eq!(
            sandbox.read_session("prefs").unwrap()["theme"],
            "dark"
        );

        sandbox.delete_session("prefs").unwrap();
        assert!(sandbox.list_sessions().unwrap().is_empty());
        assert!(sandbox.read_session("prefs").is_none());
    }

    #[test]
    fn session_path_stays_under_sessions_dir() {
        let dir = tempdir().unwrap();
        let sandbox = Sandbox::new("worker-0", dir.path());
        sandbox.init().unwrap();
        let path = sandbox.session_path("../../../etc/passwd");
        assert!(path.starts_with(sandbox.sessions_dir()));
        assert!(!path
            .strip_prefix(sandbox.sessions_dir())
            .unwrap()
            .to_string_lossy()
            .contains('/'));
    }

    #[test]
    fn init_twice_preserves_created_at_and_key() {
        let dir = tempdir().unwrap();
        let sandbox = Sandbox::new("worker-0", dir.path());
        let first = sandbox.init().unwrap();
        let (key1, _, _) = sandbox.ensure_instance_identity().unwrap();
        let second = sandbox.init().unwrap();
        let (key2, _, _) = sandbox.ensure_instance_identity().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(key1, key2);
    }

    #[test]
    fn destroy_then_reinit_gets_new_created_at() {
        let dir = tempdir().unwrap();
        let sandbox = Sandbox::new("worker-0", dir.path());
        let first = sandbox.init().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sandbox.destroy().unwrap();
        let second = sandbox.init().unwrap();
        assert!(second.created_at > first.created_at);
    }

    #[test]
    fn environment_overlay_points_inside_sandbox() {
        let dir = tempdir().unwrap();
        let sandbox = Sandbox::new("worker-0", dir.path());
        sandbox.init().unwrap();
        let env = sandbox.environment();
        assert_eq!(env["MOLTBOT_WORKER_ID"], "worker-0");
        assert!(env["XDG_CACHE_HOME"].starts_with(&sandbox.root().display().to_string()));
    }
}
