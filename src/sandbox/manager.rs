//! Manager-level sandbox maintenance: enumerating and reaping stale sandboxes
//! under a shared base directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::PoolResult;

use super::Sandbox;

pub struct SandboxManager {
    base_dir: PathBuf,
}

impl SandboxManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn sandbox_for(&self, worker_id: &str) -> Sandbox {
        Sandbox::new(worker_id, &self.base_dir)
    }

    pub fn ensure_base_dir(&self) -> PoolResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    /// Destroys every sandbox whose `last_accessed` is older than `now - max_age`,
    /// returning the worker ids removed.
    pub fn cleanup(&self, max_age: Duration) -> PoolResult<Vec<String>> {
        let mut removed = Vec::new();
        if !self.base_dir.exists() {
            return Ok(removed);
        }

        let cutoff = now_unix_ms().saturating_sub(max_age.as_millis() as u64);

        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let worker_id = match entry.file_name().into_string() {
                Ok(s) => s,
                Err(_) => continue,
            };
            let sandbox = self.sandbox_for(&worker_id);
            if let Some(last_accessed) = sandbox.last_accessed() {
                if last_accessed < cutoff {
                    sandbox.destroy()?;
                    removed.push(worker_id);
                }
            }
        }

        Ok(removed)
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cleanup_removes_only_stale_sandboxes() {
        let dir = tempdir().unwrap();
        let manager = SandboxManager::new(dir.path());

        let fresh = manager.sandbox_for("worker-fresh");
        fresh.init().unwrap();

        let stale = manager.sandbox_for("worker-stale");
        stale.init().unwrap();
        // Force an old last_accessed by writing metadata directly.
        let mut metadata = stale.init().unwrap();
        metadata.last_accessed = 0;
        std::fs::write(
            stale.root().join("sandbox.json"),
            serde_json::to_vec_pretty(&metadata).unwrap(),
        )
        .unwrap();

        let removed = manager.cleanup(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, vec!["worker-stale".to_string()]);
        assert!(!stale.root().exists());
        assert!(fresh.root().exists());
    }
}
