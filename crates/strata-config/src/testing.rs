//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary chunk directories for the durable tier
//! - A scratch directory for source files fed to `store_file`
//! - A matching [`Config`](crate::Config)
//!
//! # Usage
//!
//! ```ignore
//! use strata_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.chunk_dir and env.scratch_dir are isolated and removed on drop
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Durable tier root
    pub chunk_dir: PathBuf,
    /// Scratch space for source files
    pub scratch_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let chunk_dir = root.join(format!("chunks-{}", test_id));
        let scratch_dir = root.join("scratch");

        std::fs::create_dir_all(&chunk_dir)?;
        std::fs::create_dir_all(&scratch_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            chunk_dir,
            scratch_dir,
            test_id,
        })
    }

    /// Write a scratch file with the given content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Path inside the scratch directory that does not exist yet
    pub fn scratch_path(&self, relative_path: &str) -> PathBuf {
        self.scratch_dir.join(relative_path)
    }

    /// Config pointing the durable tier at this environment's chunk directory.
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.storage.root = self.chunk_dir.clone();
        cfg.transfer.workers = Some(2);
        cfg.transfer.backoff_ms = 1;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.chunk_dir.exists());
        assert!(env.scratch_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_chunk_dir() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.chunk_dir, env2.chunk_dir);
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("nested/chunk.dat", b"payload").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert!(!env.scratch_path("missing.dat").exists());
    }

    #[test]
    fn test_config_points_at_chunk_dir() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.storage.root, env.chunk_dir);
        assert_eq!(cfg.resolved_root(), env.chunk_dir);
    }
}
