//! # strata-cas
//!
//! Buffered content-addressed chunk storage for Strata.
//!
//! Chunks are immutable byte strings named by a digest of their content.
//! Writes land synchronously in a bounded FIFO memory cache and are
//! persisted to a durable tier in the background; reads prefer the cache
//! and fall back to the durable tier.
//!
//! ## Layers
//!
//! ```text
//! BufferedChunkStore
//! ├── ChunkCache       FIFO, capacity-bounded, pins chunks awaiting transfer
//! ├── ChunkIndex       cache/durable presence per name, union count & size
//! ├── TransferScheduler  retrying background writes on a TaskQueue
//! └── DurableStore     capacity, removable marks, reference counts
//!     └── BackingStore   FileBackingStore (blake3-style fan-out) | MemoryBackingStore
//! ```
//!
//! ## Durable Layout
//!
//! ```text
//! <root>/
//! └── chunks/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...efgh   # hex chunk name
//! ```

pub mod backing;
pub mod buffered;
pub mod cache;
pub mod index;
pub mod reclaim;
pub mod transfer;
pub mod validation;

pub use backing::{BackingStore, FileBackingStore, MemoryBackingStore};
pub use buffered::{BufferedChunkStore, StoreOptions, StoreStats};
pub use cache::ChunkCache;
pub use index::{ChunkIndex, Durability, IndexEntry};
pub use reclaim::{Admitted, DurableStore};
pub use transfer::{
    default_thread_count, RayonQueue, RetryPolicy, Task, TaskQueue, TransferScheduler,
    TransferStats, WorkerPool,
};
pub use validation::{validation_for, Blake3Validation, ChunkValidation, Sha256Validation};

use std::fmt;
use std::io;

use thiserror::Error;

/// Content-derived chunk identifier.
///
/// The byte length is decided by the validation scheme in use; names are
/// displayed and persisted as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkName(Vec<u8>);

impl ChunkName {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a hex string into a name.
    pub fn from_hex(hex: &str) -> Option<Self> {
        hex::decode(hex).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkName({})", self.to_hex())
    }
}

impl From<&[u8]> for ChunkName {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for ChunkName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Errors that can occur during chunk store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid chunk name: {name:?}")]
    InvalidName { name: String },

    #[error("Invalid content for {name}: {reason}")]
    InvalidContent { name: String, reason: String },

    #[error("Capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    #[error("Chunk not found: {name}")]
    NotFound { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Durable tier not initialized")]
    NotInitialized,

    #[error("Stored content does not match name {name}")]
    Corrupted { name: String },

    #[error("{} chunk(s) could not be made durable", .names.len())]
    NotDurable { names: Vec<String> },
}

impl StoreError {
    pub(crate) fn invalid_name(name: &ChunkName) -> Self {
        StoreError::InvalidName {
            name: name.to_hex(),
        }
    }

    pub(crate) fn invalid_content(name: &ChunkName, reason: impl Into<String>) -> Self {
        StoreError::InvalidContent {
            name: name.to_hex(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(name: &ChunkName) -> Self {
        StoreError::NotFound {
            name: name.to_hex(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves its state consistent before
/// any call that can panic, so a poisoned lock carries valid data.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read a chunk source file, mapping empty or unreadable sources to
/// `InvalidContent`.
pub(crate) fn read_source(name: &ChunkName, path: &std::path::Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) if data.is_empty() => Err(StoreError::invalid_content(name, "source is empty")),
        Ok(data) => Ok(data),
        Err(e) => Err(StoreError::invalid_content(
            name,
            format!("cannot read {}: {}", path.display(), e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hex_roundtrip() {
        let name = ChunkName::from_bytes(*blake3::hash(b"test data").as_bytes());
        let hex = name.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ChunkName::from_hex(&hex), Some(name.clone()));
        assert_eq!(format!("{}", name), hex);
    }

    #[test]
    fn test_name_from_bad_hex() {
        assert!(ChunkName::from_hex("zz").is_none());
        assert!(ChunkName::from_hex("abc").is_none());
    }

    #[test]
    fn test_error_messages() {
        let name = ChunkName::from_bytes(vec![0xab, 0xcd]);
        assert_eq!(
            StoreError::not_found(&name).to_string(),
            "Chunk not found: abcd"
        );
        let err = StoreError::NotDurable {
            names: vec!["aa".into(), "bb".into()],
        };
        assert_eq!(err.to_string(), "2 chunk(s) could not be made durable");
        assert!(StoreError::not_found(&name).is_not_found());
    }

    #[test]
    fn test_read_source_rejects_empty_and_missing() {
        let temp = tempfile::TempDir::new().unwrap();
        let name = ChunkName::from_bytes(vec![1, 2, 3]);

        let empty = temp.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            read_source(&name, &empty),
            Err(StoreError::InvalidContent { .. })
        ));
        assert!(matches!(
            read_source(&name, &temp.path().join("missing")),
            Err(StoreError::InvalidContent { .. })
        ));

        let full = temp.path().join("full");
        std::fs::write(&full, b"abc").unwrap();
        assert_eq!(read_source(&name, &full).unwrap(), b"abc");
    }
}
