//! Durable backing stores.
//!
//! A [`BackingStore`] is raw chunk persistence with no caching, capacity
//! policy or background work; [`DurableStore`](crate::DurableStore) layers
//! those on top.
//!
//! - [`FileBackingStore`]: one file per chunk under a 2-level hex fan-out
//! - [`MemoryBackingStore`]: concurrent in-memory map, for tests and
//!   ephemeral stores

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::instrument;

use crate::{ChunkName, Result, StoreError};

/// Raw durable chunk persistence.
pub trait BackingStore: Send + Sync + fmt::Debug {
    /// Persist `content` under `name`. Writing an existing name is a no-op.
    fn put(&self, name: &ChunkName, content: &[u8]) -> Result<()>;

    /// Read the full content of `name`.
    fn get(&self, name: &ChunkName) -> Result<Vec<u8>>;

    /// Remove `name`, failing with `NotFound` if it is absent.
    fn delete(&self, name: &ChunkName) -> Result<()>;

    fn has(&self, name: &ChunkName) -> bool;

    /// Every stored chunk with its size in bytes.
    fn list(&self) -> Result<Vec<(ChunkName, u64)>>;

    fn count(&self) -> Result<u64> {
        Ok(self.list()?.len() as u64)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|(_, size)| size).sum())
    }

    /// Physical capacity limit in bytes, 0 if unbounded.
    fn capacity(&self) -> u64 {
        0
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// Distinguishes temp files written by concurrent puts from the same thread.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Chunk-per-file store.
///
/// Layout: `<root>/chunks/ab/cd/<hex name>`. Writes go through a temp file
/// and an atomic rename, so a reader never observes a partial chunk.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    root: PathBuf,
}

impl FileBackingStore {
    /// Open a store at the given root directory, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("chunks"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where a chunk with the given name is stored.
    pub fn chunk_path(&self, name: &ChunkName) -> PathBuf {
        let hex = name.to_hex();
        let base = self.root.join("chunks");
        if hex.len() < 4 {
            return base.join(hex);
        }
        let l1 = &hex[..2];
        let l2 = &hex[2..4];
        base.join(l1).join(l2).join(&hex)
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_name = format!(
            "{}.{}.{:?}.{}.tmp",
            file_name,
            std::process::id(),
            std::thread::current().id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        path.with_file_name(temp_name)
    }
}

impl BackingStore for FileBackingStore {
    #[instrument(skip(self, content), level = "debug")]
    fn put(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        let path = self.chunk_path(name);

        // Deduplication: content addressing makes an existing file final
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = Self::temp_path_for(&path);
        let written = File::create(&temp_path).and_then(|mut file| {
            file.write_all(content)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }

        // Atomic rename - if another writer beat us, the content is the same
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            if path.exists() {
                return Ok(());
            }
            return Err(StoreError::Io(e));
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn get(&self, name: &ChunkName) -> Result<Vec<u8>> {
        match fs::read(self.chunk_path(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::not_found(name)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn delete(&self, name: &ChunkName) -> Result<()> {
        match fs::remove_file(self.chunk_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::not_found(name)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn has(&self, name: &ChunkName) -> bool {
        self.chunk_path(name).is_file()
    }

    /// Walks `chunks/ab/cd/*`, skipping temp files and foreign names.
    fn list(&self) -> Result<Vec<(ChunkName, u64)>> {
        let mut chunks = Vec::new();
        for entry in walkdir::WalkDir::new(self.root.join("chunks")).min_depth(1) {
            let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(ChunkName::from_hex)
            else {
                continue;
            };
            let size = entry
                .metadata()
                .map_err(|e| StoreError::Io(io::Error::other(e)))?
                .len();
            chunks.push((name, size));
        }
        Ok(chunks)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Concurrent in-memory backing store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    chunks: Arc<DashMap<ChunkName, Arc<[u8]>>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackingStore for MemoryBackingStore {
    fn put(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        self.chunks
            .entry(name.clone())
            .or_insert_with(|| Arc::from(content));
        Ok(())
    }

    fn get(&self, name: &ChunkName) -> Result<Vec<u8>> {
        self.chunks
            .get(name)
            .map(|chunk| chunk.to_vec())
            .ok_or_else(|| StoreError::not_found(name))
    }

    fn delete(&self, name: &ChunkName) -> Result<()> {
        self.chunks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(name))
    }

    fn has(&self, name: &ChunkName) -> bool {
        self.chunks.contains_key(name)
    }

    fn list(&self) -> Result<Vec<(ChunkName, u64)>> {
        Ok(self
            .chunks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len() as u64))
            .collect())
    }
}
