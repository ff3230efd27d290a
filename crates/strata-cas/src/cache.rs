//! Bounded FIFO chunk cache.
//!
//! Entries are evicted strictly in insertion order. An entry can be
//! *pinned* while its bytes are still on their way to the durable tier;
//! pinned entries are skipped by eviction, and an insert that could only
//! fit by evicting pinned entries is reported as [`Admission::Blocked`]
//! so the caller can wait for the transfer to resolve.
//!
//! `ChunkCache` is not internally synchronised; `BufferedChunkStore` keeps
//! it behind the same lock as the index.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use strata_config::log_cache_debug;

use crate::validation::ChunkValidation;
use crate::{read_source, ChunkName, Result, StoreError};

#[derive(Debug)]
struct CacheEntry {
    bytes: Arc<[u8]>,
    seq: u64,
    pinned: bool,
}

/// Outcome of checking whether `incoming` bytes can be inserted now.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Fits after evicting these entries (oldest first).
    Fits(Vec<ChunkName>),
    /// Would fit, but only once pinned entries are released.
    Blocked,
    /// Larger than the whole cache.
    TooLarge,
}

/// In-memory FIFO chunk cache. A capacity of 0 means unbounded.
#[derive(Debug)]
pub struct ChunkCache {
    entries: HashMap<ChunkName, CacheEntry>,
    /// insertion sequence -> name, oldest first
    order: BTreeMap<u64, ChunkName>,
    next_seq: u64,
    size: u64,
    capacity: u64,
    validation: Arc<dyn ChunkValidation>,
}

impl ChunkCache {
    pub fn new(validation: Arc<dyn ChunkValidation>) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            size: 0,
            capacity: 0,
            validation,
        }
    }

    pub fn with_capacity(validation: Arc<dyn ChunkValidation>, capacity: u64) -> Self {
        let mut cache = Self::new(validation);
        cache.set_capacity(capacity);
        cache
    }

    /// Cache `content` under `name`.
    ///
    /// Re-storing a cached name succeeds without touching the existing
    /// entry, even if `content` differs.
    pub fn store(&mut self, name: &ChunkName, content: &[u8]) -> Result<()> {
        if !self.validation.is_valid(name) {
            return Err(StoreError::invalid_name(name));
        }
        if self.has(name) {
            return Ok(());
        }
        self.check_content(name, content)?;
        self.admit(name.clone(), Arc::from(content), false)
            .map(|_| ())
    }

    /// Cache the content of the file at `path`, removing the file afterwards
    /// if `delete_source` is set and the store succeeded.
    pub fn store_file(&mut self, name: &ChunkName, path: &Path, delete_source: bool) -> Result<()> {
        if !self.validation.is_valid(name) {
            return Err(StoreError::invalid_name(name));
        }
        if !self.has(name) {
            let content = read_source(name, path)?;
            self.check_content(name, &content)?;
            self.admit(name.clone(), Arc::from(content), false)?;
        }
        if delete_source {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub(crate) fn check_content(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        if content.is_empty() {
            return Err(StoreError::invalid_content(name, "content is empty"));
        }
        if !self.validation.is_valid_for_caching(name, content) {
            return Err(StoreError::invalid_content(name, "content does not match name"));
        }
        Ok(())
    }

    /// Decide how `incoming` bytes could be inserted right now.
    pub(crate) fn admission(&self, incoming: u64) -> Admission {
        if self.capacity == 0 || self.size + incoming <= self.capacity {
            return Admission::Fits(Vec::new());
        }
        if incoming > self.capacity {
            return Admission::TooLarge;
        }

        let needed = self.size + incoming - self.capacity;
        let mut freed = 0u64;
        let mut victims = Vec::new();
        for name in self.order.values() {
            let entry = &self.entries[name];
            if entry.pinned {
                continue;
            }
            freed += entry.bytes.len() as u64;
            victims.push(name.clone());
            if freed >= needed {
                return Admission::Fits(victims);
            }
        }
        Admission::Blocked
    }

    /// Insert a new entry, evicting as decided by [`admission`](Self::admission).
    ///
    /// Returns the evicted names. Nothing is evicted if the entry cannot fit.
    pub(crate) fn admit(
        &mut self,
        name: ChunkName,
        bytes: Arc<[u8]>,
        pinned: bool,
    ) -> Result<Vec<ChunkName>> {
        let incoming = bytes.len() as u64;
        let victims = match self.admission(incoming) {
            Admission::Fits(victims) => victims,
            Admission::Blocked | Admission::TooLarge => {
                return Err(StoreError::CapacityExceeded {
                    needed: incoming,
                    available: self.capacity.saturating_sub(self.size),
                })
            }
        };

        for victim in &victims {
            if let Some(size) = self.remove(victim) {
                log_cache_debug!("Evicted chunk", name = victim, size = size);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, name.clone());
        self.entries.insert(name, CacheEntry { bytes, seq, pinned });
        self.size += incoming;
        Ok(victims)
    }

    pub fn has(&self, name: &ChunkName) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn get(&self, name: &ChunkName) -> Option<Arc<[u8]>> {
        self.entries.get(name).map(|entry| Arc::clone(&entry.bytes))
    }

    pub fn read(&self, name: &ChunkName) -> Result<Vec<u8>> {
        self.get(name)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| StoreError::not_found(name))
    }

    pub fn delete(&mut self, name: &ChunkName) -> Result<()> {
        self.remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(name))
    }

    /// Remove an entry, returning its size.
    pub(crate) fn remove(&mut self, name: &ChunkName) -> Option<u64> {
        let entry = self.entries.remove(name)?;
        self.order.remove(&entry.seq);
        let size = entry.bytes.len() as u64;
        self.size -= size;
        Some(size)
    }

    pub(crate) fn pin(&mut self, name: &ChunkName) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.pinned = true;
        }
    }

    pub(crate) fn unpin(&mut self, name: &ChunkName) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.pinned = false;
        }
    }

    pub fn is_pinned(&self, name: &ChunkName) -> bool {
        self.entries.get(name).is_some_and(|entry| entry.pinned)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.size = 0;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Set the capacity. A limit below current usage is raised to current
    /// usage; nothing is evicted until the next insert.
    pub fn set_capacity(&mut self, capacity: u64) {
        self.capacity = if capacity > 0 && capacity < self.size {
            self.size
        } else {
            capacity
        };
    }

    pub fn vacant(&self, required: u64) -> bool {
        self.capacity == 0 || self.capacity.saturating_sub(self.size) >= required
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached names, oldest first.
    pub fn names(&self) -> impl Iterator<Item = &ChunkName> {
        self.order.values()
    }
}
