//! Unified chunk index.
//!
//! One entry per known name, recording where the chunk currently lives.
//! A name is known while it is cached or durable-present (durable, or
//! admitted to the durable tier and awaiting its write); entries that stop
//! being known are dropped, so `count()` and `size()` aggregate over the
//! union of both tiers with each name counted once.

use std::collections::HashMap;

use crate::ChunkName;

/// Durable-tier status of an indexed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Never admitted to the durable tier (cache-only writes).
    Absent,
    /// Admitted, physical write outstanding.
    Pending,
    /// Written to the durable tier.
    Durable,
    /// Physical write failed after every retry.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub size: u64,
    pub cached: bool,
    pub durability: Durability,
}

impl IndexEntry {
    /// Counts as present in the durable tier.
    pub fn in_durable(&self) -> bool {
        matches!(self.durability, Durability::Pending | Durability::Durable)
    }

    fn is_known(&self) -> bool {
        self.cached || self.in_durable()
    }
}

#[derive(Debug, Default)]
pub struct ChunkIndex {
    entries: HashMap<ChunkName, IndexEntry>,
    size: u64,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &ChunkName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &ChunkName) -> Option<&IndexEntry> {
        self.entries.get(name)
    }

    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&mut self, name: &ChunkName, size: u64) -> &mut IndexEntry {
        if !self.entries.contains_key(name) {
            self.size += size;
        }
        self.entries.entry(name.clone()).or_insert(IndexEntry {
            size,
            cached: false,
            durability: Durability::Absent,
        })
    }

    /// Drop `name` if it is no longer held by either tier.
    fn settle(&mut self, name: &ChunkName) -> Option<IndexEntry> {
        if self.entries.get(name).is_some_and(|entry| !entry.is_known()) {
            return self.remove(name);
        }
        None
    }

    /// A cache-only write.
    pub fn record_cached(&mut self, name: &ChunkName, size: u64) {
        self.entry(name, size).cached = true;
    }

    /// A write admitted to the durable tier, awaiting its transfer.
    pub fn record_pending(&mut self, name: &ChunkName, size: u64, cached: bool) {
        let entry = self.entry(name, size);
        entry.cached |= cached;
        entry.durability = Durability::Pending;
    }

    /// A chunk found in the durable tier at startup.
    pub fn record_durable(&mut self, name: &ChunkName, size: u64) {
        self.entry(name, size).durability = Durability::Durable;
    }

    /// Transfer succeeded. Returns false if the name is no longer pending.
    pub fn mark_durable(&mut self, name: &ChunkName) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.durability == Durability::Pending => {
                entry.durability = Durability::Durable;
                true
            }
            _ => false,
        }
    }

    /// Transfer gave up. Returns false if the name is no longer pending.
    ///
    /// A failed chunk that is no longer cached has no copy left; the entry
    /// is dropped in that case.
    pub fn mark_failed(&mut self, name: &ChunkName) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.durability == Durability::Pending => {
                entry.durability = Durability::Failed;
                self.settle(name);
                true
            }
            _ => false,
        }
    }

    /// The cache copy was evicted or cleared. Returns the entry if the
    /// chunk is now gone from both tiers.
    pub fn uncache(&mut self, name: &ChunkName) -> Option<IndexEntry> {
        self.entries.get_mut(name)?.cached = false;
        self.settle(name)
    }

    /// A read-through repopulated the cache.
    pub fn recache(&mut self, name: &ChunkName) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.cached = true;
        }
    }

    /// The durable record went away; a cached copy may remain.
    pub fn undurable(&mut self, name: &ChunkName) -> Option<IndexEntry> {
        self.entries.get_mut(name)?.durability = Durability::Absent;
        self.settle(name)
    }

    pub fn remove(&mut self, name: &ChunkName) -> Option<IndexEntry> {
        let entry = self.entries.remove(name)?;
        self.size -= entry.size;
        Some(entry)
    }

    /// Mark every entry uncached, returning the names that became unknown.
    pub fn uncache_all(&mut self) -> Vec<(ChunkName, IndexEntry)> {
        let mut dropped = Vec::new();
        for entry in self.entries.values_mut() {
            entry.cached = false;
        }
        self.entries.retain(|name, entry| {
            if entry.is_known() {
                true
            } else {
                dropped.push((name.clone(), entry.clone()));
                false
            }
        });
        self.size -= dropped.iter().map(|(_, entry)| entry.size).sum::<u64>();
        dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    /// Names with the given durability, sorted.
    pub fn names_with(&self, durability: Durability) -> Vec<ChunkName> {
        let mut names: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.durability == durability)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
