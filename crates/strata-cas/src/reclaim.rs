//! Capacity-bounded durable tier with opt-in reclamation.
//!
//! [`DurableStore`] keeps a ledger of every record in its
//! [`BackingStore`]: size, reference count, removable mark and whether the
//! bytes have been physically written yet. Capacity is enforced against
//! the ledger, so space is claimed when a chunk is *admitted* and the
//! physical write can happen later, outside the ledger lock.
//!
//! When an admission lacks headroom, records marked removable are
//! reclaimed oldest-mark first. Feasibility is checked before anything is
//! removed; an admission that cannot be satisfied removes nothing.
//! Unmarked records are never reclaimed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use strata_config::{log_reclaim_debug, log_reclaim_info, log_reclaim_warn};
use tracing::instrument;

use crate::backing::{BackingStore, FileBackingStore};
use crate::validation::ChunkValidation;
use crate::{lock, read_source, ChunkName, Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    /// Space claimed, bytes not yet in the backing store.
    Reserved,
    Written,
}

#[derive(Debug)]
struct Record {
    size: u64,
    refs: u64,
    state: RecordState,
    /// Mark sequence, if removable.
    mark: Option<u64>,
}

#[derive(Debug, Default)]
struct Ledger {
    backend: Option<Arc<dyn BackingStore>>,
    records: HashMap<ChunkName, Record>,
    /// mark sequence -> name, oldest first
    removable: BTreeMap<u64, ChunkName>,
    removable_size: u64,
    next_mark: u64,
    size: u64,
    capacity: u64,
}

impl Ledger {
    fn backend(&self) -> Result<Arc<dyn BackingStore>> {
        self.backend.clone().ok_or(StoreError::NotInitialized)
    }

    fn vacancy(&self) -> u64 {
        if self.capacity == 0 {
            u64::MAX
        } else {
            self.capacity.saturating_sub(self.size)
        }
    }

    /// Drop a record from the ledger and, if written, from the backend.
    fn remove(&mut self, name: &ChunkName) -> Option<Record> {
        let record = self.records.remove(name)?;
        self.size -= record.size;
        if let Some(mark) = record.mark {
            self.removable.remove(&mark);
            self.removable_size -= record.size;
        }
        if record.state == RecordState::Written {
            if let Some(backend) = &self.backend {
                match backend.delete(name) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        log_reclaim_warn!("Failed to remove chunk file", name = name, error = e)
                    }
                }
            }
        }
        Some(record)
    }

    /// Free at least `shortfall` bytes from removable records, oldest mark
    /// first. The caller has already checked that this is possible.
    fn reclaim(&mut self, shortfall: u64) -> Vec<ChunkName> {
        let mut freed = 0u64;
        let mut reclaimed = Vec::new();
        while freed < shortfall {
            let Some(name) = self.removable.values().next().cloned() else {
                break;
            };
            match self.remove(&name) {
                Some(record) => {
                    freed += record.size;
                    log_reclaim_debug!("Reclaimed chunk", name = name, size = record.size);
                    reclaimed.push(name);
                }
                None => {
                    self.removable.pop_first();
                }
            }
        }
        log_reclaim_info!(
            "Reclaimed removable chunks",
            count = reclaimed.len(),
            freed = freed,
            shortfall = shortfall
        );
        reclaimed
    }
}

/// Result of admitting a chunk into the durable tier.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Admitted {
    /// The name was already present (its reference count was bumped when
    /// reference counting is on); no write is needed.
    pub existing: bool,
    /// Removable records removed to make room.
    pub reclaimed: Vec<ChunkName>,
}

/// Durable tier: a [`BackingStore`] plus capacity, removable marks and
/// optional reference counting.
#[derive(Debug)]
pub struct DurableStore {
    ledger: Mutex<Ledger>,
    validation: Arc<dyn ChunkValidation>,
    reference_counting: bool,
}

impl DurableStore {
    /// Create an uninitialized durable tier. Every operation that touches
    /// records fails with `NotInitialized` until [`init`](Self::init) or
    /// [`open`](Self::open) is called.
    pub fn new(validation: Arc<dyn ChunkValidation>, reference_counting: bool) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            validation,
            reference_counting,
        }
    }

    /// Use a [`FileBackingStore`] rooted at `path`.
    pub fn init<P: AsRef<Path>>(&self, path: P) -> Result<Vec<(ChunkName, u64)>> {
        self.open(Arc::new(FileBackingStore::new(path)?))
    }

    /// Attach a backing store, registering the chunks it already holds.
    ///
    /// Existing chunks start unmarked with a reference count of one. Returns
    /// them so callers can index them. Admitted chunks whose bytes are not
    /// written yet stay admitted and are committed to the new backend.
    pub fn open(&self, backend: Arc<dyn BackingStore>) -> Result<Vec<(ChunkName, u64)>> {
        let mut ledger = lock(&self.ledger);
        let existing = backend.list()?;

        let reserved: Vec<(ChunkName, Record)> = ledger
            .records
            .drain()
            .filter(|(_, record)| record.state == RecordState::Reserved)
            .collect();
        ledger.removable.clear();
        ledger.removable_size = 0;
        ledger.size = 0;
        for (name, size) in &existing {
            ledger.records.insert(
                name.clone(),
                Record {
                    size: *size,
                    refs: 1,
                    state: RecordState::Written,
                    mark: None,
                },
            );
            ledger.size += size;
        }
        for (name, mut record) in reserved {
            if ledger.records.contains_key(&name) {
                continue;
            }
            record.mark = None;
            ledger.size += record.size;
            ledger.records.insert(name, record);
        }
        if ledger.capacity > 0 && ledger.capacity < ledger.size {
            ledger.capacity = ledger.size;
        }
        if ledger.capacity == 0 {
            ledger.capacity = backend.capacity();
        }
        ledger.backend = Some(backend);

        log_reclaim_debug!(
            "Durable tier opened",
            chunks = existing.len(),
            size = ledger.size
        );
        Ok(existing)
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.ledger).backend.is_some()
    }

    pub fn reference_counting(&self) -> bool {
        self.reference_counting
    }

    /// Store a chunk synchronously: admit it, then write it.
    ///
    /// An existing name is a no-op, or gains a reference when reference
    /// counting is on; its content is not checked.
    pub fn store(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        if !self.validation.is_valid(name) {
            return Err(StoreError::invalid_name(name));
        }
        if self.add_reference(name)? {
            return Ok(());
        }
        if content.is_empty() {
            return Err(StoreError::invalid_content(name, "content is empty"));
        }
        if !self.validation.is_valid_for_storing(name, content) {
            return Err(StoreError::invalid_content(name, "content does not match name"));
        }

        let admitted = self.admit(name, content.len() as u64)?;
        if admitted.existing {
            return Ok(());
        }
        if let Err(e) = self.commit(name, content) {
            self.abandon(name);
            return Err(e);
        }
        Ok(())
    }

    /// Store the content of a file, removing it afterwards if
    /// `delete_source` is set and the store succeeded.
    pub fn store_file(&self, name: &ChunkName, path: &Path, delete_source: bool) -> Result<()> {
        if !self.validation.is_valid(name) {
            return Err(StoreError::invalid_name(name));
        }
        if !self.add_reference(name)? {
            let content = read_source(name, path)?;
            self.store(name, &content)?;
        }
        if delete_source {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Bump the reference count of an existing record. Returns false if the
    /// name is absent.
    fn add_reference(&self, name: &ChunkName) -> Result<bool> {
        let mut ledger = lock(&self.ledger);
        ledger.backend()?;
        match ledger.records.get_mut(name) {
            Some(record) => {
                if self.reference_counting {
                    record.refs += 1;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Claim space for a chunk of `size` bytes, reclaiming removable records
    /// if needed. The chunk counts towards `count()` and `size()` from here
    /// on; its bytes must follow via [`commit`](Self::commit), or the claim
    /// is released with [`abandon`](Self::abandon).
    pub fn admit(&self, name: &ChunkName, size: u64) -> Result<Admitted> {
        let mut ledger = lock(&self.ledger);
        ledger.backend()?;

        if let Some(record) = ledger.records.get_mut(name) {
            if self.reference_counting {
                record.refs += 1;
            }
            return Ok(Admitted {
                existing: true,
                reclaimed: Vec::new(),
            });
        }

        let vacancy = ledger.vacancy();
        let mut reclaimed = Vec::new();
        if size > vacancy {
            let available = vacancy + ledger.removable_size;
            if available < size {
                log_reclaim_debug!(
                    "Admission refused",
                    name = name,
                    size = size,
                    available = available
                );
                return Err(StoreError::CapacityExceeded {
                    needed: size,
                    available,
                });
            }
            reclaimed = ledger.reclaim(size - vacancy);
        }

        ledger.records.insert(
            name.clone(),
            Record {
                size,
                refs: 1,
                state: RecordState::Reserved,
                mark: None,
            },
        );
        ledger.size += size;
        Ok(Admitted {
            existing: false,
            reclaimed,
        })
    }

    /// Physically write an admitted chunk.
    ///
    /// The write runs without holding the ledger lock. If the record was
    /// deleted or reclaimed meanwhile, the written bytes are removed again.
    /// If the backing store was replaced meanwhile, the write is repeated
    /// against the new one.
    #[instrument(skip(self, content), level = "debug")]
    pub fn commit(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        loop {
            let backend = {
                let ledger = lock(&self.ledger);
                match ledger.records.get(name) {
                    None => return Ok(()),
                    Some(record) if record.state == RecordState::Written => return Ok(()),
                    Some(_) => ledger.backend()?,
                }
            };

            backend.put(name, content)?;

            let mut ledger = lock(&self.ledger);
            let current = ledger
                .backend
                .as_ref()
                .is_some_and(|attached| Arc::ptr_eq(attached, &backend));
            match ledger.records.get_mut(name) {
                Some(record) if current => {
                    record.state = RecordState::Written;
                    return Ok(());
                }
                Some(_) => {
                    log_reclaim_debug!("Backing store replaced during write", name = name);
                }
                None => {
                    log_reclaim_debug!("Discarding write for removed chunk", name = name);
                    if let Err(e) = backend.delete(name) {
                        if !e.is_not_found() {
                            return Err(e);
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Release the claim of an admitted chunk whose write will not happen.
    /// Returns false if there was no outstanding claim.
    pub fn abandon(&self, name: &ChunkName) -> bool {
        let mut ledger = lock(&self.ledger);
        match ledger.records.get(name) {
            Some(record) if record.state == RecordState::Reserved => {
                ledger.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Read a written chunk, verifying it against its name.
    #[instrument(skip(self), level = "debug")]
    pub fn read(&self, name: &ChunkName) -> Result<Vec<u8>> {
        let backend = {
            let ledger = lock(&self.ledger);
            let backend = ledger.backend()?;
            match ledger.records.get(name) {
                Some(record) if record.state == RecordState::Written => backend,
                _ => return Err(StoreError::not_found(name)),
            }
        };

        let data = backend.get(name)?;
        if !self.validation.is_valid_for_storing(name, &data) {
            return Err(StoreError::Corrupted {
                name: name.to_hex(),
            });
        }
        Ok(data)
    }

    /// Delete a chunk, returning the references left. With reference
    /// counting the record is only removed when this reaches zero.
    pub fn delete(&self, name: &ChunkName) -> Result<u64> {
        let mut ledger = lock(&self.ledger);
        ledger.backend()?;
        let record = ledger
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(name))?;

        if self.reference_counting && record.refs > 1 {
            record.refs -= 1;
            return Ok(record.refs);
        }
        ledger.remove(name);
        Ok(0)
    }

    /// Flag a record as removable. Marking twice keeps the first mark.
    pub fn mark_for_deletion(&self, name: &ChunkName) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        ledger.backend()?;
        let seq = ledger.next_mark;
        let record = ledger
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(name))?;
        if record.mark.is_some() {
            return Ok(());
        }
        record.mark = Some(seq);
        let size = record.size;
        ledger.next_mark += 1;
        ledger.removable.insert(seq, name.clone());
        ledger.removable_size += size;
        Ok(())
    }

    pub fn is_marked(&self, name: &ChunkName) -> bool {
        lock(&self.ledger)
            .records
            .get(name)
            .is_some_and(|record| record.mark.is_some())
    }

    /// Admitted records, whether or not their bytes are written yet.
    pub fn has(&self, name: &ChunkName) -> bool {
        lock(&self.ledger).records.contains_key(name)
    }

    /// Whether the bytes of `name` are in the backing store.
    pub fn is_written(&self, name: &ChunkName) -> bool {
        lock(&self.ledger)
            .records
            .get(name)
            .is_some_and(|record| record.state == RecordState::Written)
    }

    pub fn reference_count(&self, name: &ChunkName) -> u64 {
        lock(&self.ledger)
            .records
            .get(name)
            .map_or(0, |record| record.refs)
    }

    pub fn count(&self) -> u64 {
        lock(&self.ledger).records.len() as u64
    }

    pub fn size(&self) -> u64 {
        lock(&self.ledger).size
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.ledger).records.is_empty()
    }

    pub fn capacity(&self) -> u64 {
        lock(&self.ledger).capacity
    }

    /// Set the capacity, 0 for unbounded. A limit below current usage is
    /// raised to current usage.
    pub fn set_capacity(&self, capacity: u64) {
        let mut ledger = lock(&self.ledger);
        ledger.capacity = if capacity > 0 && capacity < ledger.size {
            ledger.size
        } else {
            capacity
        };
    }

    pub fn vacant(&self, required: u64) -> bool {
        lock(&self.ledger).vacancy() >= required
    }

    /// Bytes held by removable records.
    pub fn removable_size(&self) -> u64 {
        lock(&self.ledger).removable_size
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        ledger.backend()?;
        let names: Vec<ChunkName> = ledger.records.keys().cloned().collect();
        for name in &names {
            ledger.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemoryBackingStore;
    use crate::validation::Blake3Validation;
    use tempfile::TempDir;

    fn chunk(seed: &str, len: usize) -> (ChunkName, Vec<u8>) {
        let mut content = vec![0u8; len];
        blake3::Hasher::new()
            .update(seed.as_bytes())
            .finalize_xof()
            .fill(&mut content);
        (Blake3Validation.name_for(&content), content)
    }

    fn memory_store(reference_counting: bool) -> (DurableStore, Arc<MemoryBackingStore>) {
        let backend = Arc::new(MemoryBackingStore::new());
        let store = DurableStore::new(Arc::new(Blake3Validation), reference_counting);
        store.open(backend.clone()).unwrap();
        (store, backend)
    }

    #[test]
    fn test_not_initialized() {
        let store = DurableStore::new(Arc::new(Blake3Validation), false);
        let (name, content) = chunk("x", 10);
        assert!(!store.is_initialized());
        assert!(matches!(
            store.store(&name, &content),
            Err(StoreError::NotInitialized)
        ));
        assert!(matches!(store.read(&name), Err(StoreError::NotInitialized)));
        assert!(matches!(store.delete(&name), Err(StoreError::NotInitialized)));
        assert!(matches!(
            store.mark_for_deletion(&name),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_store_read_delete() {
        let temp = TempDir::new().unwrap();
        let store = DurableStore::new(Arc::new(Blake3Validation), false);
        store.init(temp.path()).unwrap();

        let (name, content) = chunk("a", 300);
        store.store(&name, &content).unwrap();
        assert!(store.has(&name));
        assert!(store.is_written(&name));
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 300);
        assert_eq!(store.read(&name).unwrap(), content);

        // repeat store is a no-op without reference counting
        store.store(&name, b"").unwrap();
        assert_eq!(store.reference_count(&name), 1);

        assert_eq!(store.delete(&name).unwrap(), 0);
        assert!(!store.has(&name));
        assert!(store.delete(&name).unwrap_err().is_not_found());
        assert!(store.read(&name).unwrap_err().is_not_found());
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_content_rejected() {
        let (store, _) = memory_store(false);
        let (name, _) = chunk("a", 10);
        assert!(matches!(
            store.store(&name, b""),
            Err(StoreError::InvalidContent { .. })
        ));
        assert!(matches!(
            store.store(&name, b"other"),
            Err(StoreError::InvalidContent { .. })
        ));
        assert!(matches!(
            store.store(&ChunkName::from_bytes(vec![1]), b"other"),
            Err(StoreError::InvalidName { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_reclaims_all_removable_for_exact_fit() {
        let (store, backend) = memory_store(false);
        store.set_capacity(2570);
        assert_eq!(store.capacity(), 2570);

        let mut names = Vec::new();
        for i in 0..10 {
            let (name, content) = chunk(&format!("small{}", i), 256);
            store.store(&name, &content).unwrap();
            store.mark_for_deletion(&name).unwrap();
            names.push(name);
        }
        assert_eq!(store.count(), 10);
        assert_eq!(store.size(), 2560);
        assert_eq!(store.removable_size(), 2560);

        // 2560 reclaimable + 10 vacant < 2580
        let (big_name, big) = chunk("big", 2580);
        assert!(matches!(
            store.store(&big_name, &big),
            Err(StoreError::CapacityExceeded { .. })
        ));
        assert_eq!(store.count(), 10);
        assert!(names.iter().all(|n| backend.has(n)));

        let (fit_name, fit) = chunk("fit", 2560);
        store.store(&fit_name, &fit).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 2560);
        assert!(names.iter().all(|n| !store.has(n) && !backend.has(n)));
        assert_eq!(store.read(&fit_name).unwrap(), fit);
    }

    #[test]
    fn test_reclaims_oldest_mark_first_and_stops_early() {
        let (store, _) = memory_store(false);
        store.set_capacity(300);

        let (a, ca) = chunk("a", 100);
        let (b, cb) = chunk("b", 100);
        let (c, cc) = chunk("c", 100);
        store.store(&a, &ca).unwrap();
        store.store(&b, &cb).unwrap();
        store.store(&c, &cc).unwrap();

        // mark order differs from store order
        store.mark_for_deletion(&c).unwrap();
        store.mark_for_deletion(&a).unwrap();
        store.mark_for_deletion(&c).unwrap();

        let (d, cd) = chunk("d", 50);
        let admitted = store.admit(&d, 50).unwrap();
        assert_eq!(admitted.reclaimed, vec![c.clone()]);
        store.commit(&d, &cd).unwrap();

        assert!(store.has(&a));
        assert!(store.has(&b));
        assert!(!store.has(&c));
        assert_eq!(store.size(), 250);
        assert_eq!(store.removable_size(), 100);
    }

    #[test]
    fn test_unmarked_records_are_never_reclaimed() {
        let (store, _) = memory_store(false);
        store.set_capacity(200);
        let (a, ca) = chunk("a", 150);
        store.store(&a, &ca).unwrap();

        let (b, cb) = chunk("b", 100);
        assert!(matches!(
            store.store(&b, &cb),
            Err(StoreError::CapacityExceeded { .. })
        ));
        assert!(store.has(&a));
        assert!(!store.vacant(100));
        assert!(store.vacant(50));
    }

    #[test]
    fn test_mark_missing_is_not_found() {
        let (store, _) = memory_store(false);
        let (name, _) = chunk("gone", 10);
        assert!(store.mark_for_deletion(&name).unwrap_err().is_not_found());
        assert!(!store.is_marked(&name));
    }

    #[test]
    fn test_mark_does_not_change_accounting() {
        let (store, _) = memory_store(false);
        let (name, content) = chunk("m", 64);
        store.store(&name, &content).unwrap();
        store.mark_for_deletion(&name).unwrap();
        assert!(store.is_marked(&name));
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 64);
        assert_eq!(store.read(&name).unwrap(), content);
    }

    #[test]
    fn test_reference_counting() {
        let (store, backend) = memory_store(true);
        let (name, content) = chunk("rc", 32);

        store.store(&name, &content).unwrap();
        store.store(&name, &content).unwrap();
        store.store(&name, b"").unwrap();
        assert_eq!(store.reference_count(&name), 3);
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 32);

        assert_eq!(store.delete(&name).unwrap(), 2);
        assert_eq!(store.delete(&name).unwrap(), 1);
        assert!(backend.has(&name));
        assert_eq!(store.delete(&name).unwrap(), 0);
        assert!(!store.has(&name));
        assert!(!backend.has(&name));
    }

    #[test]
    fn test_marked_refcounted_record_is_reclaimed_whole() {
        let (store, _) = memory_store(true);
        store.set_capacity(100);
        let (a, ca) = chunk("a", 100);
        store.store(&a, &ca).unwrap();
        store.store(&a, &ca).unwrap();
        store.mark_for_deletion(&a).unwrap();

        let (b, cb) = chunk("b", 60);
        store.store(&b, &cb).unwrap();
        assert!(!store.has(&a));
        assert_eq!(store.reference_count(&a), 0);
    }

    #[test]
    fn test_set_capacity_clamps_to_usage() {
        let (store, _) = memory_store(false);
        let (name, content) = chunk("c", 50);
        store.store(&name, &content).unwrap();
        store.set_capacity(10);
        assert_eq!(store.capacity(), 50);
        store.set_capacity(0);
        assert_eq!(store.capacity(), 0);
        assert!(store.vacant(u64::MAX));
    }

    #[test]
    fn test_commit_after_delete_discards_bytes() {
        let (store, backend) = memory_store(false);
        let (name, content) = chunk("late", 40);

        store.admit(&name, 40).unwrap();
        assert!(store.has(&name));
        assert!(!store.is_written(&name));
        assert!(store.read(&name).unwrap_err().is_not_found());

        store.delete(&name).unwrap();
        store.commit(&name, &content).unwrap();
        assert!(!backend.has(&name));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_abandon_releases_claim() {
        let (store, _) = memory_store(false);
        store.set_capacity(100);
        let (name, _) = chunk("a", 80);
        store.admit(&name, 80).unwrap();
        assert!(!store.vacant(30));
        assert!(store.abandon(&name));
        assert!(!store.abandon(&name));
        assert!(store.vacant(100));
    }

    #[test]
    fn test_reopen_keeps_unwritten_claims() {
        let (store, old) = memory_store(false);
        let (written, written_content) = chunk("written", 40);
        let (claimed, claimed_content) = chunk("claimed", 60);
        store.store(&written, &written_content).unwrap();
        store.admit(&claimed, 60).unwrap();
        store.mark_for_deletion(&claimed).unwrap();

        let new = Arc::new(MemoryBackingStore::new());
        assert!(store.open(new.clone()).unwrap().is_empty());
        assert!(!store.has(&written));
        assert!(store.has(&claimed));
        assert!(!store.is_written(&claimed));
        assert!(!store.is_marked(&claimed));
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 60);

        store.commit(&claimed, &claimed_content).unwrap();
        assert!(store.is_written(&claimed));
        assert!(new.has(&claimed));
        assert!(!old.has(&claimed));
        assert_eq!(store.read(&claimed).unwrap(), claimed_content);
    }

    #[test]
    fn test_reopen_registers_existing_chunks() {
        let temp = TempDir::new().unwrap();
        let (name, content) = chunk("persist", 128);
        {
            let store = DurableStore::new(Arc::new(Blake3Validation), false);
            store.init(temp.path()).unwrap();
            store.store(&name, &content).unwrap();
        }

        let store = DurableStore::new(Arc::new(Blake3Validation), false);
        let existing = store.init(temp.path()).unwrap();
        assert_eq!(existing, vec![(name.clone(), 128)]);
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 128);
        assert_eq!(store.read(&name).unwrap(), content);
    }

    #[test]
    fn test_corrupted_file_detected() {
        let temp = TempDir::new().unwrap();
        let files = FileBackingStore::new(temp.path()).unwrap();
        let store = DurableStore::new(Arc::new(Blake3Validation), false);
        store.open(Arc::new(files.clone())).unwrap();

        let (name, content) = chunk("rot", 64);
        store.store(&name, &content).unwrap();
        std::fs::write(files.chunk_path(&name), b"bit rot").unwrap();
        assert!(matches!(
            store.read(&name),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_store_file_consumes_source() {
        let temp = TempDir::new().unwrap();
        let (store, _) = memory_store(false);
        let (name, content) = chunk("src", 77);
        let path = temp.path().join("chunk.dat");
        std::fs::write(&path, &content).unwrap();

        store.store_file(&name, &path, true).unwrap();
        assert!(!path.exists());
        assert_eq!(store.read(&name).unwrap(), content);
    }

    #[test]
    fn test_clear() {
        let (store, backend) = memory_store(false);
        for i in 0..5 {
            let (name, content) = chunk(&format!("clr{}", i), 16);
            store.store(&name, &content).unwrap();
        }
        store.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.size(), 0);
        assert_eq!(backend.count().unwrap(), 0);
    }
}
