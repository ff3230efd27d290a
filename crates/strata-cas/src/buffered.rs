//! Write-back chunk store.
//!
//! [`BufferedChunkStore`] accepts writes synchronously into a bounded FIFO
//! cache and persists them to the durable tier on a background
//! [`TaskQueue`]. A store returns once the chunk is cached and indexed; the
//! physical write follows, retried per [`RetryPolicy`].
//!
//! # Locking
//!
//! Cache, index and pending transfers share one mutex. The durable tier
//! ([`DurableStore`]) has its own; it is only ever taken while holding the
//! shared lock or on its own, never the other way round.
//!
//! Space in the durable tier is claimed while the store call still holds
//! the shared lock, so capacity failures (including reclamation of removable
//! chunks) are reported synchronously. Only the byte copy is deferred.
//!
//! At most one transfer task runs per name. A name stored again while its
//! task is still running (it was deleted in between) is flagged on the
//! pending entry, and the task writes it once more when it finishes.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use strata_config::{
    log_cache_error, log_store_debug, log_store_info, log_store_warn, log_transfer_error, Config,
};
use tracing::instrument;

use crate::backing::BackingStore;
use crate::cache::{Admission, ChunkCache};
use crate::index::{ChunkIndex, Durability};
use crate::reclaim::DurableStore;
use crate::transfer::{
    default_thread_count, RetryPolicy, TaskQueue, TransferScheduler, TransferStats, WorkerPool,
};
use crate::validation::{validation_for, Blake3Validation, ChunkValidation};
use crate::{lock, read_source, ChunkName, Result, StoreError};

/// Construction options for [`BufferedChunkStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Count repeated stores; a chunk is removed once every reference is
    /// deleted. Fixed for the lifetime of the store.
    pub reference_counting: bool,
    pub validation: Arc<dyn ChunkValidation>,
    /// Queue for background transfers. `None` starts a [`WorkerPool`] with
    /// the default thread count.
    pub queue: Option<Arc<dyn TaskQueue>>,
    /// Cache capacity in bytes (0 = unbounded)
    pub cache_capacity: u64,
    /// Durable capacity in bytes (0 = unbounded)
    pub durable_capacity: u64,
    pub retry: RetryPolicy,
    /// Repopulate the cache on durable reads
    pub read_through: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            reference_counting: false,
            validation: Arc::new(Blake3Validation),
            queue: None,
            cache_capacity: 0,
            durable_capacity: 0,
            retry: RetryPolicy::default(),
            read_through: true,
        }
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Known chunks across both tiers, each counted once
    pub count: u64,
    pub size: u64,
    pub cache_count: u64,
    pub cache_size: u64,
    pub durable_count: u64,
    pub durable_size: u64,
    /// Chunks with a transfer in flight
    pub pending: u64,
    /// Chunks whose transfer permanently failed
    pub not_durable: u64,
    pub transfers: TransferStats,
}

/// Bytes held for an outstanding transfer. Only the owning task removes
/// the entry.
#[derive(Debug)]
struct PendingWrite {
    bytes: Arc<[u8]>,
    /// Re-admitted while the task was running; write again on completion.
    rerun: bool,
}

#[derive(Debug)]
struct Shared {
    cache: ChunkCache,
    index: ChunkIndex,
    pending: HashMap<ChunkName, PendingWrite>,
    /// Transfers that gave up, reported by `drain`
    failed: BTreeSet<ChunkName>,
}

impl Shared {
    /// Update the index for a chunk the cache just evicted.
    fn uncache_evicted(&mut self, name: &ChunkName) {
        if let Some(entry) = self.index.uncache(name) {
            if entry.durability == Durability::Failed {
                log_cache_error!(
                    "Evicted chunk that never became durable",
                    name = name,
                    size = entry.size
                );
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<Shared>,
    /// Signalled whenever cache space may have been released
    changed: Condvar,
    durable: DurableStore,
    validation: Arc<dyn ChunkValidation>,
    read_through: bool,
}

impl Inner {
    fn wait<'a>(&self, guard: MutexGuard<'a, Shared>) -> MutexGuard<'a, Shared> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_storable(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        if content.is_empty() {
            return Err(StoreError::invalid_content(name, "content is empty"));
        }
        if !self.validation.is_valid_for_storing(name, content) {
            return Err(StoreError::invalid_content(name, "content does not match name"));
        }
        Ok(())
    }

    /// Error for a name the index does not know.
    fn missing(&self, name: &ChunkName) -> StoreError {
        if self.durable.is_initialized() {
            StoreError::not_found(name)
        } else {
            StoreError::NotInitialized
        }
    }

    /// Settle a transfer. Returns the bytes to write again if the name was
    /// re-admitted while the task was running.
    fn finish_transfer(&self, name: &ChunkName, outcome: Result<()>) -> Option<Arc<[u8]>> {
        let mut state = lock(&self.state);
        let pending = state.pending.get_mut(name)?;
        if pending.rerun {
            pending.rerun = false;
            log_store_debug!("Chunk stored again during its transfer", name = name);
            return Some(Arc::clone(&pending.bytes));
        }
        state.pending.remove(name);
        state.cache.unpin(name);

        match outcome {
            Ok(()) => {
                state.index.mark_durable(name);
            }
            Err(e) => {
                self.durable.abandon(name);
                if state.index.mark_failed(name) {
                    state.failed.insert(name.clone());
                }
                log_transfer_error!(
                    "Chunk could not be made durable",
                    name = name,
                    error = e
                );
            }
        }
        drop(state);
        self.changed.notify_all();
        None
    }
}

/// Queue the durable write of `name`. The task settles through
/// `finish_transfer` and chains a new write if one is requested.
fn schedule_transfer(
    inner: &Arc<Inner>,
    transfers: &TransferScheduler,
    name: &ChunkName,
    bytes: Arc<[u8]>,
) {
    let writer = Arc::clone(inner);
    let finisher = Arc::clone(inner);
    let chain = transfers.clone();
    let write_name = name.clone();
    let finish_name = name.clone();
    transfers.schedule(
        name.clone(),
        move || writer.durable.commit(&write_name, &bytes),
        move |outcome| {
            if let Some(bytes) = finisher.finish_transfer(&finish_name, outcome) {
                schedule_transfer(&finisher, &chain, &finish_name, bytes);
            }
        },
    );
}

/// Where the content of a store comes from.
enum Source<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

impl Source<'_> {
    fn load(&self, name: &ChunkName) -> Result<Arc<[u8]>> {
        match self {
            Source::Bytes(content) => Ok(Arc::from(*content)),
            Source::File(path) => read_source(name, path).map(Arc::from),
        }
    }
}

/// Buffered content-addressed chunk store.
///
/// Dropping the store waits for every outstanding transfer.
///
/// # Example
///
/// ```ignore
/// let store = BufferedChunkStore::new(StoreOptions::default())?;
/// store.init("/var/lib/strata/chunks")?;
///
/// let name = Blake3Validation.name_for(b"hello");
/// store.store(&name, b"hello")?;   // cached and indexed
/// store.drain()?;                  // durable
/// assert_eq!(store.read(&name)?, b"hello");
/// ```
#[derive(Debug)]
pub struct BufferedChunkStore {
    inner: Arc<Inner>,
    transfers: TransferScheduler,
}

impl BufferedChunkStore {
    /// Create a store. The durable tier must be attached with
    /// [`init`](Self::init) or [`open`](Self::open) before chunks can be
    /// stored.
    pub fn new(options: StoreOptions) -> Result<Self> {
        let queue: Arc<dyn TaskQueue> = match options.queue.clone() {
            Some(queue) => queue,
            None => Arc::new(WorkerPool::new(default_thread_count())?),
        };
        let transfers = TransferScheduler::new(queue, options.retry);
        Ok(Self::with_scheduler(options, transfers))
    }

    /// Create a store from configuration and open its file-backed durable
    /// tier at the configured root.
    pub fn from_config(config: &Config) -> Result<Self> {
        let options = StoreOptions {
            reference_counting: config.storage.reference_counting,
            validation: validation_for(config.storage.hash),
            queue: None,
            cache_capacity: config.cache.capacity,
            durable_capacity: config.storage.capacity,
            retry: RetryPolicy::from_config(&config.transfer),
            read_through: config.cache.read_through,
        };
        let transfers = TransferScheduler::from_config(&config.transfer)?;
        let store = Self::with_scheduler(options, transfers);
        store.init(config.resolved_root())?;
        Ok(store)
    }

    fn with_scheduler(options: StoreOptions, transfers: TransferScheduler) -> Self {
        let durable = DurableStore::new(Arc::clone(&options.validation), options.reference_counting);
        durable.set_capacity(options.durable_capacity);
        let cache = ChunkCache::with_capacity(Arc::clone(&options.validation), options.cache_capacity);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Shared {
                    cache,
                    index: ChunkIndex::new(),
                    pending: HashMap::new(),
                    failed: BTreeSet::new(),
                }),
                changed: Condvar::new(),
                durable,
                validation: options.validation,
                read_through: options.read_through,
            }),
            transfers,
        }
    }

    /// Attach a [`FileBackingStore`](crate::FileBackingStore) rooted at
    /// `path`. Chunks already on disk become known as durable.
    pub fn init<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let existing = self.inner.durable.init(path)?;
        self.register_durable(&mut state, existing);
        Ok(())
    }

    /// Attach an arbitrary backing store.
    ///
    /// Transfers still in flight are written to the new backing store.
    pub fn open(&self, backend: Arc<dyn BackingStore>) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let existing = self.inner.durable.open(backend)?;
        self.register_durable(&mut state, existing);
        Ok(())
    }

    fn register_durable(&self, state: &mut Shared, existing: Vec<(ChunkName, u64)>) {
        for name in state.index.names_with(Durability::Durable) {
            state.index.undurable(&name);
        }
        let count = existing.len();
        for (name, size) in existing {
            state.index.record_durable(&name, size);
        }

        // Writes that landed in the previous backing store before their
        // task settled have no record now; claim them again and rewrite.
        let durable = &self.inner.durable;
        let Shared {
            pending,
            index,
            failed,
            ..
        } = state;
        for (name, write) in pending.iter_mut() {
            let Some(entry) = index.get(name) else {
                continue;
            };
            if entry.durability != Durability::Pending || durable.has(name) {
                continue;
            }
            match durable.admit(name, entry.size) {
                Ok(_) => write.rerun = true,
                Err(e) => {
                    log_store_warn!("Pending chunk lost its durable claim", name = name, error = e);
                    if index.mark_failed(name) {
                        failed.insert(name.clone());
                    }
                }
            }
        }
        log_store_info!("Durable tier attached", chunks = count);
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.durable.is_initialized()
    }

    pub fn reference_counting(&self) -> bool {
        self.inner.durable.reference_counting()
    }

    // ========================================================================
    // Unified operations
    // ========================================================================

    /// Store a chunk.
    ///
    /// Returns once the chunk is cached and indexed; the durable write runs
    /// in the background. Storing a name that is already durable or pending
    /// is a no-op (or adds a reference when reference counting is on), and
    /// its content is not checked.
    pub fn store(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        self.put(name, Source::Bytes(content))
    }

    /// Store the content of the file at `path`, removing the file afterwards
    /// if `delete_source` is set and the store succeeded.
    pub fn store_file(&self, name: &ChunkName, path: &Path, delete_source: bool) -> Result<()> {
        self.put(name, Source::File(path))?;
        if delete_source {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn put(&self, name: &ChunkName, source: Source<'_>) -> Result<()> {
        let inner = &self.inner;
        if !inner.validation.is_valid(name) {
            return Err(StoreError::invalid_name(name));
        }
        if !inner.durable.is_initialized() {
            return Err(StoreError::NotInitialized);
        }

        // Content is loaded and hashed without the lock; each pass below
        // re-evaluates the name against current state.
        let mut loaded: Option<Arc<[u8]>> = None;
        let mut state = lock(&inner.state);
        let scheduled = loop {
            if let Some(entry) = state.index.get(name) {
                if entry.in_durable() {
                    if inner.durable.reference_counting() {
                        inner.durable.admit(name, entry.size)?;
                    }
                    return Ok(());
                }
            }

            let cached = state.cache.get(name);
            let bytes = match cached.clone().or_else(|| loaded.clone()) {
                Some(bytes) => bytes,
                None => {
                    drop(state);
                    let bytes = source.load(name)?;
                    inner.check_storable(name, &bytes)?;
                    loaded = Some(bytes);
                    state = lock(&inner.state);
                    continue;
                }
            };
            let size = bytes.len() as u64;

            match (&cached, state.cache.admission(size)) {
                (Some(_), _) | (None, Admission::Fits(_)) => {}
                (None, Admission::TooLarge) => {
                    return Err(StoreError::CapacityExceeded {
                        needed: size,
                        available: state.cache.capacity(),
                    })
                }
                (None, Admission::Blocked) => {
                    log_store_debug!("Waiting for pinned chunks", name = name, size = size);
                    state = inner.wait(state);
                    continue;
                }
            }

            let admitted = inner.durable.admit(name, size)?;
            if admitted.existing {
                state.index.record_durable(name, size);
                return Ok(());
            }
            for reclaimed in &admitted.reclaimed {
                state.cache.remove(reclaimed);
                state.index.remove(reclaimed);
            }
            if !admitted.reclaimed.is_empty() {
                inner.changed.notify_all();
            }

            if cached.is_some() {
                state.cache.pin(name);
            } else {
                match state.cache.admit(name.clone(), Arc::clone(&bytes), true) {
                    Ok(evicted) => {
                        for victim in &evicted {
                            state.uncache_evicted(victim);
                        }
                    }
                    Err(e) => {
                        inner.durable.abandon(name);
                        return Err(e);
                    }
                }
            }

            state.index.record_pending(name, size, true);
            state.failed.remove(name);
            let scheduled = match state.pending.get_mut(name) {
                Some(running) => {
                    running.rerun = true;
                    false
                }
                None => {
                    state.pending.insert(
                        name.clone(),
                        PendingWrite {
                            bytes: Arc::clone(&bytes),
                            rerun: false,
                        },
                    );
                    true
                }
            };

            log_store_debug!("Chunk stored", name = name, size = size);
            break scheduled.then_some(bytes);
        };
        drop(state);

        if let Some(bytes) = scheduled {
            schedule_transfer(&self.inner, &self.transfers, name, bytes);
        }
        Ok(())
    }

    /// Whether either tier knows `name`.
    pub fn has(&self, name: &ChunkName) -> bool {
        lock(&self.inner.state).index.has(name)
    }

    /// Durable-tier status of a known chunk.
    pub fn durability(&self, name: &ChunkName) -> Option<Durability> {
        lock(&self.inner.state)
            .index
            .get(name)
            .map(|entry| entry.durability)
    }

    /// Read a chunk, preferring the cache.
    #[instrument(skip(self), level = "debug")]
    pub fn read(&self, name: &ChunkName) -> Result<Vec<u8>> {
        {
            let state = lock(&self.inner.state);
            let entry = state
                .index
                .get(name)
                .ok_or_else(|| self.inner.missing(name))?;
            if let Some(bytes) = state.cache.get(name) {
                return Ok(bytes.to_vec());
            }
            if let Some(pending) = state.pending.get(name) {
                return Ok(pending.bytes.to_vec());
            }
            if !entry.in_durable() {
                return Err(self.inner.missing(name));
            }
        }

        let data = self.inner.durable.read(name)?;
        if self.inner.read_through {
            self.recache(name, &data);
        }
        Ok(data)
    }

    /// Put durable bytes back in the cache if they fit without waiting.
    fn recache(&self, name: &ChunkName, data: &[u8]) {
        let mut state = lock(&self.inner.state);
        let eligible = state
            .index
            .get(name)
            .is_some_and(|entry| !entry.cached && entry.durability == Durability::Durable);
        if !eligible {
            return;
        }
        if let Admission::Fits(_) = state.cache.admission(data.len() as u64) {
            if let Ok(evicted) = state.cache.admit(name.clone(), Arc::from(data), false) {
                for victim in &evicted {
                    state.uncache_evicted(victim);
                }
                state.index.recache(name);
            }
        }
    }

    /// Read a chunk into a new file at `path`.
    pub fn read_to_file(&self, name: &ChunkName, path: &Path) -> Result<()> {
        let data = self.read(name)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Delete a chunk from both tiers.
    ///
    /// The cached copy always goes. With reference counting the durable
    /// record stays, and the chunk stays known, until its last reference is
    /// deleted.
    pub fn delete(&self, name: &ChunkName) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let entry = state
            .index
            .get(name)
            .cloned()
            .ok_or_else(|| self.inner.missing(name))?;

        let remaining = if entry.in_durable() {
            self.inner.durable.delete(name)?
        } else {
            0
        };

        state.cache.remove(name);
        if remaining > 0 {
            state.index.uncache(name);
        } else {
            state.index.remove(name);
            state.failed.remove(name);
        }
        drop(state);

        self.inner.changed.notify_all();
        log_store_debug!("Chunk deleted", name = name, remaining = remaining);
        Ok(())
    }

    /// Flag a durable chunk as reclaimable when space runs short.
    pub fn mark_for_deletion(&self, name: &ChunkName) -> Result<()> {
        self.inner.durable.mark_for_deletion(name)
    }

    pub fn reference_count(&self, name: &ChunkName) -> u64 {
        self.inner.durable.reference_count(name)
    }

    pub fn count(&self) -> u64 {
        lock(&self.inner.state).index.count()
    }

    pub fn size(&self) -> u64 {
        lock(&self.inner.state).index.size()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.state).index.is_empty()
    }

    /// Durable capacity in bytes (0 = unbounded).
    pub fn capacity(&self) -> u64 {
        self.inner.durable.capacity()
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.inner.durable.set_capacity(capacity);
    }

    /// Whether the durable tier has `required` bytes free without
    /// reclaiming anything.
    pub fn vacant(&self, required: u64) -> bool {
        self.inner.durable.vacant(required)
    }

    pub fn durable_count(&self) -> u64 {
        self.inner.durable.count()
    }

    pub fn durable_size(&self) -> u64 {
        self.inner.durable.size()
    }

    /// Block until every outstanding transfer has finished.
    ///
    /// Fails with `NotDurable` if any chunk could not be persisted. Such
    /// chunks stay readable while cached and are reported again by later
    /// drains until they are stored again or deleted.
    pub fn drain(&self) -> Result<()> {
        self.transfers.drain();

        let mut state = lock(&self.inner.state);
        if state.failed.is_empty() {
            return Ok(());
        }
        let names = state.failed.iter().map(ChunkName::to_hex).collect();
        let Shared { failed, index, .. } = &mut *state;
        failed.retain(|name| index.get(name).is_some());
        Err(StoreError::NotDurable { names })
    }

    /// Remove every chunk from both tiers, after outstanding transfers
    /// have finished.
    pub fn clear(&self) -> Result<()> {
        if let Err(e) = self.drain() {
            log_store_warn!("Clearing store with chunks that never became durable", error = e);
        }

        let mut state = lock(&self.inner.state);
        state.cache.clear();
        state.index.clear();
        state.failed.clear();
        if self.inner.durable.is_initialized() {
            self.inner.durable.clear()?;
        }
        drop(state);

        self.inner.changed.notify_all();
        log_store_info!("Store cleared");
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let state = lock(&self.inner.state);
        StoreStats {
            count: state.index.count(),
            size: state.index.size(),
            cache_count: state.cache.count(),
            cache_size: state.cache.size(),
            durable_count: self.inner.durable.count(),
            durable_size: self.inner.durable.size(),
            pending: state.pending.len() as u64,
            not_durable: state.failed.len() as u64,
            transfers: self.transfers.stats(),
        }
    }

    // ========================================================================
    // Cache-only operations
    // ========================================================================

    /// Cache a chunk without scheduling a durable write.
    pub fn cache_store(&self, name: &ChunkName, content: &[u8]) -> Result<()> {
        let inner = &self.inner;
        if !inner.validation.is_valid(name) {
            return Err(StoreError::invalid_name(name));
        }

        let mut state = lock(&inner.state);
        loop {
            if state.cache.has(name) {
                return Ok(());
            }
            state.cache.check_content(name, content)?;

            let size = content.len() as u64;
            match state.cache.admission(size) {
                Admission::Fits(_) => {
                    let evicted = state.cache.admit(name.clone(), Arc::from(content), false)?;
                    for victim in &evicted {
                        state.uncache_evicted(victim);
                    }
                    state.index.record_cached(name, size);
                    return Ok(());
                }
                Admission::TooLarge => {
                    return Err(StoreError::CapacityExceeded {
                        needed: size,
                        available: state.cache.capacity(),
                    })
                }
                Admission::Blocked => state = inner.wait(state),
            }
        }
    }

    /// Cache the content of a file without scheduling a durable write,
    /// removing the file afterwards if `delete_source` is set and the store
    /// succeeded.
    pub fn cache_store_file(
        &self,
        name: &ChunkName,
        path: &Path,
        delete_source: bool,
    ) -> Result<()> {
        if !self.inner.validation.is_valid(name) {
            return Err(StoreError::invalid_name(name));
        }
        if !self.cache_has(name) {
            let content = read_source(name, path)?;
            self.cache_store(name, &content)?;
        }
        if delete_source {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn cache_has(&self, name: &ChunkName) -> bool {
        lock(&self.inner.state).cache.has(name)
    }

    pub fn cache_count(&self) -> u64 {
        lock(&self.inner.state).cache.count()
    }

    pub fn cache_size(&self) -> u64 {
        lock(&self.inner.state).cache.size()
    }

    pub fn cache_capacity(&self) -> u64 {
        lock(&self.inner.state).cache.capacity()
    }

    pub fn set_cache_capacity(&self, capacity: u64) {
        lock(&self.inner.state).cache.set_capacity(capacity);
        self.inner.changed.notify_all();
    }

    pub fn cache_vacant(&self, required: u64) -> bool {
        lock(&self.inner.state).cache.vacant(required)
    }

    pub fn cache_is_empty(&self) -> bool {
        lock(&self.inner.state).cache.is_empty()
    }

    /// Empty the cache. Durable and pending chunks stay readable.
    pub fn cache_clear(&self) {
        let mut state = lock(&self.inner.state);
        state.cache.clear();
        for (name, entry) in state.index.uncache_all() {
            if entry.durability == Durability::Failed {
                log_cache_error!(
                    "Cleared chunk that never became durable",
                    name = name,
                    size = entry.size
                );
            }
        }
        drop(state);
        self.inner.changed.notify_all();
    }
}

impl Drop for BufferedChunkStore {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            log_store_warn!("Store dropped with chunks that never became durable", error = e);
        }
    }
}
