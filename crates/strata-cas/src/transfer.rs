//! Background transfer of cached chunks to the durable tier.
//!
//! A [`TaskQueue`] runs fire-and-forget work on background threads and can
//! be drained; [`TransferScheduler`] puts a retry loop around each durable
//! write and reports the final outcome to a completion callback.
//!
//! Two queues are provided:
//! - [`WorkerPool`]: dedicated threads fed by a crossbeam channel
//! - [`RayonQueue`]: a private rayon pool

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use strata_config::{log_transfer_debug, log_transfer_error, log_transfer_warn, TransferConfig};

use crate::{lock, ChunkName, Result, StoreError};

/// Maximum default transfer threads (preserve system resources)
pub const MAX_TRANSFER_THREADS: usize = 4;

/// Default thread count: min(cpu_cores / 2, MAX_TRANSFER_THREADS)
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_TRANSFER_THREADS)
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executor for background transfers.
pub trait TaskQueue: Send + Sync + fmt::Debug {
    /// Run `task` asynchronously.
    fn submit(&self, task: Task);

    /// Block until every task submitted so far has finished.
    ///
    /// Must not be called from inside a task.
    fn drain(&self);

    /// Tasks submitted and not yet finished.
    fn outstanding(&self) -> usize;
}

// ============================================================================
// Outstanding-task tracking
// ============================================================================

/// Counts unfinished tasks so `drain` can wait for zero.
#[derive(Debug, Default)]
struct Outstanding {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Outstanding {
    fn enter(self: &Arc<Self>) -> Ticket {
        *lock(&self.count) += 1;
        Ticket(Arc::clone(self))
    }

    fn wait_idle(&self) {
        let mut count = lock(&self.count);
        while *count > 0 {
            count = self
                .condvar
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn get(&self) -> usize {
        *lock(&self.count)
    }
}

/// Held by a task until it finishes, panics included.
struct Ticket(Arc<Outstanding>);

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut count = lock(&self.0.count);
        *count -= 1;
        if *count == 0 {
            self.0.condvar.notify_all();
        }
    }
}

fn run_guarded(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        log_transfer_error!("Transfer task panicked");
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

struct Job {
    task: Task,
    _ticket: Ticket,
}

/// Fixed set of named worker threads pulling from an unbounded channel.
///
/// Dropping the pool lets queued work finish, then joins every worker.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    outstanding: Arc<Outstanding>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("strata-transfer-{}", i))
                .spawn(move || {
                    for job in receiver.iter() {
                        let Job { task, _ticket } = job;
                        run_guarded(task);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
            outstanding: Arc::new(Outstanding::default()),
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl TaskQueue for WorkerPool {
    fn submit(&self, task: Task) {
        let job = Job {
            task,
            _ticket: self.outstanding.enter(),
        };
        let job = match &self.sender {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => job,
        };
        // workers are gone; run on the caller's thread
        run_guarded(job.task);
    }

    fn drain(&self) {
        self.outstanding.wait_idle();
    }

    fn outstanding(&self) -> usize {
        self.outstanding.get()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log_transfer_error!("Transfer worker exited abnormally");
            }
        }
    }
}

// ============================================================================
// Rayon-backed queue
// ============================================================================

/// Task queue on a private rayon thread pool.
#[derive(Debug)]
pub struct RayonQueue {
    pool: rayon::ThreadPool,
    outstanding: Arc<Outstanding>,
}

impl RayonQueue {
    /// Build a pool with `threads` threads, or the default count.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.unwrap_or_else(default_thread_count))
            .thread_name(|i| format!("strata-transfer-{}", i))
            .build()
            .map_err(|e| StoreError::Io(io::Error::other(e)))?;
        Ok(Self {
            pool,
            outstanding: Arc::new(Outstanding::default()),
        })
    }
}

impl TaskQueue for RayonQueue {
    fn submit(&self, task: Task) {
        let ticket = self.outstanding.enter();
        self.pool.spawn(move || {
            let _ticket = ticket;
            run_guarded(task);
        });
    }

    fn drain(&self) {
        self.outstanding.wait_idle();
    }

    fn outstanding(&self) -> usize {
        self.outstanding.get()
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Retry schedule for durable writes: exponential backoff, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Only I/O failures are worth another attempt.
fn is_transient(error: &StoreError) -> bool {
    matches!(error, StoreError::Io(_))
}

// ============================================================================
// Transfer scheduler
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Transfer counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub outstanding: u64,
}

/// Runs durable writes in the background with retries.
#[derive(Debug, Clone)]
pub struct TransferScheduler {
    queue: Arc<dyn TaskQueue>,
    policy: RetryPolicy,
    counters: Arc<Counters>,
}

impl TransferScheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            policy,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Scheduler on a [`WorkerPool`] sized from the config.
    pub fn from_config(config: &TransferConfig) -> Result<Self> {
        let threads = config.workers.unwrap_or_else(default_thread_count);
        Ok(Self::new(
            Arc::new(WorkerPool::new(threads)?),
            RetryPolicy::from_config(config),
        ))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `write` in the background until it succeeds, fails with a
    /// non-I/O error, or runs out of retries; then hand the outcome to
    /// `finish`.
    pub fn schedule<W, F>(&self, name: ChunkName, mut write: W, finish: F)
    where
        W: FnMut() -> Result<()> + Send + 'static,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let policy = self.policy;
        let counters = Arc::clone(&self.counters);
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        self.queue.submit(Box::new(move || {
            let mut retry = 0u32;
            let outcome = loop {
                match write() {
                    Ok(()) => break Ok(()),
                    Err(e) if is_transient(&e) && retry < policy.max_retries => {
                        retry += 1;
                        counters.retries.fetch_add(1, Ordering::Relaxed);
                        let delay = policy.backoff(retry);
                        log_transfer_warn!(
                            "Durable write failed, retrying",
                            name = name,
                            retry = retry,
                            delay_ms = delay.as_millis(),
                            error = e
                        );
                        thread::sleep(delay);
                    }
                    Err(e) => break Err(e),
                }
            };

            match &outcome {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    log_transfer_debug!("Chunk transferred", name = name, retries = retry);
                }
                Err(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            finish(outcome);
        }));
    }

    /// Block until every scheduled transfer has finished.
    pub fn drain(&self) {
        self.queue.drain();
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            outstanding: self.queue.outstanding() as u64,
        }
    }
}
