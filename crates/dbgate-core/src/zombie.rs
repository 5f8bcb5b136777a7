//! Deferred release of retired DCBs.
//!
//! Workers reach DCBs through readiness events without taking any lock, so
//! a DCB closed on one thread may still be in use on another. Retirement
//! therefore only queues the DCB, stamped with a global epoch and the set of
//! workers active at that moment. After every event batch a worker records
//! the epoch it has quiesced through. A record is released once every
//! worker in its snapshot is either gone or has quiesced past the record's
//! epoch. Records are unlinked under the queue lock, so each one is handed
//! to exactly one caller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::MAX_WORKERS;
use crate::dcb::{Dcb, DcbRole};
use crate::error::PollError;

/// Index of a worker thread.
pub type WorkerId = usize;

#[derive(Debug, Default)]
struct WorkerSlot {
    active: AtomicBool,
    quiesced: AtomicU64,
}

#[derive(Debug)]
struct Zombie {
    dcb: Arc<Dcb>,
    epoch: u64,
    workers: u64,
}

/// A retired DCB as shown by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZombieInfo {
    /// DCB id.
    pub id: u64,
    /// DCB role.
    pub role: DcbRole,
    /// Epoch the DCB was retired in.
    pub epoch: u64,
    /// Workers that were active at retirement.
    pub workers: u64,
}

/// The global zombie queue.
#[derive(Debug)]
pub struct ZombieQueue {
    epoch: AtomicU64,
    workers: Vec<WorkerSlot>,
    queue: Mutex<VecDeque<Zombie>>,
}

impl ZombieQueue {
    /// Create a queue for `workers` worker slots (at most 64).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.min(MAX_WORKERS);
        Self {
            epoch: AtomicU64::new(0),
            workers: (0..workers).map(|_| WorkerSlot::default()).collect(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of worker slots.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Current epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn slot(&self, worker: WorkerId) -> Result<&WorkerSlot, PollError> {
        self.workers.get(worker).ok_or(PollError::WorkerOutOfRange {
            id: worker,
            workers: self.workers.len(),
        })
    }

    /// Mark a worker as running its event loop.
    pub fn activate(&self, worker: WorkerId) -> Result<(), PollError> {
        let slot = self.slot(worker)?;
        if slot.active.swap(true, Ordering::SeqCst) {
            return Err(PollError::WorkerActive(worker));
        }
        slot.quiesced.store(self.epoch(), Ordering::SeqCst);
        tracing::debug!(worker, "worker active");
        Ok(())
    }

    /// Mark a worker as stopped and collect what that makes releasable.
    #[must_use]
    pub fn deactivate(&self, worker: WorkerId) -> Vec<Arc<Dcb>> {
        if let Some(slot) = self.workers.get(worker) {
            slot.active.store(false, Ordering::SeqCst);
            tracing::debug!(worker, "worker stopped");
        }
        self.collect()
    }

    /// Bit mask of the active workers.
    #[must_use]
    pub fn active_mask(&self) -> u64 {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active.load(Ordering::SeqCst))
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    /// Queue a DCB for deferred release; returns its retirement epoch.
    pub fn retire(&self, dcb: Arc<Dcb>) -> u64 {
        let mut queue = self.queue.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        let workers = self.active_mask();
        dcb.set_zombie_mask(workers);
        tracing::trace!(dcb = dcb.id(), epoch, workers, "DCB retired");
        queue.push_back(Zombie { dcb, epoch, workers });
        epoch
    }

    /// Called by a worker after it has finished a batch of events.
    ///
    /// Records the worker as quiesced through the current epoch and returns
    /// the DCBs that are now safe to release. The caller owns the release.
    #[must_use]
    pub fn sweep(&self, worker: WorkerId) -> Vec<Arc<Dcb>> {
        if let Some(slot) = self.workers.get(worker) {
            slot.quiesced.store(self.epoch(), Ordering::SeqCst);
        }
        self.collect()
    }

    /// Unlink and return every record no worker can still be using.
    #[must_use]
    pub fn collect(&self) -> Vec<Arc<Dcb>> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Vec::new();
        }

        let mut ready = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for zombie in queue.drain(..) {
            if self.is_releasable(&zombie) {
                ready.push(zombie.dcb);
            } else {
                kept.push_back(zombie);
            }
        }
        *queue = kept;
        ready
    }

    fn is_releasable(&self, zombie: &Zombie) -> bool {
        self.workers.iter().enumerate().all(|(i, slot)| {
            zombie.workers & (1 << i) == 0
                || !slot.active.load(Ordering::SeqCst)
                || slot.quiesced.load(Ordering::SeqCst) > zombie.epoch
        })
    }

    /// Number of records waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// List the waiting records without touching them.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ZombieInfo> {
        self.queue
            .lock()
            .iter()
            .map(|z| ZombieInfo {
                id: z.dcb.id(),
                role: z.dcb.role(),
                epoch: z.epoch,
                workers: z.workers,
            })
            .collect()
    }
}
