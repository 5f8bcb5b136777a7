//! An event demultiplexer that only records registrations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dbgate_core::{Dcb, EventDemux, EventMask, PollError};
use parking_lot::Mutex;

/// Records which descriptors are registered and with what interest.
///
/// Mirrors a real poller's bookkeeping: registering a descriptor twice or
/// removing one that is not registered fails.
#[derive(Debug, Default)]
pub struct MockDemux {
    registered: Mutex<HashMap<i32, EventMask>>,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
}

impl MockDemux {
    /// Create an empty demultiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `fd` is currently registered.
    #[must_use]
    pub fn is_registered(&self, fd: i32) -> bool {
        self.registered.lock().contains_key(&fd)
    }

    /// Interest set of a registered descriptor.
    #[must_use]
    pub fn interest(&self, fd: i32) -> Option<EventMask> {
        self.registered.lock().get(&fd).copied()
    }

    /// Number of descriptors currently registered.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Successful `register` calls since creation.
    #[must_use]
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Successful `deregister` calls since creation.
    #[must_use]
    pub fn deregistrations(&self) -> usize {
        self.deregistrations.load(Ordering::Relaxed)
    }
}

impl EventDemux for MockDemux {
    fn register(&self, fd: i32, interest: EventMask, owner: Arc<Dcb>) -> Result<(), PollError> {
        let mut registered = self.registered.lock();
        if registered.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered(fd));
        }
        registered.insert(fd, interest);
        self.registrations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fd, dcb = owner.id(), ?interest, "registered");
        Ok(())
    }

    fn modify(&self, fd: i32, interest: EventMask) -> Result<(), PollError> {
        let mut registered = self.registered.lock();
        let slot = registered.get_mut(&fd).ok_or(PollError::NotRegistered(fd))?;
        *slot = interest;
        Ok(())
    }

    fn deregister(&self, fd: i32) -> Result<(), PollError> {
        self.registered
            .lock()
            .remove(&fd)
            .ok_or(PollError::NotRegistered(fd))?;
        self.deregistrations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fd, "deregistered");
        Ok(())
    }
}
