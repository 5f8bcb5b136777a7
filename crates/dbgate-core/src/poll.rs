//! Readiness event dispatch.
//!
//! The event demultiplexer itself is external; it delivers batches of
//! `(dcb, events)` to worker threads. Each worker hands its batch to
//! [`Worker::process_batch`], which dispatches every event and then sweeps
//! the zombie queue once.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::dcb::{Dcb, DcbState};
use crate::error::{PollError, ProtocolError};
use crate::manager::DcbManager;
use crate::zombie::WorkerId;

bitflags! {
    /// Readiness events and interest sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        /// Data can be read, or a connection can be accepted.
        const READ = 0x01;
        /// The socket can take more data.
        const WRITE = 0x02;
        /// Socket error.
        const ERROR = 0x04;
        /// Peer hung up.
        const HUP = 0x08;
    }
}

/// The external event demultiplexer.
pub trait EventDemux: Send + Sync {
    /// Start delivering events for `fd` to `owner`.
    fn register(&self, fd: i32, interest: EventMask, owner: Arc<Dcb>) -> Result<(), PollError>;

    /// Change the interest set of a registered descriptor.
    fn modify(&self, fd: i32, interest: EventMask) -> Result<(), PollError>;

    /// Stop delivering events for `fd`.
    fn deregister(&self, fd: i32) -> Result<(), PollError>;
}

impl DcbManager {
    /// Deliver readiness events for one DCB.
    ///
    /// Only one thread processes a DCB at a time. Events arriving while
    /// another thread owns the DCB are merged into its pending set and
    /// handled by that thread before it lets go.
    pub fn dispatch(&self, dcb: &Arc<Dcb>, events: EventMask) {
        dcb.pending.fetch_or(events.bits(), Ordering::AcqRel);
        loop {
            if dcb
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let pending = EventMask::from_bits_truncate(dcb.pending.swap(0, Ordering::AcqRel));
                if pending.is_empty() {
                    break;
                }
                self.handle_events(dcb, pending);
            }
            dcb.processing.store(false, Ordering::Release);
            if dcb.pending.load(Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    fn handle_events(&self, dcb: &Arc<Dcb>, events: EventMask) {
        tracing::trace!(dcb = dcb.id(), events = ?events, "processing events");

        if events.contains(EventMask::WRITE) && dcb.state() == DcbState::Polling {
            if let Err(e) = dcb.drain_write_queue() {
                tracing::debug!(dcb = dcb.id(), error = %e, "write failed");
                self.error(dcb);
                return;
            }
        }

        if events.contains(EventMask::READ) {
            match dcb.state() {
                DcbState::Listening => self.accept_pending(dcb),
                DcbState::Polling => {
                    if let Some(protocol) = dcb.protocol() {
                        match protocol.read(dcb) {
                            Ok(()) => {}
                            Err(ProtocolError::ConnectionClosed) => {
                                self.hangup(dcb);
                                return;
                            }
                            Err(e) => {
                                tracing::debug!(dcb = dcb.id(), error = %e, "read failed");
                                self.error(dcb);
                                return;
                            }
                        }
                    }
                }
                _ => return,
            }
        }

        if !matches!(dcb.state(), DcbState::Polling | DcbState::Listening) {
            return;
        }
        if events.contains(EventMask::ERROR) {
            self.error(dcb);
        }
        if events.contains(EventMask::HUP) {
            self.hangup(dcb);
        }
    }

    fn accept_pending(&self, listener: &Arc<Dcb>) {
        let Some(protocol) = listener.protocol() else {
            return;
        };
        let accepted = match protocol.accept(listener) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(dcb = listener.id(), error = %e, "accept failed");
                return;
            }
        };
        for conn in accepted {
            let fd = conn.fd;
            if let Err(e) = self.accept(listener, conn) {
                tracing::warn!(dcb = listener.id(), fd, error = %e, "rejected client connection");
            }
        }
    }
}

/// A worker thread's handle on the connection layer.
///
/// Creating a worker marks its slot active in the zombie queue; dropping it
/// marks the slot inactive.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    manager: Arc<DcbManager>,
}

impl Worker {
    /// Claim a worker slot.
    pub fn start(manager: Arc<DcbManager>, id: WorkerId) -> Result<Self, PollError> {
        manager.zombies().activate(id)?;
        Ok(Self { id, manager })
    }

    /// Worker slot index.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Process one batch of readiness events, then sweep the zombie queue.
    ///
    /// The batch's DCB references are dropped before the sweep. Returns the
    /// number of DCBs released by the sweep.
    pub fn process_batch<I>(&self, events: I) -> usize
    where
        I: IntoIterator<Item = (Arc<Dcb>, EventMask)>,
    {
        for (dcb, mask) in events {
            self.manager.dispatch(&dcb, mask);
        }
        self.manager.sweep_zombies(self.id)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        for dcb in self.manager.zombies().deactivate(self.id) {
            self.manager.release(dcb);
        }
    }
}
