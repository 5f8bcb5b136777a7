//! The descriptor control block (DCB): one socket endpoint.
//!
//! A DCB is shared between worker threads through `Arc`. Its hot-path fields
//! are atomics; only the lifecycle guard, the I/O queues and the callback
//! list sit behind short locks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::error::DcbError;
use crate::listener::Listener;
use crate::protocol::{Protocol, Session};
use crate::server::Server;

/// Descriptor value of a DCB without a socket.
pub const DCBFD_CLOSED: i32 = -1;

/// What a DCB is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DcbRole {
    /// Listening socket of a service.
    ServiceListener,
    /// Client connection.
    ClientHandler,
    /// Connection to a backend server.
    BackendHandler,
    /// Internal DCB with no socket of its own.
    Internal,
}

impl DcbRole {
    /// Human-readable role name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceListener => "Service Listener",
            Self::ClientHandler => "Client Request Handler",
            Self::BackendHandler => "Backend Request Handler",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for DcbRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle state of a DCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DcbState {
    /// Allocated, not yet known to the event demultiplexer.
    Alloc,
    /// Registered for readiness events.
    Polling,
    /// Registered as a listening socket.
    Listening,
    /// Temporarily removed from the event demultiplexer.
    NoPolling,
    /// Socket closed, awaiting retirement.
    Disconnected,
    /// Retired, waiting for every worker to let go of it.
    Zombie,
}

impl DcbState {
    /// Human-readable state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alloc => "DCB Allocated",
            Self::Polling => "DCB in the polling loop",
            Self::Listening => "DCB listening",
            Self::NoPolling => "DCB not in polling loop",
            Self::Disconnected => "DCB socket closed",
            Self::Zombie => "DCB Zombie",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: DcbState) -> bool {
        use DcbState::*;
        matches!(
            (self, next),
            (Alloc, Polling | Listening | Disconnected)
                | (Polling, NoPolling)
                | (NoPolling, Polling | Disconnected)
                | (Listening, Disconnected)
                | (Disconnected, Zombie)
        )
    }
}

impl fmt::Display for DcbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// TLS handshake progress of a DCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SslState {
    /// TLS status not yet known.
    #[default]
    Unknown,
    /// The client asked for TLS; the handshake has not started.
    HandshakeRequired,
    /// The handshake completed.
    HandshakeDone,
    /// The connection is encrypted and verified.
    Established,
    /// The handshake failed.
    HandshakeFailed,
}

/// Events a DCB callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DcbReason {
    /// The DCB is being closed.
    Close,
    /// The write queue became empty.
    Drained,
    /// The write queue grew past the high watermark.
    HighWater,
    /// The write queue fell below the low watermark.
    LowWater,
    /// An error was detected on the socket.
    Error,
    /// The peer hung up.
    Hup,
    /// The server behind the DCB stopped responding.
    NotResponding,
}

impl DcbReason {
    /// Human-readable reason name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Close => "Close",
            Self::Drained => "Drained",
            Self::HighWater => "High Water",
            Self::LowWater => "Low Water",
            Self::Error => "Error",
            Self::Hup => "Hangup",
            Self::NotResponding => "Not Responding",
        }
    }
}

impl fmt::Display for DcbReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

bitflags! {
    /// Per-DCB flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DcbFlags: u32 {
        /// Clone of another DCB.
        const CLONE = 0x0001;
        /// The peer hung up.
        const HUNG = 0x0002;
        /// A reply has been sent to the client.
        const REPLIED = 0x0004;
    }
}

/// DCB classes counted by [`DcbManager::count_by_usage`](crate::DcbManager::count_by_usage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DcbUsage {
    /// Client connections.
    Client,
    /// Listening sockets.
    Listener,
    /// Backend connections.
    Backend,
    /// Internal DCBs.
    Internal,
    /// Retired DCBs not yet released.
    Zombie,
    /// Every live DCB.
    All,
}

impl DcbUsage {
    pub(crate) fn matches(self, dcb: &Dcb) -> bool {
        match self {
            Self::Client => dcb.role() == DcbRole::ClientHandler,
            Self::Listener => dcb.role() == DcbRole::ServiceListener,
            Self::Backend => dcb.role() == DcbRole::BackendHandler,
            Self::Internal => dcb.role() == DcbRole::Internal,
            Self::Zombie => dcb.state() == DcbState::Zombie,
            Self::All => true,
        }
    }
}

/// Opaque data passed back to a callback.
pub type CallbackData = Arc<dyn Any + Send + Sync>;

/// A DCB callback.
pub type DcbCallback = fn(&Dcb, DcbReason, Option<&CallbackData>);

#[derive(Clone)]
struct CallbackEntry {
    reason: DcbReason,
    func: DcbCallback,
    data: Option<CallbackData>,
}

impl CallbackEntry {
    fn matches(&self, reason: DcbReason, func: DcbCallback, data: Option<&CallbackData>) -> bool {
        self.reason == reason
            && std::ptr::fn_addr_eq(self.func, func)
            && match (&self.data, data) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

#[derive(Debug, Default)]
struct DcbCounters {
    n_reads: AtomicU64,
    n_writes: AtomicU64,
    n_accepts: AtomicU64,
    n_buffered: AtomicU64,
    n_high_water: AtomicU64,
    n_low_water: AtomicU64,
}

/// Snapshot of DCB statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DcbStats {
    /// Reads taken from the read queue.
    pub n_reads: u64,
    /// Socket writes performed while draining.
    pub n_writes: u64,
    /// Connections accepted (listening DCBs).
    pub n_accepts: u64,
    /// Buffers appended to the write queue.
    pub n_buffered: u64,
    /// High watermark crossings.
    pub n_high_water: u64,
    /// Low watermark crossings.
    pub n_low_water: u64,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) state: DcbState,
    pub(crate) closing: bool,
    pub(crate) pooled: bool,
}

impl Lifecycle {
    pub(crate) fn transition(&mut self, id: u64, next: DcbState) -> Result<(), DcbError> {
        if !self.state.can_transition_to(next) {
            return Err(DcbError::InvalidTransition {
                id,
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(dcb = id, from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }
}

/// A connection object.
pub struct Dcb {
    id: u64,
    role: DcbRole,
    fd: AtomicI32,
    remote: RwLock<Option<String>>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    ssl_state: Mutex<SslState>,
    flags: AtomicU32,
    error_handled: AtomicBool,
    readq: Mutex<BytesMut>,
    writeq: Mutex<BytesMut>,
    drain: Mutex<()>,
    delayq: Mutex<BytesMut>,
    high_water: AtomicUsize,
    low_water: AtomicUsize,
    callbacks: Mutex<Vec<CallbackEntry>>,
    session: RwLock<Option<Arc<Session>>>,
    server: OnceCell<Arc<Server>>,
    protocol: OnceCell<Arc<dyn Protocol>>,
    listener: Option<Arc<Listener>>,
    user: Mutex<Option<String>>,
    counters: DcbCounters,
    created: Instant,
    zombie_mask: AtomicU64,
    released: AtomicBool,
    pub(crate) counted: AtomicBool,
    pub(crate) pending: AtomicU32,
    pub(crate) processing: AtomicBool,
}

impl Dcb {
    pub(crate) fn new(
        id: u64,
        role: DcbRole,
        listener: Option<Arc<Listener>>,
        high_water: usize,
        low_water: usize,
    ) -> Self {
        Self {
            id,
            role,
            fd: AtomicI32::new(DCBFD_CLOSED),
            remote: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: DcbState::Alloc,
                closing: false,
                pooled: false,
            }),
            ssl_state: Mutex::new(SslState::Unknown),
            flags: AtomicU32::new(0),
            error_handled: AtomicBool::new(false),
            readq: Mutex::new(BytesMut::new()),
            writeq: Mutex::new(BytesMut::new()),
            drain: Mutex::new(()),
            delayq: Mutex::new(BytesMut::new()),
            high_water: AtomicUsize::new(high_water),
            low_water: AtomicUsize::new(low_water),
            callbacks: Mutex::new(Vec::new()),
            session: RwLock::new(None),
            server: OnceCell::new(),
            protocol: OnceCell::new(),
            listener,
            user: Mutex::new(None),
            counters: DcbCounters::default(),
            created: Instant::now(),
            zombie_mask: AtomicU64::new(0),
            released: AtomicBool::new(false),
            counted: AtomicBool::new(false),
            pending: AtomicU32::new(0),
            processing: AtomicBool::new(false),
        }
    }

    /// Unique DCB id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The DCB role.
    #[must_use]
    pub fn role(&self) -> DcbRole {
        self.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DcbState {
        self.lifecycle.lock().state
    }

    /// Whether the DCB is idle in a server's persistent pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.lifecycle.lock().pooled
    }

    /// Socket descriptor, or [`DCBFD_CLOSED`].
    #[must_use]
    pub fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn set_fd(&self, fd: i32) {
        self.fd.store(fd, Ordering::Release);
    }

    /// Peer address.
    #[must_use]
    pub fn remote(&self) -> Option<String> {
        self.remote.read().clone()
    }

    pub(crate) fn set_remote(&self, remote: Option<String>) {
        *self.remote.write() = remote;
    }

    /// TLS handshake state.
    #[must_use]
    pub fn ssl_state(&self) -> SslState {
        *self.ssl_state.lock()
    }

    /// Record TLS handshake progress.
    pub fn set_ssl_state(&self, state: SslState) {
        *self.ssl_state.lock() = state;
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> DcbFlags {
        DcbFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Set flags; returns the flags as they were before.
    pub fn set_flags(&self, flags: DcbFlags) -> DcbFlags {
        DcbFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear flags.
    pub fn clear_flags(&self, flags: DcbFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the peer hung up.
    #[must_use]
    pub fn is_hung(&self) -> bool {
        self.flags().contains(DcbFlags::HUNG)
    }

    /// Whether an error has been handled on this DCB.
    #[must_use]
    pub fn error_handled(&self) -> bool {
        self.error_handled.load(Ordering::Acquire)
    }

    /// Mark the error as handled; true for the first caller only.
    pub(crate) fn mark_error_handled(&self) -> bool {
        !self.error_handled.swap(true, Ordering::AcqRel)
    }

    /// Neither hung up nor errored.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.is_hung() && !self.error_handled()
    }

    /// The user the connection is authenticated as.
    #[must_use]
    pub fn user(&self) -> Option<String> {
        self.user.lock().clone()
    }

    /// Set or clear the user.
    pub fn set_user(&self, user: Option<String>) {
        *self.user.lock() = user;
    }

    pub(crate) fn take_user(&self) -> Option<String> {
        self.user.lock().take()
    }

    pub(crate) fn user_is(&self, user: &str) -> bool {
        self.user.lock().as_deref() == Some(user)
    }

    pub(crate) fn has_user(&self) -> bool {
        self.user.lock().as_deref().is_some_and(|u| !u.is_empty())
    }

    /// The protocol module serving this DCB.
    #[must_use]
    pub fn protocol(&self) -> Option<&Arc<dyn Protocol>> {
        self.protocol.get()
    }

    /// Name of the protocol module.
    #[must_use]
    pub fn protocol_name(&self) -> Option<&str> {
        self.protocol.get().map(|p| p.name())
    }

    pub(crate) fn bind_protocol(&self, protocol: Arc<dyn Protocol>) {
        if self.protocol.set(protocol).is_err() {
            tracing::warn!(dcb = self.id, "protocol module already bound");
        }
    }

    /// The backend server, for backend DCBs.
    #[must_use]
    pub fn server(&self) -> Option<&Arc<Server>> {
        self.server.get()
    }

    pub(crate) fn bind_server(&self, server: Arc<Server>) {
        if self.server.set(server).is_err() {
            tracing::warn!(dcb = self.id, "server already bound");
        }
    }

    /// The listener that accepted this DCB, or the one it listens for.
    #[must_use]
    pub fn listener(&self) -> Option<&Arc<Listener>> {
        self.listener.as_ref()
    }

    /// The session the DCB serves.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    /// Attach or detach the session.
    pub fn set_session(&self, session: Option<Arc<Session>>) {
        *self.session.write() = session;
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> DcbStats {
        let c = &self.counters;
        DcbStats {
            n_reads: c.n_reads.load(Ordering::Relaxed),
            n_writes: c.n_writes.load(Ordering::Relaxed),
            n_accepts: c.n_accepts.load(Ordering::Relaxed),
            n_buffered: c.n_buffered.load(Ordering::Relaxed),
            n_high_water: c.n_high_water.load(Ordering::Relaxed),
            n_low_water: c.n_low_water.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_accept(&self) {
        self.counters.n_accepts.fetch_add(1, Ordering::Relaxed);
    }

    /// When the DCB was allocated.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Time since allocation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Write queue high watermark; 0 when disabled.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Write queue low watermark; 0 when disabled.
    #[must_use]
    pub fn low_water(&self) -> usize {
        self.low_water.load(Ordering::Relaxed)
    }

    /// Set the high watermark.
    pub fn set_high_water(&self, bytes: usize) {
        self.high_water.store(bytes, Ordering::Relaxed);
    }

    /// Set the low watermark.
    pub fn set_low_water(&self, bytes: usize) {
        self.low_water.store(bytes, Ordering::Relaxed);
    }

    /// Workers that were active when the DCB was retired.
    #[must_use]
    pub fn zombie_mask(&self) -> u64 {
        self.zombie_mask.load(Ordering::Acquire)
    }

    pub(crate) fn set_zombie_mask(&self, mask: u64) {
        self.zombie_mask.store(mask, Ordering::Release);
    }

    /// Bytes waiting in the write queue.
    #[must_use]
    pub fn writeq_len(&self) -> usize {
        self.writeq.lock().len()
    }

    /// Bytes waiting in the delay queue.
    #[must_use]
    pub fn delayq_len(&self) -> usize {
        self.delayq.lock().len()
    }

    /// Queue bytes for sending.
    ///
    /// Fires [`DcbReason::HighWater`] when the queue grows past the high
    /// watermark. Nothing is sent until the queue is drained.
    pub fn write(&self, data: &[u8]) -> Result<(), DcbError> {
        let state = self.state();
        if !matches!(state, DcbState::Polling | DcbState::NoPolling) {
            return Err(DcbError::NotWritable { id: self.id, state });
        }
        if data.is_empty() {
            return Ok(());
        }

        let (before, after) = {
            let mut queue = self.writeq.lock();
            let before = queue.len();
            queue.extend_from_slice(data);
            (before, queue.len())
        };
        self.counters.n_buffered.fetch_add(1, Ordering::Relaxed);

        let high = self.high_water();
        if high > 0 && before <= high && after > high {
            self.counters.n_high_water.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(dcb = self.id, queued = after, high, "high watermark crossed");
            self.invoke_callbacks(DcbReason::HighWater);
        }
        Ok(())
    }

    /// Hand queued bytes to the protocol module.
    ///
    /// Stops when the queue is empty or the socket takes no more. The
    /// unwritten tail stays queued ahead of anything written meanwhile.
    /// Returns the number of bytes written.
    ///
    /// The write queue is not locked while [`Protocol::write`] runs, so the
    /// module may queue more data on the same DCB. Drains are serialized;
    /// a module must not drain the DCB it is writing to.
    pub fn drain_write_queue(&self) -> Result<usize, DcbError> {
        let protocol = self.protocol.get().ok_or(DcbError::NoProtocol { id: self.id })?;
        let drain = self.drain.lock();

        let before = self.writeq_len();
        let mut written = 0;
        loop {
            let pending = self.writeq.lock().split().freeze();
            if pending.is_empty() {
                break;
            }
            let mut sent = 0;
            let result = loop {
                if sent == pending.len() {
                    break Ok(());
                }
                match protocol.write(self, &pending[sent..]) {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        sent += n.min(pending.len() - sent);
                        self.counters.n_writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => break Err(e),
                }
            };
            written += sent;
            if sent < pending.len() {
                let mut queue = self.writeq.lock();
                let mut restored = BytesMut::with_capacity(pending.len() - sent + queue.len());
                restored.extend_from_slice(&pending[sent..]);
                restored.extend_from_slice(&queue);
                *queue = restored;
                result?;
                break;
            }
        }
        let after = self.writeq_len();
        drop(drain);

        let low = self.low_water();
        if low > 0 && before >= low && after < low {
            self.counters.n_low_water.fetch_add(1, Ordering::Relaxed);
            self.invoke_callbacks(DcbReason::LowWater);
        }
        if before > 0 && after == 0 {
            self.invoke_callbacks(DcbReason::Drained);
        }
        Ok(written)
    }

    /// Append bytes read from the socket. Used by protocol modules.
    pub fn push_read(&self, data: &[u8]) {
        self.readq.lock().extend_from_slice(data);
    }

    /// Take everything in the read queue.
    pub fn read(&self) -> Bytes {
        let data = self.readq.lock().split().freeze();
        if !data.is_empty() {
            self.counters.n_reads.fetch_add(1, Ordering::Relaxed);
        }
        data
    }

    /// Hold backend writes until authentication completes.
    pub fn delay_write(&self, data: &[u8]) {
        self.delayq.lock().extend_from_slice(data);
    }

    /// Move delayed bytes onto the write queue; returns how many moved.
    pub fn flush_delay_queue(&self) -> Result<usize, DcbError> {
        let data = self.delayq.lock().split().freeze();
        if data.is_empty() {
            return Ok(0);
        }
        self.write(&data)?;
        Ok(data.len())
    }

    /// Register a callback.
    ///
    /// The same (reason, function, data) triple can be registered once.
    pub fn add_callback(
        &self,
        reason: DcbReason,
        func: DcbCallback,
        data: Option<CallbackData>,
    ) -> Result<(), DcbError> {
        let mut callbacks = self.callbacks.lock();
        if callbacks
            .iter()
            .any(|cb| cb.matches(reason, func, data.as_ref()))
        {
            return Err(DcbError::DuplicateCallback { id: self.id });
        }
        callbacks.push(CallbackEntry { reason, func, data });
        Ok(())
    }

    /// Remove a callback matching the (reason, function, data) triple.
    pub fn remove_callback(
        &self,
        reason: DcbReason,
        func: DcbCallback,
        data: Option<&CallbackData>,
    ) -> bool {
        let mut callbacks = self.callbacks.lock();
        match callbacks.iter().position(|cb| cb.matches(reason, func, data)) {
            Some(index) => {
                callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of callbacks registered for a reason.
    #[must_use]
    pub fn callback_count(&self, reason: DcbReason) -> usize {
        self.callbacks
            .lock()
            .iter()
            .filter(|cb| cb.reason == reason)
            .count()
    }

    /// Call every callback for `reason` in registration order.
    ///
    /// Callbacks run without the list lock held and may add or remove
    /// callbacks.
    pub(crate) fn invoke_callbacks(&self, reason: DcbReason) {
        let matching: Vec<CallbackEntry> = self
            .callbacks
            .lock()
            .iter()
            .filter(|cb| cb.reason == reason)
            .cloned()
            .collect();
        for cb in matching {
            (cb.func)(self, reason, cb.data.as_ref());
        }
    }

    pub(crate) fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }

    /// Drop everything the DCB holds on to; true for the first caller.
    pub(crate) fn release_resources(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_fd(DCBFD_CLOSED);
        self.readq.lock().clear();
        self.writeq.lock().clear();
        self.delayq.lock().clear();
        self.callbacks.lock().clear();
        self.set_session(None);
        self.set_user(None);
        true
    }

    /// Whether the DCB's resources have been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Dcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dcb")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("fd", &self.fd())
            .field("protocol", &self.protocol_name())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::protocol::Accepted;

    /// Accepts at most `chunk` bytes per write.
    struct ChunkSink {
        chunk: usize,
    }

    impl Protocol for ChunkSink {
        fn name(&self) -> &str {
            "sink"
        }
        fn read(&self, _dcb: &Dcb) -> Result<(), ProtocolError> {
            Ok(())
        }
        fn write(&self, _dcb: &Dcb, data: &[u8]) -> Result<usize, ProtocolError> {
            Ok(data.len().min(self.chunk))
        }
        fn accept(&self, _listener: &Dcb) -> Result<Vec<Accepted>, ProtocolError> {
            Ok(Vec::new())
        }
        fn connect(
            &self,
            _dcb: &Dcb,
            _server: &Server,
            _session: &Session,
        ) -> Result<i32, ProtocolError> {
            Ok(3)
        }
        fn close(&self, _dcb: &Dcb) {}
        fn listen(&self, _dcb: &Dcb, _address: &str, _port: u16) -> Result<i32, ProtocolError> {
            Ok(3)
        }
    }

    type Log = Mutex<Vec<String>>;

    fn record(dcb: &Dcb, reason: DcbReason, data: Option<&CallbackData>) {
        let log = data.unwrap().downcast_ref::<Log>().unwrap();
        log.lock().push(format!("first:{}:{}", dcb.id(), reason));
    }

    fn record_second(_dcb: &Dcb, reason: DcbReason, data: Option<&CallbackData>) {
        let log = data.unwrap().downcast_ref::<Log>().unwrap();
        log.lock().push(format!("second:{reason}"));
    }

    fn polling_dcb(chunk: usize) -> Dcb {
        let dcb = Dcb::new(7, DcbRole::ClientHandler, None, 0, 0);
        dcb.bind_protocol(Arc::new(ChunkSink { chunk }));
        dcb.lifecycle.lock().state = DcbState::Polling;
        dcb
    }

    fn log() -> (Arc<Log>, CallbackData) {
        let log: Arc<Log> = Arc::new(Mutex::new(Vec::new()));
        let data: CallbackData = log.clone();
        (log, data)
    }

    #[test]
    fn test_transitions() {
        use DcbState::*;
        assert!(Alloc.can_transition_to(Polling));
        assert!(Alloc.can_transition_to(Listening));
        assert!(Polling.can_transition_to(NoPolling));
        assert!(NoPolling.can_transition_to(Polling));
        assert!(NoPolling.can_transition_to(Disconnected));
        assert!(Listening.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Zombie));

        assert!(!Listening.can_transition_to(Polling));
        assert!(!Listening.can_transition_to(NoPolling));
        assert!(!Polling.can_transition_to(Disconnected));
        for next in [Alloc, Polling, Listening, NoPolling, Disconnected, Zombie] {
            assert!(!Zombie.can_transition_to(next));
        }
    }

    #[test]
    fn test_lifecycle_rejects_invalid_transition() {
        let dcb = Dcb::new(1, DcbRole::ServiceListener, None, 0, 0);
        let mut lc = dcb.lifecycle.lock();
        lc.transition(1, DcbState::Listening).unwrap();
        let err = lc.transition(1, DcbState::NoPolling).unwrap_err();
        assert!(matches!(
            err,
            DcbError::InvalidTransition {
                from: DcbState::Listening,
                to: DcbState::NoPolling,
                ..
            }
        ));
        assert_eq!(lc.state, DcbState::Listening);
    }

    #[test]
    fn test_callbacks_in_registration_order() {
        let dcb = polling_dcb(usize::MAX);
        let (log, data) = log();
        dcb.add_callback(DcbReason::Close, record, Some(data.clone()))
            .unwrap();
        dcb.add_callback(DcbReason::Close, record_second, Some(data.clone()))
            .unwrap();
        dcb.add_callback(DcbReason::Hup, record, Some(data.clone()))
            .unwrap();

        dcb.invoke_callbacks(DcbReason::Close);
        assert_eq!(*log.lock(), vec!["first:7:Close", "second:Close"]);
    }

    #[test]
    fn test_callback_triple_matching() {
        let dcb = polling_dcb(usize::MAX);
        let (_, data) = log();
        let (_, other) = log();

        dcb.add_callback(DcbReason::Close, record, Some(data.clone()))
            .unwrap();
        assert!(matches!(
            dcb.add_callback(DcbReason::Close, record, Some(data.clone())),
            Err(DcbError::DuplicateCallback { id: 7 })
        ));
        dcb.add_callback(DcbReason::Close, record, Some(other.clone()))
            .unwrap();

        assert!(!dcb.remove_callback(DcbReason::Close, record_second, Some(&data)));
        assert!(!dcb.remove_callback(DcbReason::Error, record, Some(&data)));
        assert!(!dcb.remove_callback(DcbReason::Close, record, None));
        assert!(dcb.remove_callback(DcbReason::Close, record, Some(&data)));
        assert_eq!(dcb.callback_count(DcbReason::Close), 1);
    }

    #[test]
    fn test_write_requires_polling_state() {
        let dcb = Dcb::new(2, DcbRole::ClientHandler, None, 0, 0);
        assert!(matches!(
            dcb.write(b"x"),
            Err(DcbError::NotWritable {
                state: DcbState::Alloc,
                ..
            })
        ));
    }

    #[test]
    fn test_high_water_fires_once_per_crossing() {
        let dcb = polling_dcb(usize::MAX);
        dcb.set_high_water(10);
        let (log, data) = log();
        dcb.add_callback(DcbReason::HighWater, record, Some(data))
            .unwrap();

        dcb.write(b"12345").unwrap();
        dcb.write(b"123456").unwrap();
        dcb.write(b"more").unwrap();
        assert_eq!(log.lock().len(), 1);
        assert_eq!(dcb.stats().n_high_water, 1);
        assert_eq!(dcb.stats().n_buffered, 3);
        assert_eq!(dcb.writeq_len(), 15);
    }

    #[test]
    fn test_drain_fires_low_water_and_drained() {
        let dcb = polling_dcb(4);
        dcb.set_low_water(6);
        let (log, data) = log();
        dcb.add_callback(DcbReason::LowWater, record_second, Some(data.clone()))
            .unwrap();
        dcb.add_callback(DcbReason::Drained, record_second, Some(data))
            .unwrap();

        dcb.write(b"0123456789").unwrap();
        assert_eq!(dcb.drain_write_queue().unwrap(), 10);
        assert_eq!(dcb.writeq_len(), 0);
        assert_eq!(dcb.stats().n_writes, 3);
        assert_eq!(dcb.stats().n_low_water, 1);
        assert_eq!(*log.lock(), vec!["second:Low Water", "second:Drained"]);

        assert_eq!(dcb.drain_write_queue().unwrap(), 0);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_blocked_socket_keeps_tail() {
        let dcb = polling_dcb(0);
        dcb.write(b"abc").unwrap();
        assert_eq!(dcb.drain_write_queue().unwrap(), 0);
        assert_eq!(dcb.writeq_len(), 3);
    }

    /// Queues a trailer on the DCB from inside its first write and accepts
    /// at most `chunk` bytes per call.
    struct Appending {
        chunk: usize,
        sent: Mutex<Vec<u8>>,
        queued_during_write: Mutex<Vec<usize>>,
    }

    impl Protocol for Appending {
        fn name(&self) -> &str {
            "appending"
        }
        fn read(&self, _dcb: &Dcb) -> Result<(), ProtocolError> {
            Ok(())
        }
        fn write(&self, dcb: &Dcb, data: &[u8]) -> Result<usize, ProtocolError> {
            let first = self.queued_during_write.lock().is_empty();
            self.queued_during_write.lock().push(dcb.writeq_len());
            if first {
                dcb.write(b"!").map_err(|e| ProtocolError::Io(std::io::Error::other(e.to_string())))?;
            }
            let n = data.len().min(self.chunk);
            self.sent.lock().extend_from_slice(&data[..n]);
            Ok(n)
        }
        fn accept(&self, _listener: &Dcb) -> Result<Vec<Accepted>, ProtocolError> {
            Ok(Vec::new())
        }
        fn connect(
            &self,
            _dcb: &Dcb,
            _server: &Server,
            _session: &Session,
        ) -> Result<i32, ProtocolError> {
            Ok(3)
        }
        fn close(&self, _dcb: &Dcb) {}
        fn listen(&self, _dcb: &Dcb, _address: &str, _port: u16) -> Result<i32, ProtocolError> {
            Ok(3)
        }
    }

    #[test]
    fn test_protocol_may_queue_from_inside_write() {
        let protocol = Arc::new(Appending {
            chunk: 3,
            sent: Mutex::new(Vec::new()),
            queued_during_write: Mutex::new(Vec::new()),
        });
        let dcb = Dcb::new(9, DcbRole::ClientHandler, None, 0, 0);
        dcb.bind_protocol(protocol.clone());
        dcb.lifecycle.lock().state = DcbState::Polling;

        dcb.write(b"hello").unwrap();
        assert_eq!(dcb.drain_write_queue().unwrap(), 6);
        assert_eq!(&protocol.sent.lock()[..], b"hello!");
        assert_eq!(protocol.queued_during_write.lock()[0], 0);
        assert_eq!(dcb.writeq_len(), 0);
    }

    #[test]
    fn test_unwritten_tail_stays_ahead_of_new_data() {
        let dcb = polling_dcb(0);
        dcb.write(b"abc").unwrap();
        assert_eq!(dcb.drain_write_queue().unwrap(), 0);
        dcb.write(b"def").unwrap();
        assert_eq!(&dcb.writeq.lock()[..], b"abcdef");
    }

    #[test]
    fn test_read_queue() {
        let dcb = polling_dcb(1);
        assert!(dcb.read().is_empty());
        dcb.push_read(b"SELECT ");
        dcb.push_read(b"1");
        assert_eq!(&dcb.read()[..], b"SELECT 1");
        assert_eq!(dcb.stats().n_reads, 1);
    }

    #[test]
    fn test_delay_queue_flush() {
        let dcb = polling_dcb(1);
        dcb.delay_write(b"auth");
        dcb.delay_write(b"-pending");
        assert_eq!(dcb.delayq_len(), 12);
        assert_eq!(dcb.flush_delay_queue().unwrap(), 12);
        assert_eq!(dcb.delayq_len(), 0);
        assert_eq!(dcb.writeq_len(), 12);
        assert_eq!(dcb.flush_delay_queue().unwrap(), 0);
    }

    #[test]
    fn test_watermarks_are_distinct() {
        let dcb = polling_dcb(1);
        dcb.set_high_water(100);
        dcb.set_low_water(10);
        assert_eq!(dcb.high_water(), 100);
        assert_eq!(dcb.low_water(), 10);
    }

    #[test]
    fn test_flags_and_health() {
        let dcb = polling_dcb(1);
        assert!(dcb.is_healthy());
        let before = dcb.set_flags(DcbFlags::HUNG);
        assert!(before.is_empty());
        assert!(dcb.is_hung());
        assert!(!dcb.is_healthy());
        dcb.clear_flags(DcbFlags::HUNG);
        assert!(dcb.mark_error_handled());
        assert!(!dcb.mark_error_handled());
        assert!(!dcb.is_healthy());
    }

    #[test]
    fn test_release_resources_once() {
        let dcb = polling_dcb(1);
        dcb.set_fd(9);
        dcb.write(b"pending").unwrap();
        dcb.set_user(Some("alice".into()));
        assert!(dcb.release_resources());
        assert!(!dcb.release_resources());
        assert_eq!(dcb.fd(), DCBFD_CLOSED);
        assert_eq!(dcb.writeq_len(), 0);
        assert!(dcb.user().is_none());
    }
}
