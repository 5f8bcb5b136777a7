//! Per-server pool of idle backend connections.
//!
//! Pooled DCBs stay registered with the event demultiplexer so a hangup
//! while idle is still noticed; such entries are evicted on the next clean.
//! One lock guards the whole list and is held for each full traversal.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dcb::{Dcb, DcbRole};
use crate::server::Server;

/// Why a DCB was not taken into a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolRejection {
    /// The server has pooling disabled.
    Disabled,
    /// Only backend connections can be pooled.
    NotBackend,
    /// The connection has no authenticated user.
    NoUser,
    /// The connection hung up or had an error.
    Unhealthy,
    /// The connection is older than the pool's age limit.
    Expired,
    /// The server is not running.
    ServerDown,
    /// The pool is at its size limit.
    Full,
}

impl fmt::Display for PoolRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "pooling disabled",
            Self::NotBackend => "not a backend connection",
            Self::NoUser => "no user",
            Self::Unhealthy => "hung up or errored",
            Self::Expired => "too old",
            Self::ServerDown => "server not running",
            Self::Full => "pool full",
        })
    }
}

#[derive(Debug)]
struct PoolEntry {
    dcb: Arc<Dcb>,
    pooled_at: Instant,
}

/// Result of a clean pass.
#[derive(Debug, Default)]
#[must_use = "evicted DCBs must be destroyed"]
pub(crate) struct PoolSweep {
    pub(crate) live: usize,
    pub(crate) evicted: Vec<Arc<Dcb>>,
}

/// Result of an acquire.
#[derive(Debug, Default)]
#[must_use = "evicted DCBs must be destroyed"]
pub(crate) struct PoolCheckout {
    pub(crate) hit: Option<(Arc<Dcb>, String)>,
    pub(crate) evicted: Vec<Arc<Dcb>>,
}

#[derive(Debug)]
pub(crate) struct PersistentPool {
    max_size: usize,
    max_time: Duration,
    entries: Mutex<VecDeque<PoolEntry>>,
    max_observed: AtomicUsize,
}

impl PersistentPool {
    pub(crate) fn new(max_size: usize, max_time: Duration) -> Self {
        Self {
            max_size,
            max_time,
            entries: Mutex::new(VecDeque::new()),
            max_observed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn max_time(&self) -> Duration {
        self.max_time
    }

    fn expired(&self, entry: &PoolEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.pooled_at) > self.max_time
    }

    /// Single pass removing aged and unhealthy entries.
    fn evict_locked(&self, entries: &mut VecDeque<PoolEntry>, now: Instant) -> Vec<Arc<Dcb>> {
        let mut evicted = Vec::new();
        let mut kept = VecDeque::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if !entry.dcb.is_healthy() || self.expired(&entry, now) {
                evicted.push(entry.dcb);
            } else {
                kept.push_back(entry);
            }
        }
        *entries = kept;
        evicted
    }
}

impl Server {
    /// Take a closing backend DCB into the pool.
    pub(crate) fn pool_offer(&self, dcb: &Arc<Dcb>) -> Result<(), PoolRejection> {
        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(PoolRejection::Disabled);
        }
        if dcb.role() != DcbRole::BackendHandler {
            return Err(PoolRejection::NotBackend);
        }
        if !dcb.has_user() {
            return Err(PoolRejection::NoUser);
        }
        if !dcb.is_healthy() {
            return Err(PoolRejection::Unhealthy);
        }
        if dcb.age() >= pool.max_time {
            return Err(PoolRejection::Expired);
        }
        if !self.is_running() {
            return Err(PoolRejection::ServerDown);
        }

        let mut entries = pool.entries.lock();
        if entries.len() >= pool.max_size {
            return Err(PoolRejection::Full);
        }
        entries.push_front(PoolEntry {
            dcb: Arc::clone(dcb),
            pooled_at: Instant::now(),
        });
        pool.max_observed.fetch_max(entries.len(), Ordering::Relaxed);

        self.counters.n_persistent.fetch_add(1, Ordering::Relaxed);
        self.counters.n_current.fetch_sub(1, Ordering::Relaxed);
        dcb.counted.store(false, Ordering::Release);
        Ok(())
    }

    /// Count live entries, evicting stale ones when `delete` is set.
    pub(crate) fn pool_clean(&self, delete: bool, now: Instant) -> PoolSweep {
        let mut entries = self.pool.entries.lock();
        if !delete {
            return PoolSweep {
                live: entries.len(),
                evicted: Vec::new(),
            };
        }
        let evicted = self.pool.evict_locked(&mut entries, now);
        self.uncount_pooled(evicted.len());
        PoolSweep {
            live: entries.len(),
            evicted,
        }
    }

    /// Hand out an idle connection for `user` speaking `protocol`.
    pub(crate) fn pool_acquire(&self, user: &str, protocol: &str, now: Instant) -> PoolCheckout {
        if !self.is_running() {
            return PoolCheckout::default();
        }
        let mut entries = self.pool.entries.lock();
        if entries.is_empty() {
            return PoolCheckout::default();
        }

        let evicted = self.pool.evict_locked(&mut entries, now);
        self.uncount_pooled(evicted.len());

        let position = entries.iter().position(|entry| {
            entry.dcb.is_healthy()
                && entry.dcb.user_is(user)
                && entry.dcb.protocol_name() == Some(protocol)
        });
        let hit = position.and_then(|i| entries.remove(i)).map(|entry| {
            let user = entry.dcb.take_user().unwrap_or_default();
            self.counters.n_persistent.fetch_sub(1, Ordering::Relaxed);
            self.counters.n_current.fetch_add(1, Ordering::Relaxed);
            entry.dcb.counted.store(true, Ordering::Release);
            (entry.dcb, user)
        });

        PoolCheckout { hit, evicted }
    }

    /// Remove every entry.
    pub(crate) fn pool_drain(&self) -> Vec<Arc<Dcb>> {
        let drained: Vec<_> = self
            .pool
            .entries
            .lock()
            .drain(..)
            .map(|entry| entry.dcb)
            .collect();
        self.uncount_pooled(drained.len());
        drained
    }

    fn uncount_pooled(&self, n: usize) {
        if n > 0 {
            self.counters
                .n_persistent
                .fetch_sub(n as i64, Ordering::Relaxed);
        }
    }

    /// Ids of the pooled DCBs, most recently pooled first.
    #[must_use]
    pub fn pooled_ids(&self) -> Vec<u64> {
        self.pool.entries.lock().iter().map(|e| e.dcb.id()).collect()
    }

    /// Largest pool size seen.
    #[must_use]
    pub fn pool_max_observed(&self) -> usize {
        self.pool.max_observed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::dcb::{DcbFlags, DcbState};
    use crate::error::ProtocolError;
    use crate::protocol::{Accepted, Protocol, Session};
    use crate::server::ServerStatus;

    struct Named(&'static str);

    impl Protocol for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn read(&self, _dcb: &Dcb) -> Result<(), ProtocolError> {
            Ok(())
        }
        fn write(&self, _dcb: &Dcb, data: &[u8]) -> Result<usize, ProtocolError> {
            Ok(data.len())
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
            Ok(5)
        }
        fn close(&self, _dcb: &Dcb) {}
        fn listen(&self, _dcb: &Dcb, _address: &str, _port: u16) -> Result<i32, ProtocolError> {
            Ok(5)
        }
    }

    fn server(max: usize) -> Server {
        Server::new(ServerConfig::new("db1").persistent_pool(max, Duration::from_secs(60)))
    }

    fn backend(id: u64, user: &str, protocol: &'static str) -> Arc<Dcb> {
        let dcb = Arc::new(Dcb::new(id, DcbRole::BackendHandler, None, 0, 0));
        dcb.bind_protocol(Arc::new(Named(protocol)));
        dcb.set_user(Some(user.to_string()));
        dcb.lifecycle.lock().state = DcbState::Polling;
        dcb
    }

    #[test]
    fn test_offer_then_acquire_round_trip() {
        let s = server(2);
        let dcb = backend(1, "alice", "MySQLBackend");
        let before = s.stats();

        s.pool_offer(&dcb).unwrap();
        assert_eq!(s.stats().n_persistent, before.n_persistent + 1);
        assert_eq!(s.stats().n_current, before.n_current - 1);

        let checkout = s.pool_acquire("alice", "MySQLBackend", Instant::now());
        let (got, user) = checkout.hit.unwrap();
        assert!(Arc::ptr_eq(&got, &dcb));
        assert_eq!(user, "alice");
        assert!(got.user().is_none());
        assert_eq!(s.stats(), before);
    }

    #[test]
    fn test_offer_rejections() {
        let s = server(1);
        let hung = backend(1, "alice", "p");
        hung.set_flags(DcbFlags::HUNG);
        assert_eq!(s.pool_offer(&hung), Err(PoolRejection::Unhealthy));

        let errored = backend(2, "alice", "p");
        errored.mark_error_handled();
        assert_eq!(s.pool_offer(&errored), Err(PoolRejection::Unhealthy));

        let anonymous = backend(3, "", "p");
        assert_eq!(s.pool_offer(&anonymous), Err(PoolRejection::NoUser));

        let client = Arc::new(Dcb::new(4, DcbRole::ClientHandler, None, 0, 0));
        assert_eq!(s.pool_offer(&client), Err(PoolRejection::NotBackend));

        s.pool_offer(&backend(5, "alice", "p")).unwrap();
        assert_eq!(s.pool_offer(&backend(6, "alice", "p")), Err(PoolRejection::Full));

        assert_eq!(
            server(0).pool_offer(&backend(7, "alice", "p")),
            Err(PoolRejection::Disabled)
        );

        let down = server(1);
        down.clear_status(ServerStatus::RUNNING);
        assert_eq!(
            down.pool_offer(&backend(8, "alice", "p")),
            Err(PoolRejection::ServerDown)
        );
    }

    #[test]
    fn test_offer_rejects_expired() {
        let s = Server::new(ServerConfig::new("db1").persistent_pool(1, Duration::ZERO));
        assert_eq!(
            s.pool_offer(&backend(1, "alice", "p")),
            Err(PoolRejection::Expired)
        );
    }

    #[test]
    fn test_acquire_matches_user_and_protocol() {
        let s = server(3);
        s.pool_offer(&backend(1, "alice", "p1")).unwrap();
        s.pool_offer(&backend(2, "bob", "p2")).unwrap();
        s.pool_offer(&backend(3, "alice", "p2")).unwrap();
        let now = Instant::now();

        assert!(s.pool_acquire("bob", "p1", now).hit.is_none());
        let (dcb, _) = s.pool_acquire("alice", "p2", now).hit.unwrap();
        assert_eq!(dcb.id(), 3);
        assert_eq!(s.pooled_ids(), vec![2, 1]);
    }

    #[test]
    fn test_acquire_skips_and_evicts_hung() {
        let s = server(2);
        let dcb = backend(1, "alice", "p");
        s.pool_offer(&dcb).unwrap();
        dcb.set_flags(DcbFlags::HUNG);

        let checkout = s.pool_acquire("alice", "p", Instant::now());
        assert!(checkout.hit.is_none());
        assert_eq!(checkout.evicted.len(), 1);
        assert_eq!(s.stats().n_persistent, 0);
    }

    #[test]
    fn test_acquire_requires_running_server() {
        let s = server(2);
        s.pool_offer(&backend(1, "alice", "p")).unwrap();
        s.clear_status(ServerStatus::RUNNING);
        assert!(s.pool_acquire("alice", "p", Instant::now()).hit.is_none());
        assert_eq!(s.pooled_ids(), vec![1]);
    }

    #[test]
    fn test_clean_without_delete_is_pure() {
        let s = server(3);
        s.pool_offer(&backend(1, "alice", "p")).unwrap();
        let hung = backend(2, "alice", "p");
        s.pool_offer(&hung).unwrap();
        hung.set_flags(DcbFlags::HUNG);
        let later = Instant::now() + Duration::from_secs(3600);

        let stats = s.stats();
        let sweep = s.pool_clean(false, later);
        assert_eq!(sweep.live, 2);
        assert!(sweep.evicted.is_empty());
        assert_eq!(s.stats(), stats);
        assert_eq!(s.pooled_ids(), vec![2, 1]);
    }

    #[test]
    fn test_clean_evicts_aged_and_unhealthy() {
        let s = server(3);
        s.pool_offer(&backend(1, "alice", "p")).unwrap();
        let errored = backend(2, "alice", "p");
        s.pool_offer(&errored).unwrap();
        errored.mark_error_handled();

        let sweep = s.pool_clean(true, Instant::now());
        assert_eq!(sweep.live, 1);
        assert_eq!(sweep.evicted[0].id(), 2);
        assert_eq!(s.stats().n_persistent, 1);

        let sweep = s.pool_clean(true, Instant::now() + Duration::from_secs(61));
        assert_eq!(sweep.live, 0);
        assert_eq!(sweep.evicted[0].id(), 1);
        assert_eq!(s.stats().n_persistent, 0);
    }

    #[test]
    fn test_drain_and_max_observed() {
        let s = server(3);
        for id in 1..=3 {
            s.pool_offer(&backend(id, "alice", "p")).unwrap();
        }
        assert_eq!(s.pool_max_observed(), 3);
        assert_eq!(s.pool_drain().len(), 3);
        assert_eq!(s.stats().n_persistent, 0);
        assert_eq!(s.pool_max_observed(), 3);
    }
}
