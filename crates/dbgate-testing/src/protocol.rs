//! A protocol module that records what the connection layer asks of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use dbgate_core::{Accepted, Dcb, Protocol, ProtocolError, Server, Session};
use parking_lot::Mutex;

/// First descriptor handed out by a [`RecordingProtocol`].
const FIRST_FD: i32 = 1000;

/// In-memory protocol module.
///
/// Descriptors are fake and unique per module. Every close is counted per
/// DCB, so tests can check that a DCB's socket was closed exactly once.
#[derive(Debug)]
pub struct RecordingProtocol {
    name: String,
    next_fd: AtomicI32,
    closes: Mutex<HashMap<u64, usize>>,
    written: Mutex<Vec<u8>>,
    backlog: Mutex<Vec<Accepted>>,
    fail_connect: AtomicBool,
    fail_listen: AtomicBool,
    eof_on_read: AtomicBool,
    write_limit: Mutex<Option<usize>>,
}

impl RecordingProtocol {
    /// Create a module registered as `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_fd: AtomicI32::new(FIRST_FD),
            closes: Mutex::new(HashMap::new()),
            written: Mutex::new(Vec::new()),
            backlog: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            fail_listen: AtomicBool::new(false),
            eof_on_read: AtomicBool::new(false),
            write_limit: Mutex::new(None),
        }
    }

    fn allocate_fd(&self) -> i32 {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an incoming connection; returns its descriptor.
    pub fn queue_accept(&self, remote: &str) -> i32 {
        let fd = self.allocate_fd();
        self.backlog.lock().push(Accepted::new(fd, remote));
        fd
    }

    /// Make `connect` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Make `listen` fail.
    pub fn set_fail_listen(&self, fail: bool) {
        self.fail_listen.store(fail, Ordering::Relaxed);
    }

    /// Make `read` report that the peer closed the connection.
    pub fn set_eof_on_read(&self, eof: bool) {
        self.eof_on_read.store(eof, Ordering::Relaxed);
    }

    /// Accept at most `limit` bytes per `write` call; `None` accepts all.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        *self.write_limit.lock() = limit;
    }

    /// How many times the socket of DCB `id` was closed.
    #[must_use]
    pub fn close_count(&self, id: u64) -> usize {
        self.closes.lock().get(&id).copied().unwrap_or(0)
    }

    /// Closes across all DCBs.
    #[must_use]
    pub fn total_closes(&self) -> usize {
        self.closes.lock().values().sum()
    }

    /// Ids of DCBs closed more than once.
    #[must_use]
    pub fn closed_twice(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self
            .closes
            .lock()
            .iter()
            .filter(|(_, n)| **n > 1)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Everything written so far, across all DCBs.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }
}

impl Protocol for RecordingProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, _dcb: &Dcb) -> Result<(), ProtocolError> {
        if self.eof_on_read.load(Ordering::Relaxed) {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    fn write(&self, _dcb: &Dcb, data: &[u8]) -> Result<usize, ProtocolError> {
        let n = self.write_limit.lock().map_or(data.len(), |l| l.min(data.len()));
        self.written.lock().extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn accept(&self, _listener: &Dcb) -> Result<Vec<Accepted>, ProtocolError> {
        Ok(std::mem::take(&mut *self.backlog.lock()))
    }

    fn connect(&self, _dcb: &Dcb, server: &Server, _session: &Session) -> Result<i32, ProtocolError> {
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(ProtocolError::Connect {
                address: server.address(),
                port: server.port(),
                reason: "connection refused".into(),
            });
        }
        Ok(self.allocate_fd())
    }

    fn close(&self, dcb: &Dcb) {
        *self.closes.lock().entry(dcb.id()).or_insert(0) += 1;
    }

    fn listen(&self, _dcb: &Dcb, address: &str, port: u16) -> Result<i32, ProtocolError> {
        if self.fail_listen.load(Ordering::Relaxed) {
            return Err(ProtocolError::Listen {
                address: address.to_string(),
                port,
                reason: "address in use".into(),
            });
        }
        Ok(self.allocate_fd())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_drains_backlog() {
        let protocol = RecordingProtocol::new("MySQLClient");
        let a = protocol.queue_accept("10.0.0.5");
        let b = protocol.queue_accept("10.0.0.6");
        assert_ne!(a, b);
        assert_eq!(protocol.backlog.lock().len(), 2);
        assert_eq!(std::mem::take(&mut *protocol.backlog.lock()).len(), 2);
        assert!(protocol.backlog.lock().is_empty());
    }

    #[test]
    fn test_closed_twice_starts_empty() {
        let protocol = RecordingProtocol::new("MySQLBackend");
        assert!(protocol.closed_twice().is_empty());
        assert_eq!(protocol.total_closes(), 0);
        assert_eq!(protocol.close_count(7), 0);
    }
}
