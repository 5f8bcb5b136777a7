//! Protocol module interface and the session handle.
//!
//! The lifecycle manager is protocol-agnostic: everything that touches the
//! wire goes through a [`Protocol`] selected by name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::dcb::Dcb;
use crate::error::ProtocolError;
use crate::server::Server;

/// A connection handed out by [`Protocol::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Descriptor of the accepted socket.
    pub fd: i32,
    /// Peer address, if known.
    pub remote: Option<String>,
}

impl Accepted {
    /// Create an accepted-connection record.
    pub fn new(fd: i32, remote: impl Into<String>) -> Self {
        Self {
            fd,
            remote: Some(remote.into()),
        }
    }
}

/// A protocol module.
pub trait Protocol: Send + Sync {
    /// Name the module is registered under.
    fn name(&self) -> &str;

    /// Read available data from the socket into the DCB read queue.
    fn read(&self, dcb: &Dcb) -> Result<(), ProtocolError>;

    /// Write bytes to the socket; returns how many were written.
    ///
    /// Returning 0 means the socket cannot take more data right now.
    fn write(&self, dcb: &Dcb, data: &[u8]) -> Result<usize, ProtocolError>;

    /// Accept pending connections on a listening DCB.
    fn accept(&self, listener: &Dcb) -> Result<Vec<Accepted>, ProtocolError>;

    /// Open a connection to a backend server; returns the descriptor.
    fn connect(&self, dcb: &Dcb, server: &Server, session: &Session)
    -> Result<i32, ProtocolError>;

    /// Close the socket. Called exactly once, when the DCB is released.
    fn close(&self, dcb: &Dcb);

    /// Open a listening socket; returns the descriptor.
    fn listen(&self, dcb: &Dcb, address: &str, port: u16) -> Result<i32, ProtocolError>;
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// A client session.
///
/// Sessions belong to the routing layer; DCBs only hold a shared reference
/// to the session they serve.
#[derive(Debug)]
pub struct Session {
    id: u64,
    service: String,
    created: Instant,
}

impl Session {
    /// Create a session for a service.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            service: service.into(),
            created: Instant::now(),
        }
    }

    /// Session id, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the service the session belongs to.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// When the session was created.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }
}
