//! Error types for dbgate-core.

use thiserror::Error;

use crate::dcb::{DcbRole, DcbState};

/// Errors raised by connection object operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DcbError {
    /// No connection object could be allocated.
    #[error("connection limit reached: {limit} DCBs in use")]
    Exhausted {
        /// Configured allocation ceiling.
        limit: usize,
    },

    /// A state transition the lifecycle does not allow.
    #[error("DCB {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// DCB id.
        id: u64,
        /// Current state.
        from: DcbState,
        /// Requested state.
        to: DcbState,
    },

    /// The operation needs a file descriptor and the DCB has none.
    #[error("DCB {id} has no file descriptor")]
    NoDescriptor {
        /// DCB id.
        id: u64,
    },

    /// The operation is not valid for this role.
    #[error("DCB {id}: operation not valid for role {role}")]
    WrongRole {
        /// DCB id.
        id: u64,
        /// The DCB role.
        role: DcbRole,
    },

    /// Data was written to a DCB that cannot send.
    #[error("DCB {id} is not writable in state {state}")]
    NotWritable {
        /// DCB id.
        id: u64,
        /// Current state.
        state: DcbState,
    },

    /// The same (reason, function, userdata) callback is already registered.
    #[error("callback already registered on DCB {id}")]
    DuplicateCallback {
        /// DCB id.
        id: u64,
    },

    /// No protocol module is registered under the name.
    #[error("unknown protocol module: {0}")]
    UnknownProtocol(String),

    /// The DCB has no protocol module bound.
    #[error("DCB {id} has no protocol module")]
    NoProtocol {
        /// DCB id.
        id: u64,
    },

    /// Protocol module failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Event demultiplexer failure.
    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Errors reported by protocol modules.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Socket-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Could not reach the backend server.
    #[error("connect to {address}:{port} failed: {reason}")]
    Connect {
        /// Backend address.
        address: String,
        /// Backend port.
        port: u16,
        /// What went wrong.
        reason: String,
    },

    /// Could not open a listening socket.
    #[error("listen on {address}:{port} failed: {reason}")]
    Listen {
        /// Listen address.
        address: String,
        /// Listen port.
        port: u16,
        /// What went wrong.
        reason: String,
    },
}

/// Errors reported by the event demultiplexer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PollError {
    /// The descriptor is already registered.
    #[error("descriptor {0} already registered")]
    AlreadyRegistered(i32),

    /// The descriptor is not registered.
    #[error("descriptor {0} not registered")]
    NotRegistered(i32),

    /// The worker id is outside the configured pool.
    #[error("worker {id} out of range (pool has {workers} workers)")]
    WorkerOutOfRange {
        /// Requested worker id.
        id: usize,
        /// Number of worker slots.
        workers: usize,
    },

    /// The worker slot is already in use.
    #[error("worker {0} is already running")]
    WorkerActive(usize),

    /// Operating system failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while starting a listener.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ListenerError {
    /// TLS context construction failed; the listener must not accept clients.
    #[error("listener {name}: {source}")]
    Tls {
        /// Listener name.
        name: String,
        /// Underlying TLS failure.
        #[source]
        source: dbgate_tls::TlsError,
    },

    /// Authenticator initialization failed.
    #[error("listener {name}: {source}")]
    Auth {
        /// Listener name.
        name: String,
        /// Underlying authenticator failure.
        #[source]
        source: dbgate_auth::AuthError,
    },

    /// No authenticator module is registered under the name.
    #[error("unknown authenticator module: {0}")]
    UnknownAuthenticator(String),

    /// The listener is already bound to a listening DCB.
    #[error("listener {0} is already listening")]
    AlreadyListening(String),

    /// Connection object failure.
    #[error(transparent)]
    Dcb(#[from] DcbError),
}

/// Configuration validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A server with the same unique name already exists.
    #[error("duplicate server name: {0}")]
    DuplicateServer(String),
}

/// Top-level error type for dbgate-core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Connection object failure.
    #[error(transparent)]
    Dcb(#[from] DcbError),

    /// Listener failure.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Event demultiplexer failure.
    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Result type for dbgate-core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
