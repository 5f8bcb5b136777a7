//! # dbgate-core
//!
//! The connection layer of the dbgate database proxy.
//!
//! Every socket the proxy handles (a listening socket, an accepted client
//! connection or a connection to a backend database server) is represented
//! by a descriptor control block, [`Dcb`]. The [`DcbManager`] allocates
//! DCBs, drives them through their state machine and retires them.
//!
//! ## Lifecycle
//!
//! ```text
//!  Alloc ──► Polling ◄──► NoPolling
//!    │          │             │
//!    ├──► Listening           │
//!    │          │             │
//!    └──────► Disconnected ◄──┘ ──► Zombie ──► released
//! ```
//!
//! A retired DCB is not released immediately. It waits in the
//! [`ZombieQueue`] until every worker thread that could still be looking at
//! it has finished the event batch it was processing.
//!
//! ## Persistent pools
//!
//! Servers configured with a pool size keep closed, healthy backend DCBs
//! for later reuse by the same user and protocol; see [`DcbManager::persistent_offer`]
//! and [`DcbManager::persistent_acquire`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dbgate_core::{DcbManager, GatewayConfig, ServerConfig, ServerRegistry, Session};
//!
//! let manager = DcbManager::new(GatewayConfig::new().worker_threads(4), demux)?;
//! manager.register_protocol(Arc::new(MySqlBackend::default()));
//!
//! let servers = ServerRegistry::new();
//! let db1 = servers.create(
//!     ServerConfig::new("db1")
//!         .address("10.0.0.1")
//!         .persistent_pool(10, std::time::Duration::from_secs(300)),
//! )?;
//!
//! let session = Arc::new(Session::new("read-write"));
//! let backend = manager.connect(&db1, &session, "MySQLBackend", "alice")?;
//! // ...
//! manager.close(&backend); // pooled for the next session of alice
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod dcb;
pub mod diagnostics;
pub mod error;
pub mod listener;
pub mod manager;
pub mod persistent;
pub mod plugin;
pub mod poll;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod zombie;

pub use config::{GatewayConfig, ListenerConfig, MAX_WORKERS, MonitorCredentials, ServerConfig};
pub use dcb::{
    CallbackData, DCBFD_CLOSED, Dcb, DcbCallback, DcbFlags, DcbReason, DcbRole, DcbState,
    DcbStats, DcbUsage, SslState,
};
pub use error::{ConfigError, DcbError, Error, ListenerError, PollError, ProtocolError, Result};
pub use listener::Listener;
pub use manager::DcbManager;
pub use persistent::PoolRejection;
pub use plugin::PluginRegistry;
pub use poll::{EventDemux, EventMask, Worker};
pub use protocol::{Accepted, Protocol, Session};
pub use registry::ServerRegistry;
pub use server::{ReplicationInfo, Server, ServerStats, ServerStatus};
pub use zombie::{WorkerId, ZombieInfo, ZombieQueue};
