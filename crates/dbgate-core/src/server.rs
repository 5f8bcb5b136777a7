//! Backend server descriptors.
//!
//! Status bits are written by the monitor and read by routing without any
//! lock between them; each bit operation is a single atomic update.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::config::{MonitorCredentials, ServerConfig};
use crate::persistent::PersistentPool;

bitflags! {
    /// Server status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServerStatus: u32 {
        /// The server is reachable.
        const RUNNING = 0x0001;
        /// Replication master.
        const MASTER = 0x0002;
        /// Replication slave.
        const SLAVE = 0x0004;
        /// Member of a synced cluster.
        const JOINED = 0x0008;
        /// MySQL Cluster data node.
        const NDB = 0x0010;
        /// Under maintenance; no new connections are routed to it.
        const MAINT = 0x0020;
        /// Slave of a master outside the monitored set.
        const SLAVE_OF_EXTERNAL_MASTER = 0x0040;
        /// Status could not be refreshed.
        const STALE_STATUS = 0x0080;
        /// Keeps the master role despite a lost cluster view.
        const MASTER_STICKINESS = 0x0100;
        /// The monitor could not authenticate.
        const AUTH_ERROR = 0x1000;
        /// Slave whose master is gone.
        const STALE_SLAVE = 0x2000;
        /// Slave that is also a master for other slaves.
        const RELAY_MASTER = 0x4000;
    }
}

const STATUS_LABELS: [(ServerStatus, &str); 10] = [
    (ServerStatus::MAINT, "Maintenance"),
    (ServerStatus::MASTER, "Master"),
    (ServerStatus::RELAY_MASTER, "Relay Master"),
    (ServerStatus::SLAVE, "Slave"),
    (ServerStatus::JOINED, "Synced"),
    (ServerStatus::NDB, "NDB"),
    (ServerStatus::SLAVE_OF_EXTERNAL_MASTER, "Slave of External Server"),
    (ServerStatus::STALE_STATUS, "Stale Status"),
    (ServerStatus::MASTER_STICKINESS, "Master Stickiness"),
    (ServerStatus::AUTH_ERROR, "Auth Error"),
];

impl ServerStatus {
    /// Map a status name used by administrative commands to its bit.
    ///
    /// Matching ignores case; unknown names map to no bits.
    #[must_use]
    pub fn from_status_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "running" => Self::RUNNING,
            "master" => Self::MASTER,
            "slave" => Self::SLAVE,
            "synced" => Self::JOINED,
            "ndb" => Self::NDB,
            "maintenance" | "maint" => Self::MAINT,
            _ => Self::empty(),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, label) in STATUS_LABELS {
            if self.contains(bit) {
                write!(f, "{label}, ")?;
            }
        }
        if self.contains(Self::RUNNING) {
            f.write_str("Running")
        } else {
            f.write_str("Down")
        }
    }
}

/// Replication topology as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    /// Server node id, -1 when unknown.
    pub node_id: i64,
    /// Node id of the master, -1 when unknown.
    pub master_id: i64,
    /// Node ids of attached slaves.
    pub slave_ids: Vec<i64>,
    /// Replication depth, -1 when unknown.
    pub depth: i32,
    /// Replication lag in seconds; negative when not measured.
    pub lag: i32,
    /// Unix time of the last replication heartbeat, 0 when none.
    pub last_heartbeat: u64,
}

impl Default for ReplicationInfo {
    fn default() -> Self {
        Self {
            node_id: -1,
            master_id: -1,
            slave_ids: Vec::new(),
            depth: -1,
            lag: -2,
            last_heartbeat: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub(crate) n_connections: AtomicU64,
    pub(crate) n_current: AtomicI64,
    pub(crate) n_current_ops: AtomicI64,
    pub(crate) n_persistent: AtomicI64,
}

/// Snapshot of server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections opened since start.
    pub n_connections: u64,
    /// Connections currently in use.
    pub n_current: i64,
    /// Operations currently in progress.
    pub n_current_ops: i64,
    /// Idle connections in the persistent pool.
    pub n_persistent: i64,
}

/// A backend server.
pub struct Server {
    unique_name: String,
    address: RwLock<String>,
    port: AtomicU16,
    protocol: RwLock<String>,
    status: AtomicU32,
    master_err_is_logged: AtomicBool,
    monitor: Mutex<Option<MonitorCredentials>>,
    parameters: RwLock<Vec<(String, String)>>,
    version: RwLock<Option<String>>,
    replication: RwLock<ReplicationInfo>,
    pub(crate) counters: ServerCounters,
    pub(crate) pool: PersistentPool,
}

impl Server {
    /// Create a server from its definition.
    ///
    /// New servers start out as running until the monitor says otherwise.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let mut parameters = config.parameters;
        parameters.reverse();
        Self {
            unique_name: config.unique_name,
            address: RwLock::new(config.address),
            port: AtomicU16::new(config.port),
            protocol: RwLock::new(config.protocol),
            status: AtomicU32::new(ServerStatus::RUNNING.bits()),
            master_err_is_logged: AtomicBool::new(false),
            monitor: Mutex::new(config.monitor),
            parameters: RwLock::new(parameters),
            version: RwLock::new(None),
            replication: RwLock::new(ReplicationInfo::default()),
            counters: ServerCounters::default(),
            pool: PersistentPool::new(config.persist_pool_max, config.persist_max_time),
        }
    }

    /// Unique configuration name.
    #[must_use]
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Host name or address.
    #[must_use]
    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Protocol module name.
    #[must_use]
    pub fn protocol(&self) -> String {
        self.protocol.read().clone()
    }

    /// Current status bits.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_bits_retain(self.status.load(Ordering::Acquire))
    }

    /// Status rendered as text.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.status().to_string()
    }

    /// Whether the RUNNING bit is set.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status().contains(ServerStatus::RUNNING)
    }

    /// Whether the server can take new connections.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let status = self.status();
        status.contains(ServerStatus::RUNNING) && !status.contains(ServerStatus::MAINT)
    }

    /// Set status bits.
    pub fn set_status(&self, bits: ServerStatus) {
        let old = self.status.fetch_or(bits.bits(), Ordering::AcqRel);
        if (ServerStatus::from_bits_retain(old) | bits).contains(ServerStatus::MASTER) {
            self.master_err_is_logged.store(false, Ordering::Release);
        }
    }

    /// Clear status bits.
    pub fn clear_status(&self, bits: ServerStatus) {
        self.status.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// Replace the bits inside `mask` with `bits`, leaving the rest alone.
    ///
    /// Bits of `bits` outside `mask` are ignored.
    pub fn clear_and_set_status(&self, mask: ServerStatus, bits: ServerStatus) {
        let bits = bits & mask;
        let previous = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some((s & !mask.bits()) | bits.bits())
            })
            .unwrap_or_else(|s| s);
        if bits.contains(ServerStatus::MASTER)
            && !ServerStatus::from_bits_retain(previous).contains(ServerStatus::MASTER)
        {
            self.master_err_is_logged.store(false, Ordering::Release);
        }
    }

    /// Copy another server's status bits.
    pub fn transfer_status_from(&self, source: &Server) {
        self.status.store(source.status().bits(), Ordering::Release);
    }

    /// Whether the "no master" error has been logged since the server was
    /// last a master.
    #[must_use]
    pub fn master_err_is_logged(&self) -> bool {
        self.master_err_is_logged.load(Ordering::Acquire)
    }

    /// Record that the "no master" error was logged.
    pub fn set_master_err_logged(&self) {
        self.master_err_is_logged.store(true, Ordering::Release);
    }

    /// Monitor credentials.
    #[must_use]
    pub fn monitor_credentials(&self) -> Option<MonitorCredentials> {
        self.monitor.lock().clone()
    }

    /// Set the monitor credentials.
    pub fn set_monitor_credentials(&self, user: impl Into<String>, password: impl Into<String>) {
        *self.monitor.lock() = Some(MonitorCredentials::new(user, password));
    }

    /// Apply a configuration reload.
    ///
    /// The protocol is replaced when it differs. The monitor credentials are
    /// replaced as a pair when either the user or the password differs from
    /// the stored one; credentials are only touched when both are supplied.
    pub fn update(&self, protocol: &str, user: Option<&str>, password: Option<&str>) {
        {
            let mut current = self.protocol.write();
            if *current != protocol {
                tracing::info!(
                    server = %self.unique_name,
                    protocol,
                    "updating server protocol"
                );
                *current = protocol.to_string();
            }
        }

        let (Some(user), Some(password)) = (user, password) else {
            return;
        };
        let mut monitor = self.monitor.lock();
        let changed = match monitor.as_ref() {
            Some(creds) => creds.user != user || creds.password != password,
            None => true,
        };
        if changed {
            tracing::info!(server = %self.unique_name, "updating monitor credentials");
            *monitor = Some(MonitorCredentials::new(user, password));
        }
    }

    /// Change the address.
    pub fn update_address(&self, address: &str) {
        if address.is_empty() {
            return;
        }
        *self.address.write() = address.to_string();
    }

    /// Change the port; port 0 is ignored.
    pub fn update_port(&self, port: u16) {
        if port > 0 {
            self.port.store(port, Ordering::Release);
        }
    }

    /// Add a parameter. A newer value shadows older ones with the same name.
    pub fn add_parameter(&self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters
            .write()
            .insert(0, (name.into(), value.into()));
    }

    /// Look a parameter up by name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.parameters
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// All parameters, newest first.
    #[must_use]
    pub fn parameters(&self) -> Vec<(String, String)> {
        self.parameters.read().clone()
    }

    /// Server version string reported by the monitor.
    #[must_use]
    pub fn version_string(&self) -> Option<String> {
        self.version.read().clone()
    }

    /// Set the version string.
    pub fn set_version_string(&self, version: impl Into<String>) {
        *self.version.write() = Some(version.into());
    }

    /// Replication metadata.
    #[must_use]
    pub fn replication(&self) -> ReplicationInfo {
        self.replication.read().clone()
    }

    /// Modify the replication metadata in place.
    pub fn update_replication(&self, f: impl FnOnce(&mut ReplicationInfo)) {
        f(&mut self.replication.write());
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            n_connections: c.n_connections.load(Ordering::Relaxed),
            n_current: c.n_current.load(Ordering::Relaxed),
            n_current_ops: c.n_current_ops.load(Ordering::Relaxed),
            n_persistent: c.n_persistent.load(Ordering::Relaxed),
        }
    }

    /// Record the start of an operation on the server.
    pub fn operation_started(&self) {
        self.counters.n_current_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of an operation on the server.
    pub fn operation_finished(&self) {
        self.counters.n_current_ops.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        self.counters.n_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.n_current.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.counters.n_current.fetch_sub(1, Ordering::Relaxed);
    }

    /// Configured persistent pool size limit.
    #[must_use]
    pub fn persist_pool_max(&self) -> usize {
        self.pool.max_size()
    }

    /// Configured persistent connection age limit.
    #[must_use]
    pub fn persist_max_time(&self) -> Duration {
        self.pool.max_time()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("unique_name", &self.unique_name)
            .field("address", &self.address())
            .field("port", &self.port())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
