//! A connection layer wired to in-memory doubles.

use std::sync::Arc;
use std::time::Duration;

use dbgate_core::{
    ConfigError, Dcb, DcbError, DcbManager, GatewayConfig, Server, ServerConfig, ServerRegistry,
    Session,
};

use crate::demux::MockDemux;
use crate::protocol::RecordingProtocol;

/// Name of the backend protocol module.
pub const BACKEND_PROTOCOL: &str = "MySQLBackend";

/// Name of the client protocol module.
pub const CLIENT_PROTOCOL: &str = "MySQLClient";

/// Install a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// A [`DcbManager`] with a mock demultiplexer, client and backend protocol
/// modules and an empty server registry.
#[derive(Debug)]
pub struct TestGateway {
    /// The connection layer under test.
    pub manager: Arc<DcbManager>,
    /// Descriptor registrations.
    pub demux: Arc<MockDemux>,
    /// Backend protocol module.
    pub backend: Arc<RecordingProtocol>,
    /// Client protocol module.
    pub client: Arc<RecordingProtocol>,
    /// Configured servers.
    pub servers: ServerRegistry,
}

impl TestGateway {
    /// Create a gateway with `workers` worker slots.
    pub fn new(workers: usize) -> Result<Self, ConfigError> {
        Self::with_config(GatewayConfig::new().worker_threads(workers))
    }

    /// Create a gateway from an explicit configuration.
    pub fn with_config(config: GatewayConfig) -> Result<Self, ConfigError> {
        init_tracing();
        let demux = Arc::new(MockDemux::new());
        let manager = Arc::new(DcbManager::new(config, demux.clone())?);
        let backend = Arc::new(RecordingProtocol::new(BACKEND_PROTOCOL));
        let client = Arc::new(RecordingProtocol::new(CLIENT_PROTOCOL));
        manager.register_protocol(backend.clone());
        manager.register_protocol(client.clone());
        Ok(Self {
            manager,
            demux,
            backend,
            client,
            servers: ServerRegistry::new(),
        })
    }

    /// Register a server; `pool_max` 0 disables its persistent pool.
    pub fn add_server(
        &self,
        name: &str,
        pool_max: usize,
        max_time: Duration,
    ) -> Result<Arc<Server>, ConfigError> {
        let mut config = ServerConfig::new(name).protocol(BACKEND_PROTOCOL);
        if pool_max > 0 {
            config = config.persistent_pool(pool_max, max_time);
        }
        self.servers.create(config)
    }

    /// Open a backend connection for `user` under a fresh session.
    pub fn connect(&self, server: &Arc<Server>, user: &str) -> Result<Arc<Dcb>, DcbError> {
        let session = Arc::new(Session::new("test-service"));
        self.manager
            .connect(server, &session, BACKEND_PROTOCOL, user)
    }

    /// Release every zombie no active worker can still see.
    pub fn reclaim(&self) -> usize {
        self.manager.reclaim_zombies()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dbgate_core::DcbState;

    #[test]
    fn test_connect_registers_descriptor() {
        let gw = TestGateway::new(1).unwrap();
        let db1 = gw.add_server("db1", 0, Duration::ZERO).unwrap();
        let dcb = gw.connect(&db1, "alice").unwrap();
        assert_eq!(dcb.state(), DcbState::Polling);
        assert!(gw.demux.is_registered(dcb.fd()));
        assert_eq!(db1.stats().n_current, 1);
    }
}
