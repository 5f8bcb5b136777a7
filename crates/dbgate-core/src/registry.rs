//! The server registry.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::error::ConfigError;
use crate::server::Server;

#[derive(Debug, Default)]
struct Inner {
    servers: VecDeque<Arc<Server>>,
    by_name: HashMap<String, Arc<Server>>,
}

/// Directory of every configured backend server.
///
/// New servers go to the front; iteration goes through a snapshot so
/// callers never hold the registry lock.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    inner: Mutex<Inner>,
}

impl ServerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server and link it into the registry.
    pub fn create(&self, config: ServerConfig) -> Result<Arc<Server>, ConfigError> {
        config.validate()?;
        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(&config.unique_name) {
            return Err(ConfigError::DuplicateServer(config.unique_name));
        }

        let server = Arc::new(Server::new(config));
        inner
            .by_name
            .insert(server.unique_name().to_string(), Arc::clone(&server));
        inner.servers.push_front(Arc::clone(&server));
        tracing::info!(
            server = %server.unique_name(),
            address = %server.address(),
            port = server.port(),
            "server created"
        );
        Ok(server)
    }

    /// Unlink a server; returns false if it was not registered.
    ///
    /// The caller must make sure no DCB still refers to the server before
    /// dropping its last reference.
    pub fn remove(&self, server: &Arc<Server>) -> bool {
        let mut inner = self.inner.lock();
        let Some(index) = inner.servers.iter().position(|s| Arc::ptr_eq(s, server)) else {
            return false;
        };
        inner.servers.remove(index);
        inner.by_name.remove(server.unique_name());
        tracing::info!(server = %server.unique_name(), "server removed");
        true
    }

    /// Find a server by unique configuration name.
    #[must_use]
    pub fn find_by_unique_name(&self, name: &str) -> Option<Arc<Server>> {
        self.inner.lock().by_name.get(name).cloned()
    }

    /// Find a server by address and port.
    #[must_use]
    pub fn find(&self, address: &str, port: u16) -> Option<Arc<Server>> {
        self.inner
            .lock()
            .servers
            .iter()
            .find(|s| s.port() == port && s.address() == address)
            .cloned()
    }

    /// All servers, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Server>> {
        self.inner.lock().servers.iter().cloned().collect()
    }

    /// Number of registered servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().servers.len()
    }

    /// Whether no servers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().servers.is_empty()
    }
}
