//! Gateway, server and listener configuration.

use std::time::Duration;

use dbgate_tls::SslListenerConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest supported worker pool.
///
/// Zombie records snapshot the active workers in a 64-bit mask.
pub const MAX_WORKERS: usize = 64;

/// Process-wide settings for the connection layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Number of event-loop worker threads.
    pub worker_threads: usize,
    /// Maximum number of live DCBs, including zombies not yet released.
    pub max_connections: usize,
    /// Write queue high watermark applied to new DCBs; 0 disables it.
    pub default_high_water: usize,
    /// Write queue low watermark applied to new DCBs; 0 disables it.
    pub default_low_water: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_connections: 65_536,
            default_high_water: 0,
            default_low_water: 0,
        }
    }
}

impl GatewayConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Set the DCB allocation ceiling.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the default write queue watermarks.
    #[must_use]
    pub fn watermarks(mut self, high: usize, low: usize) -> Self {
        self.default_high_water = high;
        self.default_low_water = low;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 || self.worker_threads > MAX_WORKERS {
            return Err(ConfigError::Invalid {
                field: "worker_threads",
                reason: format!("must be between 1 and {MAX_WORKERS}"),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.default_high_water > 0
            && self.default_low_water > 0
            && self.default_low_water >= self.default_high_water
        {
            return Err(ConfigError::Invalid {
                field: "default_low_water",
                reason: format!(
                    "low watermark {} must be below high watermark {}",
                    self.default_low_water, self.default_high_water
                ),
            });
        }
        Ok(())
    }
}

/// Credentials the monitor uses to log in to a server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorCredentials {
    /// Monitor user.
    pub user: String,
    /// Monitor password.
    pub password: String,
}

impl MonitorCredentials {
    /// Create a credential pair.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for MonitorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorCredentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Definition of one backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unique configuration name.
    pub unique_name: String,
    /// Host name or address.
    pub address: String,
    /// TCP port.
    pub port: u16,
    /// Protocol module name.
    pub protocol: String,
    /// Maximum number of idle connections kept for reuse; 0 disables pooling.
    pub persist_pool_max: usize,
    /// Maximum age of a pooled connection.
    #[serde(with = "duration_secs")]
    pub persist_max_time: Duration,
    /// Monitor login, if configured.
    pub monitor: Option<MonitorCredentials>,
    /// Free-form name/value parameters, oldest first.
    pub parameters: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            unique_name: String::new(),
            address: "127.0.0.1".to_string(),
            port: 3306,
            protocol: "MySQLBackend".to_string(),
            persist_pool_max: 0,
            persist_max_time: Duration::ZERO,
            monitor: None,
            parameters: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create a server definition with the given unique name.
    pub fn new(unique_name: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            ..Self::default()
        }
    }

    /// Set the address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the protocol module name.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Enable connection pooling with the given limits.
    #[must_use]
    pub fn persistent_pool(mut self, max: usize, max_time: Duration) -> Self {
        self.persist_pool_max = max;
        self.persist_max_time = max_time;
        self
    }

    /// Set the monitor credentials.
    #[must_use]
    pub fn monitor(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.monitor = Some(MonitorCredentials::new(user, password));
        self
    }

    /// Add a parameter.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    /// Validate the definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unique_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "unique_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.address.is_empty() {
            return Err(ConfigError::Invalid {
                field: "address",
                reason: "must not be empty".to_string(),
            });
        }
        if self.persist_pool_max > 0 && self.persist_max_time.is_zero() {
            return Err(ConfigError::Invalid {
                field: "persist_max_time",
                reason: "must be non-zero when pooling is enabled".to_string(),
            });
        }
        Ok(())
    }
}

/// Definition of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listener name.
    pub name: String,
    /// Protocol module name.
    pub protocol: String,
    /// Bind address.
    pub address: String,
    /// TCP port.
    pub port: u16,
    /// Authenticator module name.
    pub authenticator: String,
    /// Raw authenticator option string.
    pub authenticator_options: String,
    /// TLS settings; `None` serves plain connections.
    pub ssl: Option<SslListenerConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: "MySQLClient".to_string(),
            address: "0.0.0.0".to_string(),
            port: 4006,
            authenticator: "NullAuthAllow".to_string(),
            authenticator_options: String::new(),
            ssl: None,
        }
    }
}

impl ListenerConfig {
    /// Create a listener definition with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the protocol module name.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the bind address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the authenticator module and its option string.
    #[must_use]
    pub fn authenticator(mut self, name: impl Into<String>, options: impl Into<String>) -> Self {
        self.authenticator = name.into();
        self.authenticator_options = options.into();
        self
    }

    /// Enable TLS.
    #[must_use]
    pub fn ssl(mut self, ssl: SslListenerConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Validate the definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.protocol.is_empty() {
            return Err(ConfigError::Invalid {
                field: "protocol",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
