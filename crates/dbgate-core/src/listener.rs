//! Listeners: protocol, authenticator and TLS bound to an address.

use std::sync::{Arc, Weak};

use dbgate_auth::{AuthInstance, AuthOutcome, AuthRequest, Authenticator, Users, split_options};
use dbgate_tls::{SslListener, TlsContext};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::ListenerConfig;
use crate::dcb::Dcb;
use crate::error::ListenerError;
use crate::plugin::PluginRegistry;

struct BoundAuthenticator {
    module: Arc<dyn Authenticator>,
    instance: AuthInstance,
}

/// A configured listener.
///
/// Client DCBs accepted on the listener keep a reference to it; the
/// listener only keeps a weak reference to its listening DCB.
pub struct Listener {
    config: ListenerConfig,
    ssl: Option<SslListener>,
    users: Users,
    auth: OnceCell<BoundAuthenticator>,
    dcb: Mutex<Weak<Dcb>>,
}

impl Listener {
    /// Create a listener that is not yet listening.
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        let ssl = config.ssl.clone().map(SslListener::new);
        Self {
            config,
            ssl,
            users: Users::new(),
            auth: OnceCell::new(),
            dcb: Mutex::new(Weak::new()),
        }
    }

    /// Listener name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Protocol module name.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.config.protocol
    }

    /// Bind address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Authenticator module name.
    #[must_use]
    pub fn authenticator_name(&self) -> &str {
        &self.config.authenticator
    }

    /// The listener definition.
    #[must_use]
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// TLS state, if TLS is configured.
    #[must_use]
    pub fn ssl(&self) -> Option<&SslListener> {
        self.ssl.as_ref()
    }

    /// The built TLS context, if any.
    #[must_use]
    pub fn tls_context(&self) -> Option<&TlsContext> {
        self.ssl.as_ref().and_then(SslListener::context)
    }

    /// The users table consulted by the authenticator.
    #[must_use]
    pub fn users(&self) -> &Users {
        &self.users
    }

    /// Build the TLS context if TLS is configured. Idempotent.
    pub fn init_ssl(&self) -> Result<(), ListenerError> {
        let Some(ssl) = &self.ssl else {
            return Ok(());
        };
        ssl.init().map_err(|source| ListenerError::Tls {
            name: self.config.name.clone(),
            source,
        })?;
        Ok(())
    }

    /// Create the authenticator instance. Idempotent.
    pub fn init_authenticator(
        &self,
        modules: &PluginRegistry<dyn Authenticator>,
    ) -> Result<(), ListenerError> {
        self.auth.get_or_try_init(|| {
            let module = modules
                .get(&self.config.authenticator)
                .ok_or_else(|| ListenerError::UnknownAuthenticator(self.config.authenticator.clone()))?;
            let auth_err = |source| ListenerError::Auth {
                name: self.config.name.clone(),
                source,
            };
            let options = split_options(&self.config.authenticator_options).map_err(auth_err)?;
            let instance = module.initialize(&options).map_err(auth_err)?;
            tracing::debug!(
                listener = %self.config.name,
                authenticator = module.plugin_name(),
                options = options.len(),
                "authenticator initialized"
            );
            Ok::<_, ListenerError>(BoundAuthenticator { module, instance })
        })?;
        Ok(())
    }

    /// Whether TLS (if configured) and the authenticator are ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.auth.get().is_some() && self.ssl.as_ref().is_none_or(SslListener::is_initialized)
    }

    /// Check a client's credentials.
    ///
    /// A listener whose authenticator was never initialized lets nobody in.
    #[must_use]
    pub fn authenticate(&self, user: &str, token: &[u8], ssl_established: bool) -> AuthOutcome {
        let Some(bound) = self.auth.get() else {
            return AuthOutcome::Failed;
        };
        let request = AuthRequest {
            user,
            token,
            users: &self.users,
            ssl_established,
        };
        bound.module.authenticate(&bound.instance, &request)
    }

    /// The listening DCB, while it is alive.
    #[must_use]
    pub fn listener_dcb(&self) -> Option<Arc<Dcb>> {
        self.dcb.lock().upgrade()
    }

    pub(crate) fn set_dcb(&self, dcb: &Arc<Dcb>) {
        *self.dcb.lock() = Arc::downgrade(dcb);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(bound) = self.auth.take() {
            bound.module.release(bound.instance);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.config.name)
            .field("protocol", &self.config.protocol)
            .field("address", &self.config.address)
            .field("port", &self.config.port)
            .field("ssl", &self.ssl.is_some())
            .finish_non_exhaustive()
    }
}
