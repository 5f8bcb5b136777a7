//! DCB lifecycle management.
//!
//! The manager allocates DCBs, moves them through their states, hands
//! healthy backend connections to server pools on close and retires the
//! rest through the zombie queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dbgate_auth::{Authenticator, NullAuthAllow, NullAuthDeny, PlainAuth};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::GatewayConfig;
use crate::dcb::{Dcb, DcbFlags, DcbReason, DcbRole, DcbState, DcbUsage};
use crate::error::{ConfigError, DcbError, ListenerError};
use crate::listener::Listener;
use crate::plugin::PluginRegistry;
use crate::poll::{EventDemux, EventMask};
use crate::protocol::{Accepted, Protocol, Session};
use crate::registry::ServerRegistry;
use crate::server::Server;
use crate::zombie::{WorkerId, ZombieInfo, ZombieQueue};

/// Owner of every live DCB.
pub struct DcbManager {
    config: GatewayConfig,
    demux: Arc<dyn EventDemux>,
    protocols: PluginRegistry<dyn Protocol>,
    authenticators: PluginRegistry<dyn Authenticator>,
    zombies: ZombieQueue,
    directory: RwLock<HashMap<u64, Arc<Dcb>>>,
    next_id: AtomicU64,
    released: AtomicU64,
}

impl DcbManager {
    /// Create a manager using `demux` for readiness notification.
    ///
    /// The built-in authenticators are registered up front.
    pub fn new(config: GatewayConfig, demux: Arc<dyn EventDemux>) -> Result<Self, ConfigError> {
        config.validate()?;

        let authenticators: PluginRegistry<dyn Authenticator> = PluginRegistry::new();
        let builtins: [Arc<dyn Authenticator>; 3] =
            [Arc::new(NullAuthAllow), Arc::new(NullAuthDeny), Arc::new(PlainAuth)];
        for module in builtins {
            authenticators.register(module.plugin_name(), module);
        }

        tracing::info!(
            workers = config.worker_threads,
            max_connections = config.max_connections,
            "connection layer initialized"
        );

        Ok(Self {
            zombies: ZombieQueue::new(config.worker_threads),
            config,
            demux,
            protocols: PluginRegistry::new(),
            authenticators,
            directory: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            released: AtomicU64::new(0),
        })
    }

    /// The gateway configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Register a protocol module under its own name.
    pub fn register_protocol(&self, module: Arc<dyn Protocol>) {
        let name = module.name().to_string();
        self.protocols.register(name, module);
    }

    /// Register an authenticator module under its plugin name.
    pub fn register_authenticator(&self, module: Arc<dyn Authenticator>) {
        self.authenticators.register(module.plugin_name(), module);
    }

    /// Registered protocol modules.
    #[must_use]
    pub fn protocols(&self) -> &PluginRegistry<dyn Protocol> {
        &self.protocols
    }

    /// Registered authenticator modules.
    #[must_use]
    pub fn authenticators(&self) -> &PluginRegistry<dyn Authenticator> {
        &self.authenticators
    }

    /// The zombie queue.
    #[must_use]
    pub fn zombies(&self) -> &ZombieQueue {
        &self.zombies
    }

    /// Allocate a DCB in state `Alloc`.
    pub fn allocate(
        &self,
        role: DcbRole,
        listener: Option<Arc<Listener>>,
    ) -> Result<Arc<Dcb>, DcbError> {
        let mut directory = self.directory.write();
        if directory.len() >= self.config.max_connections {
            tracing::warn!(
                limit = self.config.max_connections,
                role = %role,
                "DCB allocation failed"
            );
            return Err(DcbError::Exhausted {
                limit: self.config.max_connections,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dcb = Arc::new(Dcb::new(
            id,
            role,
            listener,
            self.config.default_high_water,
            self.config.default_low_water,
        ));
        directory.insert(id, Arc::clone(&dcb));
        tracing::trace!(dcb = id, role = %role, "DCB allocated");
        Ok(dcb)
    }

    /// Hand an allocated DCB to the event demultiplexer.
    ///
    /// Listening DCBs move to `Listening`, all others to `Polling`.
    pub fn register_for_events(&self, dcb: &Arc<Dcb>) -> Result<(), DcbError> {
        let fd = dcb.fd();
        if fd < 0 {
            return Err(DcbError::NoDescriptor { id: dcb.id() });
        }
        let (target, interest) = match dcb.role() {
            DcbRole::ServiceListener => (DcbState::Listening, EventMask::READ),
            _ => (DcbState::Polling, EventMask::all()),
        };

        let mut lifecycle = dcb.lifecycle.lock();
        if lifecycle.state != DcbState::Alloc {
            return Err(DcbError::InvalidTransition {
                id: dcb.id(),
                from: lifecycle.state,
                to: target,
            });
        }
        self.demux.register(fd, interest, Arc::clone(dcb))?;
        lifecycle.transition(dcb.id(), target)
    }

    /// Take a polling DCB out of the event demultiplexer.
    pub fn stop_polling(&self, dcb: &Arc<Dcb>) -> Result<(), DcbError> {
        let mut lifecycle = dcb.lifecycle.lock();
        if lifecycle.state != DcbState::Polling {
            return Err(DcbError::InvalidTransition {
                id: dcb.id(),
                from: lifecycle.state,
                to: DcbState::NoPolling,
            });
        }
        self.demux.deregister(dcb.fd())?;
        lifecycle.transition(dcb.id(), DcbState::NoPolling)
    }

    /// Put a DCB taken out by [`stop_polling`](Self::stop_polling) back.
    pub fn resume_polling(&self, dcb: &Arc<Dcb>) -> Result<(), DcbError> {
        let mut lifecycle = dcb.lifecycle.lock();
        if lifecycle.state != DcbState::NoPolling || lifecycle.closing {
            return Err(DcbError::InvalidTransition {
                id: dcb.id(),
                from: lifecycle.state,
                to: DcbState::Polling,
            });
        }
        self.demux
            .register(dcb.fd(), EventMask::all(), Arc::clone(dcb))?;
        lifecycle.transition(dcb.id(), DcbState::Polling)
    }

    /// Accept a client connection on a listening DCB.
    pub fn accept(&self, listener: &Arc<Dcb>, conn: Accepted) -> Result<Arc<Dcb>, DcbError> {
        if listener.role() != DcbRole::ServiceListener {
            return Err(DcbError::WrongRole {
                id: listener.id(),
                role: listener.role(),
            });
        }
        let protocol = listener
            .protocol()
            .cloned()
            .ok_or(DcbError::NoProtocol { id: listener.id() })?;

        let dcb = self.allocate(DcbRole::ClientHandler, listener.listener().cloned())?;
        dcb.set_fd(conn.fd);
        dcb.set_remote(conn.remote);
        dcb.bind_protocol(protocol);
        listener.record_accept();

        if let Err(e) = self.register_for_events(&dcb) {
            self.destroy(&dcb);
            return Err(e);
        }
        tracing::debug!(
            dcb = dcb.id(),
            listener = listener.id(),
            remote = ?dcb.remote(),
            "client accepted"
        );
        Ok(dcb)
    }

    /// Get a backend connection for a session.
    ///
    /// An idle pooled connection for the same user and protocol is reused
    /// when the server pools connections; otherwise a new one is opened.
    pub fn connect(
        &self,
        server: &Arc<Server>,
        session: &Arc<Session>,
        protocol: &str,
        user: &str,
    ) -> Result<Arc<Dcb>, DcbError> {
        if server.persist_pool_max() > 0 {
            if let Some(dcb) = self.persistent_acquire(server, user, protocol) {
                dcb.set_user(Some(user.to_string()));
                dcb.set_session(Some(Arc::clone(session)));
                tracing::debug!(
                    dcb = dcb.id(),
                    server = %server.unique_name(),
                    user,
                    "reusing pooled connection"
                );
                return Ok(dcb);
            }
        }

        let module = self
            .protocols
            .get(protocol)
            .ok_or_else(|| DcbError::UnknownProtocol(protocol.to_string()))?;
        let dcb = self.allocate(DcbRole::BackendHandler, None)?;
        dcb.bind_server(Arc::clone(server));
        dcb.bind_protocol(Arc::clone(&module));
        dcb.set_session(Some(Arc::clone(session)));
        dcb.set_user(Some(user.to_string()));

        let fd = match module.connect(&dcb, server, session) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::warn!(
                    server = %server.unique_name(),
                    error = %e,
                    "backend connect failed"
                );
                self.destroy(&dcb);
                return Err(e.into());
            }
        };
        dcb.set_fd(fd);
        server.connection_opened();
        dcb.counted.store(true, Ordering::Release);

        if let Err(e) = self.register_for_events(&dcb) {
            self.destroy(&dcb);
            return Err(e);
        }
        tracing::debug!(dcb = dcb.id(), server = %server.unique_name(), "backend connected");
        Ok(dcb)
    }

    /// Start a listener.
    ///
    /// TLS and the authenticator are set up first; a failure there leaves
    /// the listener without a listening DCB.
    pub fn listen(&self, listener: &Arc<Listener>) -> Result<Arc<Dcb>, ListenerError> {
        if listener.listener_dcb().is_some() {
            return Err(ListenerError::AlreadyListening(listener.name().to_string()));
        }
        listener.init_ssl()?;
        listener.init_authenticator(&self.authenticators)?;

        let module = self
            .protocols
            .get(listener.protocol())
            .ok_or_else(|| DcbError::UnknownProtocol(listener.protocol().to_string()))?;
        let dcb = self.allocate(DcbRole::ServiceListener, Some(Arc::clone(listener)))?;
        dcb.bind_protocol(Arc::clone(&module));

        match module.listen(&dcb, listener.address(), listener.port()) {
            Ok(fd) => dcb.set_fd(fd),
            Err(e) => {
                self.destroy(&dcb);
                return Err(DcbError::from(e).into());
            }
        }
        if let Err(e) = self.register_for_events(&dcb) {
            self.destroy(&dcb);
            return Err(e.into());
        }
        listener.set_dcb(&dcb);
        tracing::info!(
            listener = %listener.name(),
            address = %listener.address(),
            port = listener.port(),
            tls = listener.tls_context().is_some(),
            "listener ready"
        );
        Ok(dcb)
    }

    /// Close a DCB.
    ///
    /// The first caller runs the CLOSE callbacks and then either pools the
    /// connection or retires it. Closing a DCB that is already closing,
    /// pooled or retired does nothing.
    pub fn close(&self, dcb: &Arc<Dcb>) {
        if !self.begin_close(dcb) {
            return;
        }
        dcb.invoke_callbacks(DcbReason::Close);
        if dcb.role() == DcbRole::BackendHandler && self.try_pool(dcb) {
            return;
        }
        self.destroy(dcb);
    }

    /// Offer a backend DCB to its server's pool; a rejected DCB is retired.
    ///
    /// Returns whether the DCB was pooled.
    pub fn persistent_offer(&self, dcb: &Arc<Dcb>) -> bool {
        if !self.begin_close(dcb) {
            return false;
        }
        if self.try_pool(dcb) {
            return true;
        }
        self.destroy(dcb);
        false
    }

    fn begin_close(&self, dcb: &Dcb) -> bool {
        let mut lifecycle = dcb.lifecycle.lock();
        if lifecycle.closing
            || lifecycle.pooled
            || matches!(lifecycle.state, DcbState::Disconnected | DcbState::Zombie)
        {
            tracing::trace!(dcb = dcb.id(), state = %lifecycle.state, "close ignored");
            return false;
        }
        lifecycle.closing = true;
        true
    }

    fn try_pool(&self, dcb: &Arc<Dcb>) -> bool {
        let Some(server) = dcb.server() else {
            return false;
        };
        let mut lifecycle = dcb.lifecycle.lock();
        if lifecycle.state != DcbState::Polling {
            return false;
        }
        match server.pool_offer(dcb) {
            Ok(()) => {
                lifecycle.pooled = true;
                lifecycle.closing = false;
                dcb.set_session(None);
                dcb.clear_callbacks();
                tracing::debug!(dcb = dcb.id(), server = %server.unique_name(), "DCB pooled");
                true
            }
            Err(reason) => {
                tracing::debug!(
                    dcb = dcb.id(),
                    server = %server.unique_name(),
                    %reason,
                    "DCB not pooled"
                );
                false
            }
        }
    }

    /// Retire a DCB through the zombie queue.
    pub(crate) fn destroy(&self, dcb: &Arc<Dcb>) {
        {
            let mut lifecycle = dcb.lifecycle.lock();
            let path: &[DcbState] = match lifecycle.state {
                DcbState::Zombie => return,
                DcbState::Polling => &[DcbState::NoPolling, DcbState::Disconnected],
                DcbState::Alloc | DcbState::NoPolling | DcbState::Listening => {
                    &[DcbState::Disconnected]
                }
                DcbState::Disconnected => &[],
            };
            if matches!(lifecycle.state, DcbState::Polling | DcbState::Listening) {
                if let Err(e) = self.demux.deregister(dcb.fd()) {
                    tracing::warn!(dcb = dcb.id(), error = %e, "deregister failed");
                }
            }
            lifecycle.closing = true;
            lifecycle.pooled = false;
            for &next in path.iter().chain(&[DcbState::Zombie]) {
                if let Err(e) = lifecycle.transition(dcb.id(), next) {
                    tracing::warn!(error = %e, "unexpected transition failure");
                }
            }
        }

        if dcb.counted.swap(false, Ordering::AcqRel) {
            if let Some(server) = dcb.server() {
                server.connection_closed();
            }
        }
        self.zombies.retire(Arc::clone(dcb));
    }

    /// Release a DCB taken off the zombie queue.
    pub(crate) fn release(&self, dcb: Arc<Dcb>) {
        if dcb.is_released() {
            tracing::warn!(dcb = dcb.id(), "DCB released twice");
            return;
        }
        if let Some(protocol) = dcb.protocol() {
            protocol.close(&dcb);
        }
        dcb.release_resources();
        self.directory.write().remove(&dcb.id());
        self.released.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(dcb = dcb.id(), "DCB released");
    }

    /// Sweep on behalf of a worker; returns the number of DCBs released.
    pub(crate) fn sweep_zombies(&self, worker: WorkerId) -> usize {
        let ready = self.zombies.sweep(worker);
        let n = ready.len();
        for dcb in ready {
            self.release(dcb);
        }
        n
    }

    /// Release every zombie no active worker can still be using.
    ///
    /// For threads outside the worker pool, such as shutdown.
    pub fn reclaim_zombies(&self) -> usize {
        let ready = self.zombies.collect();
        let n = ready.len();
        for dcb in ready {
            self.release(dcb);
        }
        n
    }

    /// Number of DCBs released since start.
    #[must_use]
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// The peer hung up: flag the DCB, run HUP callbacks once, close it.
    pub fn hangup(&self, dcb: &Arc<Dcb>) {
        if !dcb.set_flags(DcbFlags::HUNG).contains(DcbFlags::HUNG) {
            dcb.invoke_callbacks(DcbReason::Hup);
        }
        self.close(dcb);
    }

    /// A socket error: run ERROR callbacks once, close the DCB.
    pub fn error(&self, dcb: &Arc<Dcb>) {
        if dcb.mark_error_handled() {
            dcb.invoke_callbacks(DcbReason::Error);
        }
        self.close(dcb);
    }

    fn polling_backends(&self, server: &Arc<Server>) -> Vec<Arc<Dcb>> {
        self.directory
            .read()
            .values()
            .filter(|dcb| {
                dcb.role() == DcbRole::BackendHandler
                    && dcb.server().is_some_and(|s| Arc::ptr_eq(s, server))
                    && dcb.state() == DcbState::Polling
            })
            .cloned()
            .collect()
    }

    /// Run the callbacks for `reason` on every polling backend DCB of a
    /// server.
    pub fn call_foreach(&self, server: &Arc<Server>, reason: DcbReason) {
        for dcb in self.polling_backends(server) {
            dcb.invoke_callbacks(reason);
        }
    }

    /// Hang up every polling backend DCB of a server.
    pub fn hangup_foreach(&self, server: &Arc<Server>) {
        let dcbs = self.polling_backends(server);
        tracing::info!(
            server = %server.unique_name(),
            connections = dcbs.len(),
            "hanging up backend connections"
        );
        for dcb in dcbs {
            self.hangup(&dcb);
        }
    }

    /// Count live DCBs of a kind.
    #[must_use]
    pub fn count_by_usage(&self, usage: DcbUsage) -> usize {
        self.directory
            .read()
            .values()
            .filter(|dcb| usage.matches(dcb))
            .count()
    }

    /// All live DCBs, ordered by id.
    #[must_use]
    pub fn dcbs(&self) -> Vec<Arc<Dcb>> {
        let mut dcbs: Vec<_> = self.directory.read().values().cloned().collect();
        dcbs.sort_by_key(|dcb| dcb.id());
        dcbs
    }

    /// Look a live DCB up by id.
    #[must_use]
    pub fn find(&self, id: u64) -> Option<Arc<Dcb>> {
        self.directory.read().get(&id).cloned()
    }

    /// Zombies not yet released.
    #[must_use]
    pub fn zombie_list(&self) -> Vec<ZombieInfo> {
        self.zombies.snapshot()
    }

    fn destroy_evicted(&self, server: &Server, evicted: Vec<Arc<Dcb>>) {
        for dcb in evicted {
            tracing::debug!(dcb = dcb.id(), server = %server.unique_name(), "evicting pooled DCB");
            self.destroy(&dcb);
        }
    }

    /// Count a server's pooled connections; with `delete`, evict the aged
    /// and unhealthy ones first.
    pub fn persistent_clean(&self, server: &Server, delete: bool) -> usize {
        self.persistent_clean_at(server, delete, Instant::now())
    }

    /// [`persistent_clean`](Self::persistent_clean) against a given clock.
    pub fn persistent_clean_at(&self, server: &Server, delete: bool, now: Instant) -> usize {
        let sweep = server.pool_clean(delete, now);
        self.destroy_evicted(server, sweep.evicted);
        sweep.live
    }

    /// Take a pooled connection for `user` and `protocol`, if there is one.
    ///
    /// The returned DCB has no user set; the caller assigns it.
    #[must_use]
    pub fn persistent_acquire(&self, server: &Server, user: &str, protocol: &str) -> Option<Arc<Dcb>> {
        self.persistent_acquire_at(server, user, protocol, Instant::now())
    }

    /// [`persistent_acquire`](Self::persistent_acquire) against a given clock.
    #[must_use]
    pub fn persistent_acquire_at(
        &self,
        server: &Server,
        user: &str,
        protocol: &str,
        now: Instant,
    ) -> Option<Arc<Dcb>> {
        let checkout = server.pool_acquire(user, protocol, now);
        self.destroy_evicted(server, checkout.evicted);
        let (dcb, _user) = checkout.hit?;
        self.finish_checkout(dcb)
    }

    /// Take a DCB unlinked from a pool out of the pooled state.
    ///
    /// A hangup or error handled between the unlink and this point was
    /// ignored by `close` because the DCB still looked pooled; such a DCB is
    /// closed here instead of being handed out.
    fn finish_checkout(&self, dcb: Arc<Dcb>) -> Option<Arc<Dcb>> {
        let healthy = {
            let mut lifecycle = dcb.lifecycle.lock();
            lifecycle.pooled = false;
            dcb.is_healthy()
        };
        if !healthy {
            tracing::debug!(dcb = dcb.id(), "pooled DCB failed during checkout");
            self.close(&dcb);
            return None;
        }
        Some(dcb)
    }

    /// Unlink a server from the registry and retire its pooled connections.
    pub fn remove_server(&self, registry: &ServerRegistry, server: &Arc<Server>) -> bool {
        let removed = registry.remove(server);
        self.destroy_evicted(server, server.pool_drain());
        removed
    }
}

impl std::fmt::Debug for DcbManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcbManager")
            .field("config", &self.config)
            .field("live", &self.directory.read().len())
            .field("zombies", &self.zombies.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dcb::CallbackData;
    use crate::error::{PollError, ProtocolError};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicI32;

    #[derive(Default)]
    struct Demux {
        registered: Mutex<Vec<i32>>,
    }

    impl EventDemux for Demux {
        fn register(&self, fd: i32, _interest: EventMask, _owner: Arc<Dcb>) -> Result<(), PollError> {
            let mut fds = self.registered.lock();
            if fds.contains(&fd) {
                return Err(PollError::AlreadyRegistered(fd));
            }
            fds.push(fd);
            Ok(())
        }
        fn modify(&self, _fd: i32, _interest: EventMask) -> Result<(), PollError> {
            Ok(())
        }
        fn deregister(&self, fd: i32) -> Result<(), PollError> {
            let mut fds = self.registered.lock();
            let pos = fds.iter().position(|f| *f == fd).ok_or(PollError::NotRegistered(fd))?;
            fds.remove(pos);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Backend {
        next_fd: AtomicI32,
        closes: Mutex<Vec<u64>>,
        fail_connect: bool,
    }

    impl Protocol for Backend {
        fn name(&self) -> &str {
            "MySQLBackend"
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
            server: &Server,
            _session: &Session,
        ) -> Result<i32, ProtocolError> {
            if self.fail_connect {
                return Err(ProtocolError::Connect {
                    address: server.address(),
                    port: server.port(),
                    reason: "refused".into(),
                });
            }
            Ok(100 + self.next_fd.fetch_add(1, Ordering::Relaxed))
        }
        fn close(&self, dcb: &Dcb) {
            self.closes.lock().push(dcb.id());
        }
        fn listen(&self, _dcb: &Dcb, _address: &str, _port: u16) -> Result<i32, ProtocolError> {
            Ok(10)
        }
    }

    struct Fixture {
        manager: DcbManager,
        demux: Arc<Demux>,
        backend: Arc<Backend>,
        server: Arc<Server>,
        registry: ServerRegistry,
    }

    fn fixture_with(config: GatewayConfig, backend: Backend, pool_max: usize) -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let demux = Arc::new(Demux::default());
        let manager = DcbManager::new(config, demux.clone()).unwrap();
        let backend = Arc::new(backend);
        manager.register_protocol(backend.clone());
        let registry = ServerRegistry::new();
        let server = registry
            .create(
                crate::config::ServerConfig::new("db1")
                    .persistent_pool(pool_max, std::time::Duration::from_secs(60)),
            )
            .unwrap();
        Fixture {
            manager,
            demux,
            backend,
            server,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(GatewayConfig::new().worker_threads(2), Backend::default(), 0)
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new("rw"))
    }

    #[test]
    fn test_allocate_exhaustion() {
        let fx = fixture_with(
            GatewayConfig::new().max_connections(2),
            Backend::default(),
            0,
        );
        fx.manager.allocate(DcbRole::Internal, None).unwrap();
        fx.manager.allocate(DcbRole::Internal, None).unwrap();
        assert!(matches!(
            fx.manager.allocate(DcbRole::Internal, None),
            Err(DcbError::Exhausted { limit: 2 })
        ));
    }

    #[test]
    fn test_register_needs_descriptor_and_alloc_state() {
        let fx = fixture();
        let dcb = fx.manager.allocate(DcbRole::ClientHandler, None).unwrap();
        assert!(matches!(
            fx.manager.register_for_events(&dcb),
            Err(DcbError::NoDescriptor { .. })
        ));
        dcb.set_fd(5);
        fx.manager.register_for_events(&dcb).unwrap();
        assert_eq!(dcb.state(), DcbState::Polling);
        assert!(matches!(
            fx.manager.register_for_events(&dcb),
            Err(DcbError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_stop_and_resume_polling() {
        let fx = fixture();
        let dcb = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "u").unwrap();
        fx.manager.stop_polling(&dcb).unwrap();
        assert_eq!(dcb.state(), DcbState::NoPolling);
        assert!(fx.demux.registered.lock().is_empty());
        fx.manager.resume_polling(&dcb).unwrap();
        assert_eq!(dcb.state(), DcbState::Polling);
        assert!(fx.manager.resume_polling(&dcb).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let fx = fixture();
        let dcb = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "u").unwrap();
        assert_eq!(fx.server.stats().n_current, 1);

        fx.manager.close(&dcb);
        fx.manager.close(&dcb);
        assert_eq!(dcb.state(), DcbState::Zombie);
        assert_eq!(fx.manager.zombies().len(), 1);
        assert_eq!(fx.server.stats().n_current, 0);
        assert!(fx.demux.registered.lock().is_empty());

        assert_eq!(fx.manager.reclaim_zombies(), 1);
        fx.manager.close(&dcb);
        assert_eq!(*fx.backend.closes.lock(), vec![dcb.id()]);
        assert!(fx.manager.find(dcb.id()).is_none());
        assert_eq!(fx.manager.released_count(), 1);
    }

    fn count_close(_dcb: &Dcb, _reason: DcbReason, data: Option<&CallbackData>) {
        let n = data.unwrap().downcast_ref::<AtomicU64>().unwrap();
        n.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_close_callbacks_run_once() {
        let fx = fixture();
        let dcb = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "u").unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let data: CallbackData = counter.clone();
        dcb.add_callback(DcbReason::Close, count_close, Some(data.clone()))
            .unwrap();
        dcb.add_callback(DcbReason::Hup, count_close, Some(data))
            .unwrap();

        fx.manager.hangup(&dcb);
        fx.manager.hangup(&dcb);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(dcb.is_hung());
    }

    #[test]
    fn test_healthy_backend_is_pooled_on_close() {
        let fx = fixture_with(GatewayConfig::new(), Backend::default(), 2);
        let s = session();
        let dcb = fx.manager.connect(&fx.server, &s, "MySQLBackend", "alice").unwrap();
        fx.manager.close(&dcb);

        assert!(dcb.is_pooled());
        assert_eq!(dcb.state(), DcbState::Polling);
        assert!(dcb.session().is_none());
        assert!(fx.manager.zombies().is_empty());
        assert_eq!(fx.server.stats().n_persistent, 1);
        assert_eq!(fx.server.stats().n_current, 0);

        fx.manager.close(&dcb);
        assert!(dcb.is_pooled());

        let again = fx.manager.connect(&fx.server, &s, "MySQLBackend", "alice").unwrap();
        assert!(Arc::ptr_eq(&again, &dcb));
        assert!(!again.is_pooled());
        assert_eq!(again.user().as_deref(), Some("alice"));
        assert_eq!(fx.server.stats().n_current, 1);
        assert_eq!(fx.server.stats().n_connections, 1);
    }

    #[test]
    fn test_errored_backend_is_retired() {
        let fx = fixture_with(GatewayConfig::new(), Backend::default(), 2);
        let dcb = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "alice").unwrap();
        fx.manager.error(&dcb);
        assert_eq!(dcb.state(), DcbState::Zombie);
        assert_eq!(fx.server.stats().n_persistent, 0);
    }

    #[test]
    fn test_hangup_while_pooled_evicts_on_clean() {
        let fx = fixture_with(GatewayConfig::new(), Backend::default(), 2);
        let dcb = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "alice").unwrap();
        fx.manager.close(&dcb);
        fx.manager.hangup(&dcb);
        assert!(dcb.is_pooled());

        assert_eq!(fx.manager.persistent_clean(&fx.server, false), 1);
        assert_eq!(fx.manager.persistent_clean(&fx.server, true), 0);
        assert_eq!(dcb.state(), DcbState::Zombie);
        assert_eq!(fx.server.stats().n_persistent, 0);
        assert_eq!(fx.server.stats().n_current, 0);
    }

    #[test]
    fn test_hangup_during_checkout_is_not_lost() {
        let fx = fixture_with(GatewayConfig::new(), Backend::default(), 2);
        let dcb = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "alice").unwrap();
        fx.manager.close(&dcb);
        assert!(dcb.is_pooled());

        let (unlinked, _user) = fx
            .server
            .pool_acquire("alice", "MySQLBackend", Instant::now())
            .hit
            .unwrap();
        assert_eq!(fx.server.stats().n_current, 1);
        fx.manager.hangup(&unlinked);
        assert_eq!(unlinked.state(), DcbState::Polling);

        assert!(fx.manager.finish_checkout(Arc::clone(&unlinked)).is_none());
        assert!(unlinked.is_hung());
        assert!(!unlinked.is_pooled());
        assert_eq!(unlinked.state(), DcbState::Zombie);
        assert_eq!(fx.manager.zombies().len(), 1);
        assert_eq!(fx.server.stats().n_current, 0);
        assert_eq!(fx.server.stats().n_persistent, 0);
        assert!(fx.server.pooled_ids().is_empty());

        assert_eq!(fx.manager.reclaim_zombies(), 1);
        assert_eq!(*fx.backend.closes.lock(), vec![dcb.id()]);
    }

    #[test]
    fn test_error_during_checkout_falls_back_to_new_connection() {
        let fx = fixture_with(GatewayConfig::new(), Backend::default(), 2);
        let s = session();
        let pooled = fx.manager.connect(&fx.server, &s, "MySQLBackend", "alice").unwrap();
        fx.manager.close(&pooled);

        let (unlinked, _user) = fx
            .server
            .pool_acquire("alice", "MySQLBackend", Instant::now())
            .hit
            .unwrap();
        fx.manager.error(&unlinked);
        assert!(fx.manager.finish_checkout(unlinked).is_none());

        let fresh = fx.manager.connect(&fx.server, &s, "MySQLBackend", "alice").unwrap();
        assert_ne!(fresh.id(), pooled.id());
        assert_eq!(pooled.state(), DcbState::Zombie);
        assert_eq!(fx.server.stats().n_current, 1);
        assert_eq!(fx.server.stats().n_connections, 2);
    }

    #[test]
    fn test_connect_failure_retires_partial_dcb() {
        let backend = Backend {
            fail_connect: true,
            ..Backend::default()
        };
        let fx = fixture_with(GatewayConfig::new(), backend, 0);
        let err = fx
            .manager
            .connect(&fx.server, &session(), "MySQLBackend", "alice")
            .unwrap_err();
        assert!(matches!(err, DcbError::Protocol(ProtocolError::Connect { .. })));
        assert_eq!(fx.manager.zombies().len(), 1);
        assert_eq!(fx.server.stats().n_connections, 0);
        assert_eq!(fx.manager.reclaim_zombies(), 1);
        assert_eq!(fx.manager.count_by_usage(DcbUsage::All), 0);
    }

    #[test]
    fn test_unknown_protocol() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.connect(&fx.server, &session(), "PostgresBackend", "u"),
            Err(DcbError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_hangup_foreach_and_call_foreach() {
        let fx = fixture();
        let a = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "u").unwrap();
        let b = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "u").unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let data: CallbackData = counter.clone();
        a.add_callback(DcbReason::NotResponding, count_close, Some(data))
            .unwrap();

        fx.manager.call_foreach(&fx.server, DcbReason::NotResponding);
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        fx.manager.hangup_foreach(&fx.server);
        assert!(a.is_hung() && b.is_hung());
        assert_eq!(fx.manager.count_by_usage(DcbUsage::Zombie), 2);
    }

    #[test]
    fn test_remove_server_drains_pool() {
        let fx = fixture_with(GatewayConfig::new(), Backend::default(), 2);
        let dcb = fx.manager.connect(&fx.server, &session(), "MySQLBackend", "alice").unwrap();
        fx.manager.close(&dcb);
        assert!(fx.manager.remove_server(&fx.registry, &fx.server));
        assert!(fx.registry.is_empty());
        assert_eq!(dcb.state(), DcbState::Zombie);
        assert_eq!(fx.server.stats().n_persistent, 0);
    }

    #[test]
    fn test_count_by_usage() {
        let fx = fixture();
        fx.manager.allocate(DcbRole::ClientHandler, None).unwrap();
        fx.manager.allocate(DcbRole::Internal, None).unwrap();
        fx.manager.connect(&fx.server, &session(), "MySQLBackend", "u").unwrap();
        assert_eq!(fx.manager.count_by_usage(DcbUsage::Client), 1);
        assert_eq!(fx.manager.count_by_usage(DcbUsage::Internal), 1);
        assert_eq!(fx.manager.count_by_usage(DcbUsage::Backend), 1);
        assert_eq!(fx.manager.count_by_usage(DcbUsage::Listener), 0);
        assert_eq!(fx.manager.count_by_usage(DcbUsage::All), 3);
        let ids: Vec<_> = fx.manager.dcbs().iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
