//! Starting listeners, with and without TLS, and accepting clients on them.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use dbgate_auth::AuthOutcome;
use dbgate_core::{
    Dcb, DcbError, DcbRole, DcbState, DcbUsage, EventMask, Listener, ListenerConfig, ListenerError,
    Worker,
};
use dbgate_testing::TestGateway;
use dbgate_tls::{SslListenerConfig, TlsError};
use tempfile::TempDir;

struct Certs {
    _dir: TempDir,
    cert: PathBuf,
    key: PathBuf,
}

fn certs() -> Certs {
    let dir = TempDir::new().unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = dir.path().join("server.pem");
    let key = dir.path().join("server.key");
    fs::write(&cert, generated.cert.pem()).unwrap();
    fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
    Certs {
        _dir: dir,
        cert,
        key,
    }
}

#[test]
fn test_tls_listener_starts_once() {
    let gw = TestGateway::new(1).unwrap();
    let certs = certs();
    let listener = Arc::new(Listener::new(
        ListenerConfig::new("rw-tls").port(4008).ssl(
            SslListenerConfig::new()
                .certificate(&certs.cert)
                .private_key(&certs.key),
        ),
    ));

    let dcb = gw.manager.listen(&listener).unwrap();
    assert_eq!(dcb.role(), DcbRole::ServiceListener);
    assert_eq!(dcb.state(), DcbState::Listening);
    assert_eq!(gw.demux.interest(dcb.fd()), Some(EventMask::READ));
    assert!(Arc::ptr_eq(&listener.listener_dcb().unwrap(), &dcb));
    assert!(listener.is_ready());

    let context = listener.tls_context().unwrap() as *const _;
    listener.init_ssl().unwrap();
    assert!(std::ptr::eq(listener.tls_context().unwrap(), context));

    assert!(matches!(
        gw.manager.listen(&listener),
        Err(ListenerError::AlreadyListening(ref name)) if name == "rw-tls"
    ));
    assert_eq!(gw.manager.count_by_usage(DcbUsage::Listener), 1);
}

#[test]
fn test_tls_failure_leaves_no_listening_dcb() {
    let gw = TestGateway::new(1).unwrap();
    let certs = certs();
    let listener = Arc::new(Listener::new(
        ListenerConfig::new("broken").ssl(SslListenerConfig::new().certificate(&certs.cert)),
    ));

    let err = gw.manager.listen(&listener).unwrap_err();
    assert!(matches!(
        err,
        ListenerError::Tls {
            ref name,
            source: TlsError::MissingCertificate,
        } if name == "broken"
    ));
    assert!(listener.listener_dcb().is_none());
    assert!(listener.tls_context().is_none());
    assert_eq!(gw.manager.count_by_usage(DcbUsage::All), 0);
    assert_eq!(gw.demux.registered_count(), 0);
}

#[test]
fn test_listen_failure_retires_the_dcb() {
    let gw = TestGateway::new(1).unwrap();
    gw.client.set_fail_listen(true);
    let listener = Arc::new(Listener::new(ListenerConfig::new("rw")));

    let err = gw.manager.listen(&listener).unwrap_err();
    assert!(matches!(err, ListenerError::Dcb(DcbError::Protocol(_))));
    assert!(listener.listener_dcb().is_none());
    assert_eq!(gw.reclaim(), 1);
    assert_eq!(gw.manager.count_by_usage(DcbUsage::All), 0);
}

#[test]
fn test_clients_are_accepted_and_authenticated() {
    let gw = TestGateway::new(1).unwrap();
    let listener = Arc::new(Listener::new(
        ListenerConfig::new("rw").authenticator("PlainAuth", ""),
    ));
    listener.users().add("alice", "secret");
    let listening = gw.manager.listen(&listener).unwrap();

    let fd = gw.client.queue_accept("192.0.2.7:50123");
    let worker = Worker::start(gw.manager.clone(), 0).unwrap();
    worker.process_batch([(Arc::clone(&listening), EventMask::READ)]);

    assert_eq!(listening.stats().n_accepts, 1);
    assert_eq!(gw.manager.count_by_usage(DcbUsage::Client), 1);
    let client = gw
        .manager
        .dcbs()
        .into_iter()
        .find(|d| d.role() == DcbRole::ClientHandler)
        .unwrap();
    assert_eq!(client.fd(), fd);
    assert_eq!(client.state(), DcbState::Polling);
    assert_eq!(client.remote().as_deref(), Some("192.0.2.7:50123"));
    assert!(Arc::ptr_eq(client.listener().unwrap(), &listener));

    let owner = client.listener().unwrap();
    assert_eq!(owner.authenticate("alice", b"secret", false), AuthOutcome::Succeeded);
    assert_eq!(owner.authenticate("alice", b"wrong", false), AuthOutcome::Failed);

    gw.manager.close(&client);
    assert_eq!(worker.process_batch(Vec::<(Arc<Dcb>, EventMask)>::new()), 1);
    assert_eq!(gw.client.close_count(client.id()), 1);
}

#[test]
fn test_unknown_authenticator_is_rejected() {
    let gw = TestGateway::new(1).unwrap();
    let listener = Arc::new(Listener::new(
        ListenerConfig::new("rw").authenticator("GSSAPIAuth", ""),
    ));
    assert!(matches!(
        gw.manager.listen(&listener),
        Err(ListenerError::UnknownAuthenticator(ref name)) if name == "GSSAPIAuth"
    ));
    assert!(listener.listener_dcb().is_none());
}
