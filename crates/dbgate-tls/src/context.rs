//! Listener TLS context construction.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::config::SslListenerConfig;
use crate::error::TlsError;
use crate::keys::EphemeralKeys;

/// A built TLS server context.
#[derive(Debug, Clone)]
pub struct TlsContext {
    server_config: Arc<ServerConfig>,
    keys: &'static EphemeralKeys,
    verify_depth: u32,
}

impl TlsContext {
    /// The rustls server configuration handed to accepted connections.
    #[must_use]
    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.server_config
    }

    /// The shared ephemeral keys.
    ///
    /// These are held alongside the context only. The rustls configuration
    /// negotiates its own ephemeral key exchange and never reads them.
    #[must_use]
    pub fn ephemeral_keys(&self) -> &'static EphemeralKeys {
        self.keys
    }

    /// Configured client certificate verification depth.
    #[must_use]
    pub fn verify_depth(&self) -> u32 {
        self.verify_depth
    }

    /// Whether clients must present a verified certificate.
    #[must_use]
    pub fn requires_client_cert(&self) -> bool {
        self.verify_depth > 0
    }
}

/// The TLS state of one listener.
///
/// The context is built at most once; a failed build leaves the listener
/// without a context and may be retried.
#[derive(Debug)]
pub struct SslListener {
    config: SslListenerConfig,
    context: OnceCell<TlsContext>,
}

impl SslListener {
    /// Create an uninitialized listener TLS state.
    #[must_use]
    pub fn new(config: SslListenerConfig) -> Self {
        Self {
            config,
            context: OnceCell::new(),
        }
    }

    /// The listener TLS configuration.
    #[must_use]
    pub fn config(&self) -> &SslListenerConfig {
        &self.config
    }

    /// Build the context, or return the one built earlier.
    pub fn init(&self) -> Result<&TlsContext, TlsError> {
        self.context.get_or_try_init(|| {
            build_context(&self.config).inspect_err(|e| {
                tracing::error!(error = %e, "listener TLS initialization failed");
            })
        })
    }

    /// Whether a context has been built.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.context.get().is_some()
    }

    /// The built context, if any.
    #[must_use]
    pub fn context(&self) -> Option<&TlsContext> {
        self.context.get()
    }
}

fn build_context(config: &SslListenerConfig) -> Result<TlsContext, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions = config.protocol_versions()?;
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| TlsError::ContextCreation(e.to_string()))?;

    let keys = EphemeralKeys::shared()?;

    let (Some(cert_path), Some(key_path)) = (&config.certificate, &config.private_key) else {
        return Err(TlsError::MissingCertificate);
    };
    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;
    check_key_matches(&provider, &certs, &key)?;

    let roots = config.ca_certificate.as_deref().map(load_ca).transpose()?;

    let builder = if config.verify_depth > 0 {
        let roots = roots.ok_or(TlsError::CaRequired {
            depth: config.verify_depth,
        })?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TlsError::ContextCreation(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| match e {
            rustls::Error::InconsistentKeys(_) => TlsError::KeyMismatch(e.to_string()),
            other => TlsError::ContextCreation(other.to_string()),
        })?;

    tracing::info!(
        versions = versions.len(),
        verify_depth = config.verify_depth,
        "listener TLS context ready"
    );

    Ok(TlsContext {
        server_config: Arc::new(server_config),
        keys,
        verify_depth: config.verify_depth,
    })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let err = |reason: String| TlsError::CertificateLoad {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| err(e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| err(e.to_string()))?;

    if certs.is_empty() {
        return Err(err("no certificate found".to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let err = |reason: String| TlsError::KeyLoad {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| err(e.to_string()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| err(e.to_string()))?
        .ok_or_else(|| err("no private key found".to_string()))
}

fn load_ca(path: &Path) -> Result<RootCertStore, TlsError> {
    let certs = load_certificates(path).map_err(|e| match e {
        TlsError::CertificateLoad { path, reason } => TlsError::CaLoad { path, reason },
        other => other,
    })?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).map_err(|e| TlsError::CaLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    Ok(roots)
}

fn check_key_matches(
    provider: &CryptoProvider,
    certs: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<(), TlsError> {
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| TlsError::KeyMismatch(e.to_string()))?;

    match rustls::sign::CertifiedKey::new(certs.to_vec(), signing_key).keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => Ok(()),
        Err(e) => Err(TlsError::KeyMismatch(e.to_string())),
    }
}
