//! TLS error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building a listener TLS context.
///
/// Any of these leaves the listener without a usable context.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// The TLS context itself could not be created.
    #[error("TLS context creation failed: {0}")]
    ContextCreation(String),

    /// No certificate or no private key was configured.
    #[error("listener TLS requires both a certificate and a private key")]
    MissingCertificate,

    /// The certificate file could not be loaded.
    #[error("failed to load certificate {path}: {reason}")]
    CertificateLoad {
        /// Certificate file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The private key file could not be loaded.
    #[error("failed to load private key {path}: {reason}")]
    KeyLoad {
        /// Key file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The private key does not belong to the certificate.
    #[error("certificate and private key do not match: {0}")]
    KeyMismatch(String),

    /// The certificate authority file could not be loaded.
    #[error("failed to load CA certificate {path}: {reason}")]
    CaLoad {
        /// CA file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Peer verification was requested but no CA file was configured.
    #[error("certificate verification depth {depth} requires a CA certificate")]
    CaRequired {
        /// Configured verification depth.
        depth: u32,
    },

    /// Ephemeral key generation failed.
    #[error("ephemeral key generation failed: {0}")]
    KeyGeneration(String),

    /// A protocol version name was not recognised.
    #[error("invalid TLS version: {0}")]
    InvalidVersion(String),
}
