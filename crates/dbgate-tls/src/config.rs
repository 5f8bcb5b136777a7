//! Listener TLS configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TlsError;

/// A TLS protocol version bound.
///
/// `Max` stands for the newest version the TLS stack supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SslVersion {
    /// TLS 1.0.
    #[serde(rename = "TLSV10")]
    Tls10,
    /// TLS 1.1.
    #[serde(rename = "TLSV11")]
    Tls11,
    /// TLS 1.2.
    #[serde(rename = "TLSV12")]
    Tls12,
    /// TLS 1.3.
    #[serde(rename = "TLSV13")]
    Tls13,
    /// Newest supported version.
    #[serde(rename = "MAX")]
    Max,
}

impl SslVersion {
    /// Configuration name of the version.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tls10 => "TLSV10",
            Self::Tls11 => "TLSV11",
            Self::Tls12 => "TLSV12",
            Self::Tls13 => "TLSV13",
            Self::Max => "MAX",
        }
    }
}

impl fmt::Display for SslVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslVersion {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TLSV10" => Ok(Self::Tls10),
            "TLSV11" => Ok(Self::Tls11),
            "TLSV12" => Ok(Self::Tls12),
            "TLSV13" => Ok(Self::Tls13),
            "MAX" => Ok(Self::Max),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// TLS settings of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslListenerConfig {
    /// Server certificate chain (PEM).
    pub certificate: Option<PathBuf>,
    /// Server private key (PEM).
    pub private_key: Option<PathBuf>,
    /// Certificate authority file (PEM) used to verify clients.
    pub ca_certificate: Option<PathBuf>,
    /// Lowest protocol version accepted.
    pub min_version: SslVersion,
    /// Highest protocol version accepted.
    pub max_version: SslVersion,
    /// Client certificate verification depth; 0 disables verification.
    pub verify_depth: u32,
}

impl Default for SslListenerConfig {
    fn default() -> Self {
        Self {
            certificate: None,
            private_key: None,
            ca_certificate: None,
            min_version: SslVersion::Tls10,
            max_version: SslVersion::Max,
            verify_depth: 0,
        }
    }
}

impl SslListenerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the certificate file.
    #[must_use]
    pub fn certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate = Some(path.into());
        self
    }

    /// Set the private key file.
    #[must_use]
    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Set the CA certificate file.
    #[must_use]
    pub fn ca_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certificate = Some(path.into());
        self
    }

    /// Set the lowest accepted version.
    #[must_use]
    pub fn min_version(mut self, version: SslVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Set the highest accepted version.
    #[must_use]
    pub fn max_version(mut self, version: SslVersion) -> Self {
        self.max_version = version;
        self
    }

    /// Set the client certificate verification depth.
    #[must_use]
    pub fn verify_depth(mut self, depth: u32) -> Self {
        self.verify_depth = depth;
        self
    }

    /// The rustls protocol versions inside the configured range.
    pub(crate) fn protocol_versions(
        &self,
    ) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
        let supported = [
            (SslVersion::Tls12, &rustls::version::TLS12),
            (SslVersion::Tls13, &rustls::version::TLS13),
        ];
        let max = match self.max_version {
            SslVersion::Max => SslVersion::Tls13,
            other => other,
        };
        let min = match self.min_version {
            SslVersion::Max => SslVersion::Tls13,
            other => other,
        };

        let versions: Vec<_> = supported
            .into_iter()
            .filter(|(v, _)| min <= *v && *v <= max)
            .map(|(_, version)| version)
            .collect();

        if versions.is_empty() {
            return Err(TlsError::ContextCreation(format!(
                "no supported protocol version between {} and {}",
                self.min_version, self.max_version
            )));
        }
        if min < SslVersion::Tls12 {
            tracing::debug!(
                min_version = %self.min_version,
                "versions below TLS 1.2 are not offered"
            );
        }
        Ok(versions)
    }
}
