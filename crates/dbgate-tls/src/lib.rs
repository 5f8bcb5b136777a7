//! # dbgate-tls
//!
//! TLS context construction for dbgate listeners.
//!
//! Each listener with a TLS section owns one [`SslListener`]. Initializing it
//! builds a rustls [`ServerConfig`](rustls::ServerConfig) from the listener's
//! certificate, private key and CA file. Initialization is idempotent: once a
//! context exists, later calls return it unchanged.
//!
//! All contexts share one process-wide [`EphemeralKeys`] cache, generated on
//! first use.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbgate_tls::{SslListener, SslListenerConfig, SslVersion};
//!
//! let ssl = SslListener::new(
//!     SslListenerConfig::new()
//!         .certificate("/etc/dbgate/server.pem")
//!         .private_key("/etc/dbgate/server.key")
//!         .min_version(SslVersion::Tls12),
//! );
//!
//! let context = ssl.init()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod keys;

pub use config::{SslListenerConfig, SslVersion};
pub use context::{SslListener, TlsContext};
pub use error::TlsError;
pub use keys::EphemeralKeys;
