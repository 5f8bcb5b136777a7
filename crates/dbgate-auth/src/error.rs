//! Authentication error types.

use thiserror::Error;

/// Errors that can occur while initializing or running an authenticator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The option string produced more tokens than an authenticator accepts.
    #[error("too many authenticator options: {count} (max {max})")]
    TooManyOptions {
        /// Number of tokens found.
        count: usize,
        /// Maximum number of tokens allowed.
        max: usize,
    },

    /// An option token was not understood by the authenticator.
    #[error("unknown authenticator option: {0}")]
    UnknownOption(String),

    /// Module initialization failed.
    #[error("authenticator initialization failed: {0}")]
    Initialization(String),
}
