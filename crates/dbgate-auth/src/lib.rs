//! # dbgate-auth
//!
//! Authenticator modules for dbgate listeners.
//!
//! A listener names an authenticator module and passes it an option string.
//! The option string is split into tokens (see [`split_options`]) and handed
//! to [`Authenticator::initialize`], which returns the per-listener instance
//! used for every client accepted on that listener.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbgate_auth::{Authenticator, PlainAuth, split_options};
//!
//! let options = split_options("users=static,strict")?;
//! let instance = PlainAuth.initialize(&options)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod authenticator;
pub mod error;
pub mod options;
pub mod users;

pub use authenticator::{
    AuthInstance, AuthOutcome, AuthRequest, Authenticator, NullAuthAllow, NullAuthDeny, PlainAuth,
};
pub use error::AuthError;
pub use options::{MAX_OPTIONS, split_options};
pub use users::{Users, UsersStats};
