//! The authenticator module interface and built-in modules.

use std::any::Any;
use std::sync::Arc;

use crate::error::AuthError;
use crate::users::Users;

/// Per-listener state created by [`Authenticator::initialize`].
pub type AuthInstance = Arc<dyn Any + Send + Sync>;

/// Result of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthOutcome {
    /// Authentication was successful.
    Succeeded,
    /// Authentication failed.
    Failed,
    /// Authentication failed, database not found.
    FailedDb,
    /// TLS was required but the connection is not encrypted.
    FailedSsl,
    /// More data is needed from the client.
    Incomplete,
    /// The TLS handshake has not completed yet.
    SslIncomplete,
    /// No session could be created for the client.
    NoSession,
}

impl AuthOutcome {
    /// Whether the client may proceed.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// The credentials a client presented.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// Claimed user name.
    pub user: &'a str,
    /// Authentication token sent by the client.
    pub token: &'a [u8],
    /// The listener's users table.
    pub users: &'a Users,
    /// Whether the client connection completed a TLS handshake.
    pub ssl_established: bool,
}

/// An authenticator module.
///
/// Modules are registered by name and selected per listener. The listener
/// owns the instance returned by [`initialize`](Authenticator::initialize)
/// and passes it back on every call.
pub trait Authenticator: Send + Sync {
    /// Name the module is registered under.
    fn plugin_name(&self) -> &'static str;

    /// Create the per-listener instance from the split option tokens.
    fn initialize(&self, options: &[String]) -> Result<AuthInstance, AuthError>;

    /// Check a client's credentials.
    fn authenticate(&self, instance: &AuthInstance, request: &AuthRequest<'_>) -> AuthOutcome;

    /// Release an instance when its listener goes away.
    fn release(&self, instance: AuthInstance) {
        drop(instance);
    }
}

/// Accepts every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthAllow;

impl Authenticator for NullAuthAllow {
    fn plugin_name(&self) -> &'static str {
        "NullAuthAllow"
    }

    fn initialize(&self, _options: &[String]) -> Result<AuthInstance, AuthError> {
        Ok(Arc::new(()))
    }

    fn authenticate(&self, _instance: &AuthInstance, _request: &AuthRequest<'_>) -> AuthOutcome {
        AuthOutcome::Succeeded
    }
}

/// Rejects every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthDeny;

impl Authenticator for NullAuthDeny {
    fn plugin_name(&self) -> &'static str {
        "NullAuthDeny"
    }

    fn initialize(&self, _options: &[String]) -> Result<AuthInstance, AuthError> {
        Ok(Arc::new(()))
    }

    fn authenticate(&self, _instance: &AuthInstance, _request: &AuthRequest<'_>) -> AuthOutcome {
        AuthOutcome::Failed
    }
}

/// Compares the client token with the password stored in the users table.
///
/// Options:
/// - `require_ssl`: reject clients that have not completed a TLS handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainAuth;

#[derive(Debug, Default)]
struct PlainAuthInstance {
    require_ssl: bool,
}

impl Authenticator for PlainAuth {
    fn plugin_name(&self) -> &'static str {
        "PlainAuth"
    }

    fn initialize(&self, options: &[String]) -> Result<AuthInstance, AuthError> {
        let mut instance = PlainAuthInstance::default();
        for option in options {
            match option.trim() {
                "require_ssl" => instance.require_ssl = true,
                "" => {}
                other => return Err(AuthError::UnknownOption(other.to_string())),
            }
        }
        tracing::debug!(require_ssl = instance.require_ssl, "PlainAuth initialized");
        Ok(Arc::new(instance))
    }

    fn authenticate(&self, instance: &AuthInstance, request: &AuthRequest<'_>) -> AuthOutcome {
        let Some(instance) = instance.downcast_ref::<PlainAuthInstance>() else {
            tracing::warn!("PlainAuth called with a foreign instance");
            return AuthOutcome::Failed;
        };

        if instance.require_ssl && !request.ssl_established {
            return AuthOutcome::FailedSsl;
        }
        if request.user.is_empty() {
            return AuthOutcome::Incomplete;
        }

        match request.users.fetch(request.user) {
            Some(password) if password.as_bytes() == request.token => AuthOutcome::Succeeded,
            _ => {
                tracing::debug!(user = request.user, "PlainAuth rejected credentials");
                AuthOutcome::Failed
            }
        }
    }
}
