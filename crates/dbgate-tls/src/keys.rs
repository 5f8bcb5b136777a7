//! Process-wide ephemeral key cache.
//!
//! Two key pairs of fixed strength are generated the first time any listener
//! builds a TLS context and are shared by every context afterwards.
//! They are not wired into the rustls handshake, which generates its own
//! ephemeral shares per connection.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use rcgen::KeyPair;

use crate::error::TlsError;

static SHARED: OnceCell<EphemeralKeys> = OnceCell::new();
static GENERATIONS: AtomicUsize = AtomicUsize::new(0);

/// The shared pair of ephemeral keys.
pub struct EphemeralKeys {
    p256: KeyPair,
    p384: KeyPair,
}

impl EphemeralKeys {
    /// The shared cache, generated on first use.
    pub fn shared() -> Result<&'static EphemeralKeys, TlsError> {
        SHARED.get_or_try_init(Self::generate)
    }

    /// Number of times the cache has been generated in this process.
    #[must_use]
    pub fn generations() -> usize {
        GENERATIONS.load(Ordering::Acquire)
    }

    fn generate() -> Result<Self, TlsError> {
        let p256 = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| TlsError::KeyGeneration(format!("P-256: {e}")))?;
        let p384 = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| TlsError::KeyGeneration(format!("P-384: {e}")))?;

        GENERATIONS.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("generated shared ephemeral keys");
        Ok(Self { p256, p384 })
    }

    /// Key for a requested strength in bits.
    ///
    /// 256 selects the P-256 key, 384 the P-384 key; any other length gets
    /// the strongest key available rather than generating a new one.
    #[must_use]
    pub fn for_strength(&self, bits: u32) -> &KeyPair {
        match bits {
            256 => &self.p256,
            _ => &self.p384,
        }
    }

    /// DER-encoded public key for a requested strength.
    #[must_use]
    pub fn public_key_der(&self, bits: u32) -> Vec<u8> {
        self.for_strength(bits).public_key_der()
    }
}

impl fmt::Debug for EphemeralKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeys")
            .field("p256", &"<redacted>")
            .field("p384", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_is_stable() {
        let first = EphemeralKeys::shared().unwrap();
        let generations = EphemeralKeys::generations();
        let second = EphemeralKeys::shared().unwrap();

        assert!(std::ptr::eq(first, second));
        assert_eq!(EphemeralKeys::generations(), generations);
        assert_eq!(generations, 1);
    }

    #[test]
    fn test_strength_selection() {
        let keys = EphemeralKeys::shared().unwrap();
        assert_eq!(keys.public_key_der(256), keys.p256.public_key_der());
        assert_eq!(keys.public_key_der(384), keys.p384.public_key_der());
        assert_eq!(keys.public_key_der(4096), keys.p384.public_key_der());
        assert_ne!(keys.public_key_der(256), keys.public_key_der(384));
    }
}
