//! Per-epoch recipient pseudonyms.
//!
//! A pseudonym is derived by HKDF from the recipient's public key and the
//! epoch, so only parties who already know the recipient's key can compute
//! it. Relays index stored messages by pseudonym and learn nothing about
//! the recipient behind it; distinct epochs yield unlinkable pseudonyms.

use hush_crypto::constant_time;
use hush_crypto::hash::hkdf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// HKDF info label for pseudonym derivation.
const PSEUDONYM_INFO: &[u8] = b"toxasync-pseudo";

/// A 32-byte per-(recipient, epoch) identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pseudonym([u8; 32]);

impl Pseudonym {
    /// Derive the pseudonym for a recipient in an epoch.
    ///
    /// Pure function: sender and recipient independently compute the same
    /// value.
    #[must_use]
    pub fn derive(recipient_public: &[u8; 32], epoch: u64) -> Self {
        let mut out = [0u8; 32];
        hkdf(
            recipient_public,
            &epoch.to_be_bytes(),
            PSEUDONYM_INFO,
            &mut out,
        );
        Self(out)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Construct from raw bytes (wire decode).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Constant-time equality, for relay-side lookups on attacker-supplied
    /// pseudonyms.
    #[must_use]
    pub fn ct_matches(&self, other: &Pseudonym) -> bool {
        constant_time::verify_32(&self.0, &other.0)
    }
}

impl fmt::Debug for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0[..8].iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "Pseudonym({prefix})")
    }
}
