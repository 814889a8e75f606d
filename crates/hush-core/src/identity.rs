//! Node identity: long-term keypair plus nospam.
//!
//! The identity is an X25519 static keypair used for Noise-IK handshakes
//! and DHT sealing, plus a 4-byte nospam salt that lets the user rotate
//! the advertised address without changing the keypair. An Ed25519
//! signing key for pre-key batches is derived deterministically from the
//! static secret, so savedata only ever persists one secret.

use crate::PublicKey;
use crate::error::{Error, Result};
use crate::toxid::ToxId;
use hush_crypto::noise::StaticKeypair;
use hush_crypto::signatures::SigningKey;
use zeroize::Zeroize;

/// Domain label for deriving the signing seed from the static secret.
const SIGNING_SEED_LABEL: &[u8] = b"hush/identity-sign";

/// The node's cryptographic identity.
pub struct Identity {
    static_keys: StaticKeypair,
    signing: SigningKey,
    nospam: [u8; 4],
}

impl Identity {
    /// Generate a fresh identity with a non-zero nospam.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadMac`]-mapped crypto failures if key generation
    /// fails.
    pub fn generate() -> Result<Self> {
        let static_keys = StaticKeypair::generate().map_err(Error::from)?;
        let nospam = hush_crypto::random::random_nonzero_u32()
            .map_err(Error::from)?
            .to_be_bytes();

        Ok(Self::assemble(static_keys, nospam))
    }

    /// Rebuild an identity from savedata.
    ///
    /// A zero nospam (older savedata without the field) is replaced with
    /// a fresh non-zero one.
    ///
    /// # Errors
    ///
    /// Propagates CSPRNG failure when a replacement nospam is needed.
    pub fn from_secret(secret: [u8; 32], nospam: [u8; 4]) -> Result<Self> {
        let static_keys = StaticKeypair::from_private(secret);
        let nospam = if nospam == [0u8; 4] {
            hush_crypto::random::random_nonzero_u32()
                .map_err(Error::from)?
                .to_be_bytes()
        } else {
            nospam
        };

        Ok(Self::assemble(static_keys, nospam))
    }

    fn assemble(static_keys: StaticKeypair, nospam: [u8; 4]) -> Self {
        let mut seed_input = Vec::with_capacity(32 + SIGNING_SEED_LABEL.len());
        seed_input.extend_from_slice(static_keys.private_key());
        seed_input.extend_from_slice(SIGNING_SEED_LABEL);
        let mut seed = hush_crypto::hash::hash(&seed_input);
        seed_input.zeroize();

        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();

        Self {
            static_keys,
            signing,
            nospam,
        }
    }

    /// The long-term public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        *self.static_keys.public_key()
    }

    /// The static keypair for handshakes.
    #[must_use]
    pub fn static_keys(&self) -> &StaticKeypair {
        &self.static_keys
    }

    /// Raw secret bytes, for savedata only.
    #[must_use]
    pub fn secret_key(&self) -> [u8; 32] {
        let mut secret = [0u8; 32];
        secret.copy_from_slice(self.static_keys.private_key());
        secret
    }

    /// The derived Ed25519 signing key.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Current nospam.
    #[must_use]
    pub fn nospam(&self) -> [u8; 4] {
        self.nospam
    }

    /// Rotate the nospam, invalidating the previously advertised address.
    pub fn set_nospam(&mut self, nospam: [u8; 4]) {
        self.nospam = nospam;
    }

    /// The current full address.
    #[must_use]
    pub fn tox_id(&self) -> ToxId {
        ToxId::new(self.public_key(), self.nospam)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(&self.public_key()[..8]))
            .field("nospam", &hex::encode(self.nospam))
            .finish()
    }
}
