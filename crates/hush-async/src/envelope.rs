//! Pre-key sealed envelopes.
//!
//! Each offline message is sealed under a one-time key derived from an
//! ephemeral DH against one of the recipient's published pre-keys. The
//! envelope header names the pre-key id so the recipient knows which
//! secret to consume; an unknown or already-spent id simply fails to open.

use crate::error::AsyncError;
use crate::padding;
use hush_crypto::aead::{AeadKey, Nonce};
use hush_crypto::hash::hkdf;
use hush_crypto::prekey::{PreKeyPool, PreKeyRecord};
use hush_crypto::x25519::{PrivateKey, PublicKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

/// HKDF info label for the one-time envelope key.
const ENVELOPE_INFO: &[u8] = b"hush/async-envelope";

/// A sealed offline message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Which of the recipient's pre-keys the sender consumed
    pub prekey_id: u32,
    /// Sender's per-message ephemeral public key
    pub ephemeral_public: [u8; 32],
    /// AEAD nonce (the key is one-time, so any nonce value is safe)
    pub nonce: [u8; 12],
    /// AEAD ciphertext over the padded plaintext
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialize for relay storage.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>, AsyncError> {
        bincode::serialize(self).map_err(|e| AsyncError::Malformed(e.to_string()))
    }

    /// Parse from relay storage.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, AsyncError> {
        bincode::deserialize(bytes).map_err(|e| AsyncError::Malformed(e.to_string()))
    }
}

/// Seal a plaintext against one of the recipient's pre-keys.
///
/// The plaintext is padded to a standard bucket before sealing, so the
/// ciphertext length reveals only the bucket.
///
/// # Errors
///
/// Returns [`AsyncError::Envelope`] on DH or AEAD failure and
/// [`AsyncError::Malformed`] for oversized plaintexts.
pub fn seal_envelope(prekey: &PreKeyRecord, plaintext: &[u8]) -> Result<Envelope, AsyncError> {
    let padded = padding::pad(plaintext)?;

    let ephemeral = PrivateKey::generate(&mut OsRng);
    let ephemeral_public = ephemeral.public_key().to_bytes();

    let recipient_public = PublicKey::from_bytes(prekey.public);
    let shared = ephemeral
        .exchange(&recipient_public)
        .ok_or(hush_crypto::CryptoError::EncryptionFailed)?;

    let key = derive_envelope_key(&ephemeral_public, shared.as_bytes());

    let mut nonce = [0u8; 12];
    hush_crypto::random::fill_random(&mut nonce)?;

    let ciphertext = AeadKey::new(key).seal(&Nonce::from_bytes(nonce), &padded, &[])?;

    Ok(Envelope {
        prekey_id: prekey.id,
        ephemeral_public,
        nonce,
        ciphertext,
    })
}

/// Open an envelope, consuming the named pre-key from the pool.
///
/// The named pre-key is consumed whether or not the envelope
/// authenticates; ids are only learned from real envelopes, and a key
/// that has seen a bad envelope is no longer trustworthy as one-time.
///
/// # Errors
///
/// Returns [`AsyncError::Envelope`] for unknown pre-key ids, DH failures,
/// or authentication failures, and [`AsyncError::Malformed`] for
/// inconsistent padding.
pub fn open_offline_message(pool: &mut PreKeyPool, envelope: &Envelope) -> Result<Vec<u8>, AsyncError> {
    let secret = pool
        .take(envelope.prekey_id)
        .ok_or(hush_crypto::CryptoError::BadMac)?;

    let ephemeral_public = PublicKey::from_bytes(envelope.ephemeral_public);
    let shared = match secret.exchange(&ephemeral_public) {
        Some(shared) => shared,
        None => return Err(AsyncError::Envelope(hush_crypto::CryptoError::BadMac)),
    };

    let key = derive_envelope_key(&envelope.ephemeral_public, shared.as_bytes());
    let padded = AeadKey::new(key).open(
        &Nonce::from_bytes(envelope.nonce),
        &envelope.ciphertext,
        &[],
    )?;

    padding::unpad(&padded)
}

fn derive_envelope_key(ephemeral_public: &[u8; 32], shared: &[u8; 32]) -> [u8; 32] {
    let mut key = [0u8; 32];
    hkdf(ephemeral_public, shared, ENVELOPE_INFO, &mut key);
    key
}
