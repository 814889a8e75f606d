//! `ChaCha20-Poly1305` AEAD encryption.
//!
//! Record-layer nonces are deterministic (derived from the send counter);
//! envelope encryption in the async layer carries an explicit random nonce
//! alongside a one-time key.

use crate::{AEAD_NONCE_SIZE, CryptoError};
use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 96-bit AEAD nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; AEAD_NONCE_SIZE]);

impl Nonce {
    /// Build a nonce from a 64-bit record counter.
    ///
    /// Layout: 4 zero bytes followed by the counter big-endian. Send and
    /// receive directions use distinct keys, so counters may overlap across
    /// directions without nonce reuse.
    #[must_use]
    pub fn from_counter(counter: u64) -> Self {
        let mut bytes = [0u8; AEAD_NONCE_SIZE];
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    /// Build a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; AEAD_NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; AEAD_NONCE_SIZE] {
        &self.0
    }
}

/// A 256-bit AEAD key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Seal plaintext with the given nonce and associated data.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new((&self.0).into());
        cipher
            .encrypt(nonce.as_bytes().into(), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open ciphertext with the given nonce and associated data.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadMac`] if authentication fails.
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(nonce.as_bytes().into(), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::BadMac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = AeadKey::new([0x42u8; 32]);
        let nonce = Nonce::from_counter(7);
        let plaintext = b"direct message payload";
        let aad = b"packet header";

        let ciphertext = key.seal(&nonce, plaintext, aad).unwrap();
        let decrypted = key.open(&nonce, &ciphertext, aad).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_tamper_detection() {
        let key = AeadKey::new([0x42u8; 32]);
        let nonce = Nonce::from_counter(0);

        let mut ciphertext = key.seal(&nonce, b"payload", b"").unwrap();
        ciphertext[0] ^= 0xFF;

        assert_eq!(key.open(&nonce, &ciphertext, b""), Err(CryptoError::BadMac));
    }

    #[test]
    fn test_aad_mismatch_rejected() {
        let key = AeadKey::new([0x42u8; 32]);
        let nonce = Nonce::from_counter(0);

        let ciphertext = key.seal(&nonce, b"payload", b"aad-1").unwrap();
        assert!(key.open(&nonce, &ciphertext, b"aad-2").is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = AeadKey::new([0x42u8; 32]);
        let other = AeadKey::new([0x43u8; 32]);
        let nonce = Nonce::from_counter(0);

        let ciphertext = key.seal(&nonce, b"payload", b"").unwrap();
        assert!(other.open(&nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_nonce_counter_layout() {
        let nonce = Nonce::from_counter(0x0102_0304_0506_0708);
        assert_eq!(&nonce.as_bytes()[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce.as_bytes()[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
