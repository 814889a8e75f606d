//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD authentication failure
    #[error("record authentication failed")]
    BadMac,

    /// Record counter outside the sliding receive window
    #[error("record counter outside receive window")]
    OutOfWindow,

    /// Handshake nonce already seen within the freshness window
    #[error("handshake replay detected")]
    ReplayDetected,

    /// Handshake timestamp outside the freshness window
    #[error("handshake timestamp stale")]
    StaleTimestamp,

    /// Noise handshake error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Operation not valid in the current handshake or session state
    #[error("invalid state for operation")]
    InvalidState,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid signature encoding or verification failure
    #[error("invalid signature")]
    InvalidSignature,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Send counter exhausted, rekey required before further sends
    #[error("record counter exhausted, rekey required")]
    CounterExhausted,
}
