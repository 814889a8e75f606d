//! Store-and-forward error types.

use thiserror::Error;

/// Errors from the async delivery layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AsyncError {
    /// The sender's stock of the recipient's pre-keys is below minimum
    #[error("no pre-keys available for recipient")]
    NoPreKeys,

    /// No relay accepted the message
    #[error("no storage nodes reachable")]
    NoStorageNodes,

    /// Message epoch outside the acceptance window
    #[error("stale epoch")]
    StaleEpoch,

    /// The async layer is not running (e.g. transport disabled)
    #[error("async delivery unavailable")]
    AsyncUnavailable,

    /// Envelope could not be sealed or opened
    #[error("envelope error: {0}")]
    Envelope(#[from] hush_crypto::CryptoError),

    /// Unparseable envelope or request
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A relay refused or failed a request
    #[error("relay error: {0}")]
    Relay(String),
}
