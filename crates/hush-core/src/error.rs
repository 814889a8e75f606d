//! The node's closed error taxonomy.
//!
//! Callers match on variants, never on strings. Category predicates feed
//! the retry scheduler: validation and state errors surface immediately,
//! transient transport errors enter backoff.

use thiserror::Error;

/// Errors surfaced by node operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // ============ Validation ============
    /// Message is empty
    #[error("message is empty")]
    EmptyMessage,

    /// Message exceeds the byte limit
    #[error("message too long")]
    MessageTooLong,

    /// Name exceeds the byte limit
    #[error("name too long")]
    NameTooLong,

    /// Status message exceeds the byte limit
    #[error("status message too long")]
    StatusMessageTooLong,

    /// Malformed address string, bad checksum, or stale nospam
    #[error("invalid HUSH address")]
    InvalidToxId,

    /// Malformed public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Rejected network address
    #[error("invalid network address")]
    InvalidAddress,

    // ============ State ============
    /// No friend with that id or key
    #[error("friend not found")]
    FriendNotFound,

    /// Friend already present
    #[error("friend already exists")]
    FriendAlreadyExists,

    /// Operation requires the friend to be online
    #[error("friend is offline")]
    FriendOffline,

    /// The node has been killed
    #[error("node is not running")]
    NotRunning,

    /// A session operation conflicts with an established session
    #[error("session busy")]
    SessionBusy,

    // ============ Crypto / session ============
    /// Record or handshake authentication failed
    #[error("authentication failed")]
    BadMac,

    /// Handshake replay detected
    #[error("handshake replay detected")]
    ReplayDetected,

    /// Handshake timestamp outside the freshness window
    #[error("handshake timestamp stale")]
    StaleTimestamp,

    /// Record counter outside the receive window
    #[error("record outside receive window")]
    OutOfWindow,

    /// Handshake did not complete in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Version or cipher negotiation found no common ground
    #[error("protocol incompatible")]
    ProtocolIncompatible,

    // ============ Routing ============
    /// Peer address could not be resolved
    #[error("node unreachable")]
    NodeUnreachable,

    /// Bootstrap failed against every configured contact
    #[error("DHT bootstrap failed")]
    DhtBootstrapFailed,

    /// Routing table has no usable contacts
    #[error("no route in buckets")]
    NoRouteInBuckets,

    // ============ Transport ============
    /// No transport is available for the destination
    #[error("transport unavailable")]
    TransportUnavailable,

    /// Transport write queue is full
    #[error("transport backpressure")]
    Backpressure,

    /// Send failed at the transport layer
    #[error("send failed")]
    SendFailed,

    /// Retries exhausted without an acknowledged delivery
    #[error("delivery failed")]
    DeliveryFailed,

    // ============ Async ============
    /// No pre-keys available for the recipient
    #[error("no pre-keys for recipient")]
    NoPreKeys,

    /// No relay storage node accepted the message
    #[error("no storage nodes")]
    NoStorageNodes,

    /// Message epoch outside the acceptance window
    #[error("stale epoch")]
    StaleEpoch,

    /// Async layer not running
    #[error("async delivery unavailable")]
    AsyncUnavailable,

    // ============ Persistence ============
    /// Savedata failed to parse
    #[error("savedata corrupt")]
    SavedataCorrupt,

    /// Savedata version not understood
    #[error("savedata version unsupported")]
    SavedataVersionUnsupported,
}

impl Error {
    /// Whether this is an input-validation error.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyMessage
                | Error::MessageTooLong
                | Error::NameTooLong
                | Error::StatusMessageTooLong
                | Error::InvalidToxId
                | Error::InvalidPublicKey
                | Error::InvalidAddress
        )
    }

    /// Whether a retry with backoff may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Backpressure
                | Error::SendFailed
                | Error::NodeUnreachable
                | Error::HandshakeTimeout
                | Error::TransportUnavailable
        )
    }
}

impl From<hush_crypto::CryptoError> for Error {
    fn from(err: hush_crypto::CryptoError) -> Self {
        use hush_crypto::CryptoError;
        match err {
            CryptoError::BadMac
            | CryptoError::EncryptionFailed
            | CryptoError::InvalidSignature
            | CryptoError::InvalidKeyLength { .. } => Error::BadMac,
            CryptoError::ReplayDetected => Error::ReplayDetected,
            CryptoError::StaleTimestamp => Error::StaleTimestamp,
            CryptoError::OutOfWindow => Error::OutOfWindow,
            CryptoError::Handshake(_) | CryptoError::InvalidState => Error::SessionBusy,
            CryptoError::RandomFailed | CryptoError::CounterExhausted => Error::SendFailed,
        }
    }
}

impl From<hush_discovery::DiscoveryError> for Error {
    fn from(err: hush_discovery::DiscoveryError) -> Self {
        use hush_discovery::DiscoveryError;
        match err {
            DiscoveryError::NodeUnreachable => Error::NodeUnreachable,
            DiscoveryError::BootstrapFailed(_) => Error::DhtBootstrapFailed,
            DiscoveryError::InvalidPublicKey(_) => Error::InvalidPublicKey,
            DiscoveryError::NoRouteInBuckets => Error::NoRouteInBuckets,
            DiscoveryError::QueryFailed(_) => Error::NodeUnreachable,
        }
    }
}

impl From<hush_transport::TransportError> for Error {
    fn from(err: hush_transport::TransportError) -> Self {
        use hush_transport::TransportError;
        match err {
            TransportError::Closed | TransportError::BindFailed(_) => Error::TransportUnavailable,
            TransportError::InvalidAddress(_) => Error::InvalidAddress,
            TransportError::Io(_)
            | TransportError::PayloadTooLarge(_)
            | TransportError::MalformedPacket(_) => Error::SendFailed,
        }
    }
}

impl From<hush_async::AsyncError> for Error {
    fn from(err: hush_async::AsyncError) -> Self {
        use hush_async::AsyncError;
        match err {
            AsyncError::NoPreKeys => Error::NoPreKeys,
            AsyncError::NoStorageNodes => Error::NoStorageNodes,
            AsyncError::StaleEpoch => Error::StaleEpoch,
            AsyncError::AsyncUnavailable => Error::AsyncUnavailable,
            AsyncError::Envelope(e) => e.into(),
            AsyncError::Malformed(_) | AsyncError::Relay(_) => Error::SendFailed,
        }
    }
}

impl From<hush_transport::negotiate::NegotiationError> for Error {
    fn from(err: hush_transport::negotiate::NegotiationError) -> Self {
        use hush_transport::negotiate::NegotiationError;
        match err {
            NegotiationError::ProtocolIncompatible | NegotiationError::Malformed(_) => {
                Error::ProtocolIncompatible
            }
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;
