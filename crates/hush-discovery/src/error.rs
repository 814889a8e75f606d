//! Discovery error types.

use thiserror::Error;

/// Errors from routing, lookup, and bootstrap operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The target id could not be located among the closest nodes
    #[error("node unreachable: no address known for target")]
    NodeUnreachable,

    /// No usable bootstrap contact succeeded
    #[error("DHT bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// A bootstrap entry carries a malformed public key (hard error)
    #[error("invalid bootstrap public key: {0}")]
    InvalidPublicKey(String),

    /// The routing table has no candidates for a lookup
    #[error("no route in buckets")]
    NoRouteInBuckets,

    /// A single query timed out or failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}
