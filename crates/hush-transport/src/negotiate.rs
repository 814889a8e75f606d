//! Protocol version and cipher-suite negotiation.
//!
//! On first contact each side advertises a capability set. The selected
//! version is the highest common one; the selected cipher suite is the
//! initiator's preferred choice among those the responder supports. An
//! empty version intersection falls back to the floor version when both
//! sides permit legacy operation, and fails otherwise.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest version a legacy fallback may select.
pub const FLOOR_VERSION: u32 = 1;

/// Cipher suites a node may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherSuite {
    /// ChaCha20-Poly1305 with 96-bit nonces
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 with 192-bit nonces
    XChaCha20Poly1305,
}

/// One side's advertised capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// Minimum version accepted
    pub min_version: u32,
    /// Maximum version supported
    pub max_version: u32,
    /// Suite this side prefers
    pub preferred_suite: CipherSuite,
    /// All suites this side supports
    pub suites: Vec<CipherSuite>,
    /// Whether the floor-version fallback is acceptable
    pub legacy_fallback: bool,
}

impl CapabilitySet {
    /// Capabilities for the current build with a configured floor.
    #[must_use]
    pub fn current(min_version: u32, legacy_fallback: bool) -> Self {
        Self {
            min_version,
            max_version: PROTOCOL_VERSION,
            preferred_suite: CipherSuite::ChaCha20Poly1305,
            suites: vec![CipherSuite::ChaCha20Poly1305, CipherSuite::XChaCha20Poly1305],
            legacy_fallback,
        }
    }

    /// Serialize for the capabilities packet.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Malformed`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>, NegotiationError> {
        bincode::serialize(self).map_err(|e| NegotiationError::Malformed(e.to_string()))
    }

    /// Parse a received capabilities packet.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Malformed`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, NegotiationError> {
        bincode::deserialize(bytes).map_err(|e| NegotiationError::Malformed(e.to_string()))
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Agreed protocol version
    pub version: u32,
    /// Agreed cipher suite
    pub suite: CipherSuite,
    /// Whether the legacy floor fallback was taken
    pub legacy: bool,
}

/// Negotiation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// No common version or suite and no permissible fallback
    #[error("protocol incompatible")]
    ProtocolIncompatible,

    /// Unparseable capability payload
    #[error("malformed capabilities: {0}")]
    Malformed(String),
}

/// Select version and suite between an initiator and a responder.
///
/// # Errors
///
/// Returns [`NegotiationError::ProtocolIncompatible`] when the version
/// windows do not intersect and legacy fallback is not enabled on both
/// sides, or when no common cipher suite exists.
pub fn negotiate(
    initiator: &CapabilitySet,
    responder: &CapabilitySet,
) -> Result<Negotiated, NegotiationError> {
    let suite = select_suite(initiator, responder)?;

    let low = initiator.min_version.max(responder.min_version);
    let high = initiator.max_version.min(responder.max_version);

    if low <= high {
        return Ok(Negotiated {
            version: high,
            suite,
            legacy: false,
        });
    }

    if initiator.legacy_fallback && responder.legacy_fallback {
        return Ok(Negotiated {
            version: FLOOR_VERSION,
            suite,
            legacy: true,
        });
    }

    Err(NegotiationError::ProtocolIncompatible)
}

fn select_suite(
    initiator: &CapabilitySet,
    responder: &CapabilitySet,
) -> Result<CipherSuite, NegotiationError> {
    if responder.suites.contains(&initiator.preferred_suite) {
        return Ok(initiator.preferred_suite);
    }

    initiator
        .suites
        .iter()
        .find(|suite| responder.suites.contains(suite))
        .copied()
        .ok_or(NegotiationError::ProtocolIncompatible)
}
