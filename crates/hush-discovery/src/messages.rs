//! DHT wire payloads.
//!
//! The transport layer owns the 1-byte packet type tag; these helpers
//! encode and decode the payload that follows it. Ping payloads are raw
//! 8-byte nonces, FIND_NODE requests are the raw 32-byte target, and
//! FIND_NODE responses are a bincode-encoded node list.

use crate::error::DiscoveryError;
use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A node's id and last known address, as carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node's identifier (its public key)
    pub id: NodeId,
    /// Reachable UDP address
    pub addr: SocketAddr,
}

/// A decoded DHT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtMessage {
    /// Liveness probe
    PingRequest {
        /// Echo nonce
        nonce: [u8; 8],
    },
    /// Liveness probe answer
    PingResponse {
        /// Echoed nonce
        nonce: [u8; 8],
    },
    /// Request for nodes close to a target
    FindNodeRequest {
        /// Lookup target
        target: NodeId,
    },
    /// Up to k nodes close to the requested target
    FindNodeResponse {
        /// Closest known nodes
        nodes: Vec<NodeInfo>,
    },
}

/// Encode a ping payload (request or response): the raw nonce.
#[must_use]
pub fn encode_ping(nonce: [u8; 8]) -> Vec<u8> {
    nonce.to_vec()
}

/// Decode a ping payload.
///
/// # Errors
///
/// Returns [`DiscoveryError::QueryFailed`] if the payload is not 8 bytes.
pub fn decode_ping(payload: &[u8]) -> Result<[u8; 8], DiscoveryError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| DiscoveryError::QueryFailed("bad ping payload length".into()))?;
    Ok(bytes)
}

/// Encode a FIND_NODE request payload: the raw 32-byte target.
#[must_use]
pub fn encode_find_node_request(target: &NodeId) -> Vec<u8> {
    target.as_bytes().to_vec()
}

/// Decode a FIND_NODE request payload.
///
/// # Errors
///
/// Returns [`DiscoveryError::QueryFailed`] if the payload is not 32 bytes.
pub fn decode_find_node_request(payload: &[u8]) -> Result<NodeId, DiscoveryError> {
    let bytes: [u8; 32] = payload
        .try_into()
        .map_err(|_| DiscoveryError::QueryFailed("bad find_node target length".into()))?;
    Ok(NodeId::from_bytes(bytes))
}

/// Encode a FIND_NODE response payload.
///
/// # Errors
///
/// Returns [`DiscoveryError::QueryFailed`] on serialization failure.
pub fn encode_find_node_response(nodes: &[NodeInfo]) -> Result<Vec<u8>, DiscoveryError> {
    bincode::serialize(nodes).map_err(|e| DiscoveryError::QueryFailed(e.to_string()))
}

/// Decode a FIND_NODE response payload.
///
/// # Errors
///
/// Returns [`DiscoveryError::QueryFailed`] on malformed input.
pub fn decode_find_node_response(payload: &[u8]) -> Result<Vec<NodeInfo>, DiscoveryError> {
    bincode::deserialize(payload).map_err(|e| DiscoveryError::QueryFailed(e.to_string()))
}
