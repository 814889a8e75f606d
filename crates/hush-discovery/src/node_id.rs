//! Node identity and XOR distance metric.
//!
//! A node's DHT identifier is its 32-byte static public key, used directly
//! in a 256-bit XOR key space. Distance ordering decides bucket placement
//! and lookup convergence.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 256-bit node identifier: the peer's static public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Number of bits in a `NodeId`
    pub const BITS: usize = 256;

    /// Create from a public key.
    #[must_use]
    pub const fn from_public_key(public_key: [u8; 32]) -> Self {
        Self(public_key)
    }

    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another id.
    ///
    /// The XOR metric is symmetric, zero only for identical ids, and
    /// satisfies the triangle inequality, which is what Kademlia routing
    /// relies on.
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Count leading zero bits.
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count.min(Self::BITS)
    }

    /// Bucket index for this id relative to a local id.
    ///
    /// Determined by the first differing bit of the XOR distance.
    /// Returns `None` for identical ids (a node never buckets itself).
    #[must_use]
    pub fn bucket_index(&self, local_id: &NodeId) -> Option<usize> {
        let distance = self.distance(local_id);
        let leading = distance.leading_zeros();
        if leading == Self::BITS {
            None
        } else {
            Some(Self::BITS - 1 - leading)
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_symmetry() {
        let a = NodeId::from_bytes([1u8; 32]);
        let b = NodeId::from_bytes([2u8; 32]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_identity() {
        let id = NodeId::from_bytes([0x5au8; 32]);
        assert_eq!(id.distance(&id), NodeId::from_bytes([0u8; 32]));
    }

    #[test]
    fn test_distance_values() {
        let a = NodeId::from_bytes([1u8; 32]);
        let b = NodeId::from_bytes([2u8; 32]);
        // 1 XOR 2 = 3 in every byte
        assert!(a.distance(&b).as_bytes().iter().all(|&byte| byte == 3));
    }

    #[test]
    fn test_leading_zeros() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1000_0000;
        assert_eq!(NodeId::from_bytes(bytes).leading_zeros(), 0);

        bytes = [0u8; 32];
        bytes[0] = 0b0000_0001;
        assert_eq!(NodeId::from_bytes(bytes).leading_zeros(), 7);

        bytes = [0u8; 32];
        bytes[1] = 0b1000_0000;
        assert_eq!(NodeId::from_bytes(bytes).leading_zeros(), 8);

        assert_eq!(NodeId::from_bytes([0u8; 32]).leading_zeros(), 256);
    }

    #[test]
    fn test_bucket_index() {
        let local = NodeId::from_bytes([0u8; 32]);

        let mut bytes = [0u8; 32];
        bytes[0] = 0b1000_0000;
        assert_eq!(NodeId::from_bytes(bytes).bucket_index(&local), Some(255));

        bytes = [0u8; 32];
        bytes[0] = 0b0100_0000;
        assert_eq!(NodeId::from_bytes(bytes).bucket_index(&local), Some(254));

        bytes = [0u8; 32];
        bytes[31] = 0b0000_0001;
        assert_eq!(NodeId::from_bytes(bytes).bucket_index(&local), Some(0));

        assert_eq!(local.bucket_index(&local), None);
    }

    #[test]
    fn test_bucket_index_every_bucket_reachable() {
        let local = NodeId::from_bytes([0u8; 32]);

        for bucket in 0..256 {
            let byte_index = 31 - (bucket / 8);
            let bit_index = bucket % 8;

            let mut bytes = [0u8; 32];
            bytes[byte_index] = 1 << bit_index;

            assert_eq!(NodeId::from_bytes(bytes).bucket_index(&local), Some(bucket));
        }
    }

    #[test]
    fn test_ordering_is_byte_lexicographic() {
        let small = NodeId::from_bytes([1u8; 32]);
        let large = NodeId::from_bytes([2u8; 32]);
        assert!(small < large);
    }
}
