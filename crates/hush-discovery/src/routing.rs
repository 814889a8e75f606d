//! K-bucket routing table.
//!
//! The 256-bit key space is realized as a flat array of 256 buckets indexed
//! by the position of the first bit differing from the local id (the fully
//! split form of the Kademlia prefix trie). Each bucket holds up to k=8
//! nodes ordered most-recently-seen first, plus a small replacement cache
//! that feeds the bucket when a resident node goes dead.

use crate::node_id::NodeId;
use std::net::SocketAddr;

/// Bucket capacity.
pub const K: usize = 8;

/// Number of buckets (one per possible first-differing-bit position).
pub const NUM_BUCKETS: usize = 256;

/// Replacement cache capacity per bucket.
pub const REPLACEMENT_CACHE_SIZE: usize = 4;

/// Failure count at which a node is considered dead.
pub const MAX_FAILURES: u32 = 4;

/// Window within which a node's last contact counts as fresh.
pub const NODE_FRESHNESS_SECS: u64 = 300;

/// A routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtNode {
    /// The node's identifier (its public key)
    pub id: NodeId,
    /// Last known UDP address
    pub addr: SocketAddr,
    /// UNIX seconds of the last successful contact
    pub last_seen: u64,
    /// Consecutive failed contact attempts
    pub failed_count: u32,
}

impl DhtNode {
    /// Create a freshly seen entry.
    #[must_use]
    pub fn new(id: NodeId, addr: SocketAddr, now: u64) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            failed_count: 0,
        }
    }

    /// A node is live while recently seen and not failing.
    #[must_use]
    pub fn is_live(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) <= NODE_FRESHNESS_SECS && self.failed_count < MAX_FAILURES
    }
}

/// Result of an insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New node stored in its bucket
    Inserted,
    /// Node was already present; address and freshness updated
    Refreshed,
    /// Bucket full of live nodes; newcomer went to the replacement cache.
    /// The least-recently-seen resident should be pinged; if it fails out,
    /// the cache promotes.
    Cached {
        /// Resident worth probing for liveness
        ping_candidate: NodeId,
    },
    /// The local node's own id is never stored
    RejectedSelf,
}

/// One k-bucket with its replacement cache.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    /// Resident nodes, most-recently-seen first
    nodes: Vec<DhtNode>,
    /// Overflow candidates, newest last
    cache: Vec<DhtNode>,
    /// Last time this bucket saw any traffic
    last_touched: u64,
}

impl KBucket {
    /// Resident nodes, most-recently-seen first.
    #[must_use]
    pub fn nodes(&self) -> &[DhtNode] {
        &self.nodes
    }

    /// Number of residents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the bucket has no residents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn touch(&mut self, now: u64) {
        self.last_touched = self.last_touched.max(now);
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == *id)
    }

    fn cache_push(&mut self, node: DhtNode) {
        self.cache.retain(|n| n.id != node.id);
        if self.cache.len() >= REPLACEMENT_CACHE_SIZE {
            self.cache.remove(0);
        }
        self.cache.push(node);
    }
}

/// The full routing table.
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create an empty table for the given local id.
    #[must_use]
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            buckets: vec![KBucket::default(); NUM_BUCKETS],
        }
    }

    /// The local node's id.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Insert or refresh a contact.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr, now: u64) -> InsertOutcome {
        let Some(index) = id.bucket_index(&self.local) else {
            return InsertOutcome::RejectedSelf;
        };

        let bucket = &mut self.buckets[index];
        bucket.touch(now);

        if let Some(pos) = bucket.position(&id) {
            let mut node = bucket.nodes.remove(pos);
            node.addr = addr;
            node.last_seen = now;
            node.failed_count = 0;
            bucket.nodes.insert(0, node);
            return InsertOutcome::Refreshed;
        }

        if bucket.nodes.len() < K {
            bucket.nodes.insert(0, DhtNode::new(id, addr, now));
            return InsertOutcome::Inserted;
        }

        // Bucket full: a dead resident makes room immediately
        if let Some(dead_pos) = bucket.nodes.iter().position(|n| !n.is_live(now)) {
            bucket.nodes.remove(dead_pos);
            bucket.nodes.insert(0, DhtNode::new(id, addr, now));
            return InsertOutcome::Inserted;
        }

        // All residents live: cache the newcomer, nominate the
        // least-recently-seen resident for a liveness probe
        let candidate = bucket.nodes.last().map(|n| n.id).unwrap_or(id);
        bucket.cache_push(DhtNode::new(id, addr, now));
        InsertOutcome::Cached {
            ping_candidate: candidate,
        }
    }

    /// Mark a successful contact with a known node.
    pub fn record_seen(&mut self, id: &NodeId, now: u64) {
        let Some(index) = id.bucket_index(&self.local) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        bucket.touch(now);
        if let Some(pos) = bucket.position(id) {
            let mut node = bucket.nodes.remove(pos);
            node.last_seen = now;
            node.failed_count = 0;
            bucket.nodes.insert(0, node);
        }
    }

    /// Record a failed contact attempt.
    ///
    /// At [`MAX_FAILURES`] the node is evicted and the freshest replacement
    /// cache entry is promoted in its place. Returns the promoted id, if
    /// any.
    pub fn record_failure(&mut self, id: &NodeId) -> Option<NodeId> {
        let index = id.bucket_index(&self.local)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.position(id)?;

        bucket.nodes[pos].failed_count += 1;
        if bucket.nodes[pos].failed_count < MAX_FAILURES {
            return None;
        }

        bucket.nodes.remove(pos);
        let promoted = bucket.cache.pop()?;
        let promoted_id = promoted.id;
        bucket.nodes.push(promoted);
        Some(promoted_id)
    }

    /// Remove a node outright.
    pub fn remove(&mut self, id: &NodeId) {
        if let Some(index) = id.bucket_index(&self.local) {
            let bucket = &mut self.buckets[index];
            bucket.nodes.retain(|n| n.id != *id);
            bucket.cache.retain(|n| n.id != *id);
        }
    }

    /// Look up a resident node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&DhtNode> {
        let index = id.bucket_index(&self.local)?;
        self.buckets[index].nodes.iter().find(|n| n.id == *id)
    }

    /// The `count` nodes closest to `target` by XOR distance.
    ///
    /// Ties (which require equal ids and so cannot occur between distinct
    /// nodes) fall back to last-seen freshness, newest first.
    #[must_use]
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<DhtNode> {
        let mut all: Vec<DhtNode> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().cloned())
            .collect();

        all.sort_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then(b.last_seen.cmp(&a.last_seen))
        });
        all.truncate(count);
        all
    }

    /// Total resident nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// Bucket indices that have seen no traffic within `interval` seconds
    /// and contain at least one node.
    #[must_use]
    pub fn stale_buckets(&self, now: u64, interval: u64) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && now.saturating_sub(b.last_touched) > interval)
            .map(|(i, _)| i)
            .collect()
    }

    /// A random id falling into the given bucket, for refresh lookups.
    ///
    /// Built by copying the local id down to the bucket's distinguishing
    /// bit, flipping that bit, and randomizing everything below it.
    ///
    /// # Errors
    ///
    /// Propagates CSPRNG failure.
    pub fn random_id_in_bucket(&self, index: usize) -> Result<NodeId, hush_crypto::CryptoError> {
        let random = hush_crypto::random::random_32()?;
        let mut bytes = *self.local.as_bytes();

        // Bit `index` counted from the least significant end of the id
        let flip_byte = 31 - index / 8;
        let flip_bit = index % 8;

        // Randomize all bits strictly below the distinguishing bit
        for i in (flip_byte + 1)..32 {
            bytes[i] = random[i];
        }
        let low_mask = (1u8 << flip_bit) - 1;
        bytes[flip_byte] = (bytes[flip_byte] & !low_mask) | (random[flip_byte] & low_mask);

        // Flip the distinguishing bit itself
        bytes[flip_byte] ^= 1 << flip_bit;

        Ok(NodeId::from_bytes(bytes))
    }

    /// Iterate all resident nodes.
    pub fn iter_nodes(&self) -> impl Iterator<Item = &DhtNode> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    /// Access a bucket directly (tests and diagnostics).
    #[must_use]
    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }
}
