//! Iterative FIND_NODE lookup.
//!
//! Standard Kademlia node lookup: query the α closest unqueried candidates
//! in parallel, merge their answers into the shortlist, and stop once a
//! round produces nothing strictly closer than the best node seen so far
//! (or after a bounded number of rounds).

use crate::error::DiscoveryError;
use crate::messages::NodeInfo;
use crate::node_id::NodeId;
use crate::routing::K;
use std::collections::HashSet;
use tokio::task::JoinSet;

/// Parallelism factor for iterative lookups.
pub const ALPHA: usize = 3;

/// Upper bound on lookup rounds.
pub const MAX_ROUNDS: usize = 20;

/// Shortlist size kept between rounds.
const SHORTLIST_SIZE: usize = K * 4;

/// A client capable of sending one FIND_NODE query to one peer.
///
/// Implementations authenticate the exchange; a response only reaches the
/// lookup when it decrypted under the queried peer's key.
pub trait LookupClient: Clone + Send + Sync + 'static {
    /// Query `peer` for nodes close to `target`.
    fn query(
        &self,
        peer: NodeInfo,
        target: NodeId,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInfo>, DiscoveryError>> + Send;
}

/// Run an iterative FIND_NODE lookup starting from `seeds`.
///
/// Returns up to [`K`] nodes sorted by XOR distance to `target`. Peers that
/// fail or time out are simply skipped; out-of-order responses are handled
/// by keying results on the queried node.
pub async fn iterative_find_node<C: LookupClient>(
    seeds: Vec<NodeInfo>,
    client: &C,
    target: NodeId,
) -> Vec<NodeInfo> {
    let mut shortlist: Vec<NodeInfo> = Vec::new();
    let mut known: HashSet<NodeId> = HashSet::new();
    for seed in seeds {
        if known.insert(seed.id) {
            shortlist.push(seed);
        }
    }
    sort_by_distance(&mut shortlist, &target);

    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut best = shortlist.first().map(|n| n.id.distance(&target));

    for _round in 0..MAX_ROUNDS {
        let batch: Vec<NodeInfo> = shortlist
            .iter()
            .filter(|n| !queried.contains(&n.id))
            .take(ALPHA)
            .cloned()
            .collect();

        if batch.is_empty() {
            break;
        }

        let mut queries = JoinSet::new();
        for peer in batch {
            queried.insert(peer.id);
            let client = client.clone();
            queries.spawn(async move {
                let peer_id = peer.id;
                (peer_id, client.query(peer, target).await)
            });
        }

        let mut improved = false;
        while let Some(joined) = queries.join_next().await {
            let Ok((peer_id, result)) = joined else {
                continue;
            };

            let nodes = match result {
                Ok(nodes) => nodes,
                Err(e) => {
                    tracing::debug!(peer = %peer_id, error = %e, "lookup query failed");
                    continue;
                }
            };

            for node in nodes {
                if !known.insert(node.id) {
                    continue;
                }
                let dist = node.id.distance(&target);
                if best.as_ref().is_none_or(|b| dist < *b) {
                    best = Some(dist);
                    improved = true;
                }
                shortlist.push(node);
            }
        }

        sort_by_distance(&mut shortlist, &target);
        shortlist.truncate(SHORTLIST_SIZE);

        if !improved {
            break;
        }
    }

    shortlist.truncate(K);
    shortlist
}

fn sort_by_distance(nodes: &mut [NodeInfo], target: &NodeId) {
    nodes.sort_by(|a, b| a.id.distance(target).cmp(&b.id.distance(target)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Static network fixture: every node knows its K closest neighbours.
    #[derive(Clone)]
    struct FixtureNet {
        neighbours: Arc<HashMap<NodeId, Vec<NodeInfo>>>,
    }

    impl LookupClient for FixtureNet {
        async fn query(
            &self,
            peer: NodeInfo,
            _target: NodeId,
        ) -> Result<Vec<NodeInfo>, DiscoveryError> {
            self.neighbours
                .get(&peer.id)
                .cloned()
                .ok_or(DiscoveryError::QueryFailed("unreachable".into()))
        }
    }

    fn node(tag: u8) -> NodeInfo {
        let mut bytes = [0u8; 32];
        bytes[31] = tag;
        NodeInfo {
            id: NodeId::from_bytes(bytes),
            addr: format!("127.0.0.1:{}", 9000 + u16::from(tag)).parse().unwrap(),
        }
    }

    fn build_net(count: u8) -> (FixtureNet, Vec<NodeInfo>) {
        let all: Vec<NodeInfo> = (1..=count).map(node).collect();
        let mut neighbours = HashMap::new();
        for n in &all {
            let mut close: Vec<NodeInfo> = all.iter().filter(|m| m.id != n.id).cloned().collect();
            close.sort_by(|a, b| a.id.distance(&n.id).cmp(&b.id.distance(&n.id)));
            close.truncate(K);
            neighbours.insert(n.id, close);
        }
        (
            FixtureNet {
                neighbours: Arc::new(neighbours),
            },
            all,
        )
    }

    #[tokio::test]
    async fn test_lookup_finds_target() {
        let (net, all) = build_net(60);
        let target = all[40].id;

        // Seed with the three nodes farthest from the target
        let mut seeds = all.clone();
        seeds.sort_by(|a, b| b.id.distance(&target).cmp(&a.id.distance(&target)));
        seeds.truncate(3);

        let found = iterative_find_node(seeds, &net, target).await;
        assert!(found.iter().any(|n| n.id == target));
    }

    #[tokio::test]
    async fn test_lookup_returns_sorted_k() {
        let (net, all) = build_net(60);
        let target = node(200).id;

        let found = iterative_find_node(all[..3].to_vec(), &net, target).await;
        assert!(found.len() <= K);
        for pair in found.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
    }

    #[tokio::test]
    async fn test_lookup_empty_seeds() {
        let (net, _) = build_net(10);
        let found = iterative_find_node(Vec::new(), &net, node(5).id).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_tolerates_failures() {
        let all: Vec<NodeInfo> = (1..=10).map(node).collect();
        // Only the first seed answers; it knows everyone
        let mut neighbours = HashMap::new();
        neighbours.insert(all[0].id, all[1..].to_vec());
        let net = FixtureNet {
            neighbours: Arc::new(neighbours),
        };

        let target = all[9].id;
        let found = iterative_find_node(all[..3].to_vec(), &net, target).await;
        assert!(found.iter().any(|n| n.id == target));
    }
}
