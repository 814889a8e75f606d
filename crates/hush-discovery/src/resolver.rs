//! Friend address resolution.
//!
//! Locates the current network address of a peer identified by its public
//! key. The resolver only performs the lookup; contacting the friend is
//! the transport layer's job.

use crate::error::DiscoveryError;
use crate::lookup::{LookupClient, iterative_find_node};
use crate::messages::NodeInfo;
use crate::node_id::NodeId;
use std::net::SocketAddr;

/// Resolve a friend's address through the DHT.
///
/// Runs FIND_NODE(friend) from the given seeds. Only an exact id match
/// among the returned closest nodes counts; proximity is not presence.
///
/// # Errors
///
/// Returns [`DiscoveryError::NoRouteInBuckets`] when no seeds are
/// available and [`DiscoveryError::NodeUnreachable`] when the lookup
/// converges without finding the exact id.
pub async fn resolve_friend_address<C: LookupClient>(
    seeds: Vec<NodeInfo>,
    client: &C,
    friend: NodeId,
) -> Result<SocketAddr, DiscoveryError> {
    if seeds.is_empty() {
        return Err(DiscoveryError::NoRouteInBuckets);
    }

    let closest = iterative_find_node(seeds, client, friend).await;

    closest
        .iter()
        .find(|n| n.id == friend)
        .map(|n| n.addr)
        .ok_or(DiscoveryError::NodeUnreachable)
}
