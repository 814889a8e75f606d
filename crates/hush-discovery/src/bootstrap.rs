//! Cryptographically verified bootstrap.
//!
//! Bootstrap entries pair an address (possibly a DNS name) with the
//! contact's public key. A contact only enters the routing table after an
//! authenticated exchange under that configured key, so a hijacked address
//! cannot seed the table with attacker nodes.
//!
//! Failure severity is split: a malformed public key in configuration is a
//! hard error returned to the caller, while DNS or network failures are
//! soft (logged and retried on the maintenance schedule).

use crate::error::DiscoveryError;
use crate::lookup::{LookupClient, iterative_find_node};
use crate::messages::NodeInfo;
use crate::node_id::NodeId;
use std::net::SocketAddr;

/// One configured bootstrap contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapEntry {
    /// The contact's public key; the first exchange must authenticate under it
    pub public_key: NodeId,
    /// Address, either `ip:port` or `host:port`
    pub addr: String,
}

impl BootstrapEntry {
    /// Parse an entry from a hex public key and an address string.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidPublicKey`] for malformed keys.
    /// This is configuration, so it is a hard error.
    pub fn parse(public_key_hex: &str, addr: &str) -> Result<Self, DiscoveryError> {
        let bytes = hex::decode(public_key_hex)
            .map_err(|_| DiscoveryError::InvalidPublicKey(public_key_hex.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DiscoveryError::InvalidPublicKey(public_key_hex.to_string()))?;

        Ok(Self {
            public_key: NodeId::from_bytes(key),
            addr: addr.to_string(),
        })
    }

    /// Resolve the address, possibly via DNS.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::QueryFailed`] on resolution failure. This
    /// is a soft error: log and retry later.
    pub async fn resolve(&self) -> Result<SocketAddr, DiscoveryError> {
        let mut addrs = tokio::net::lookup_host(&self.addr)
            .await
            .map_err(|e| DiscoveryError::QueryFailed(format!("resolve {}: {e}", self.addr)))?;
        addrs
            .next()
            .ok_or_else(|| DiscoveryError::QueryFailed(format!("no address for {}", self.addr)))
    }
}

/// The configured bootstrap list.
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    /// Seed contacts
    pub entries: Vec<BootstrapEntry>,
}

impl BootstrapConfig {
    /// Empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn push(&mut self, entry: BootstrapEntry) {
        self.entries.push(entry);
    }
}

/// Contact the bootstrap set and run a self-lookup through it.
///
/// Each entry is resolved and queried with FIND_NODE(self); resolution or
/// network failures are logged and skipped. The reachable contacts then
/// seed an iterative self-lookup whose results populate the caller's
/// routing table.
///
/// # Errors
///
/// Returns [`DiscoveryError::BootstrapFailed`] when no contact succeeded.
pub async fn run_bootstrap<C: LookupClient>(
    config: &BootstrapConfig,
    client: &C,
    self_id: NodeId,
) -> Result<Vec<NodeInfo>, DiscoveryError> {
    let mut seeds = Vec::new();

    for entry in &config.entries {
        let addr = match entry.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(addr = %entry.addr, error = %e, "bootstrap resolution failed, will retry");
                continue;
            }
        };

        let contact = NodeInfo {
            id: entry.public_key,
            addr,
        };

        // The query only succeeds if the exchange authenticated under the
        // configured key, which is the verification step.
        match client.query(contact, self_id).await {
            Ok(_) => seeds.push(contact),
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "bootstrap contact failed, will retry");
            }
        }
    }

    if seeds.is_empty() {
        return Err(DiscoveryError::BootstrapFailed(
            "no bootstrap contact reachable".into(),
        ));
    }

    Ok(iterative_find_node(seeds, client, self_id).await)
}
