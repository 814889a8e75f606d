//! Authenticated DHT and relay RPC over the packet transports.
//!
//! DHT traffic is sealed pairwise: each payload is encrypted under a key
//! derived from a static-static DH between the two nodes, with the sender's
//! public key travelling in the clear ahead of the ciphertext. A response
//! that opens under a contact's configured key *is* the cryptographic
//! verification the bootstrap path requires.
//!
//! Requests and responses are correlated by the contacted node's id (for
//! lookups), the echoed nonce (for pings), the message id (for stores),
//! and the (pseudonym, epoch) pair (for retrievals), so out-of-order
//! responses resolve the right waiter.
//!
//! Relay store traffic is deliberately not identity-sealed: envelopes are
//! already opaque and pseudonymous, and sealing them to the relay would
//! tell the relay who is talking.

use crate::PublicKey;
use crate::error::{Error, Result};
use dashmap::DashMap;
use hush_async::{AsyncError, PutRequest, Pseudonym, RelayApi, StoredEnvelope};
use hush_crypto::aead::{AeadKey, Nonce};
use hush_crypto::hash::hkdf;
use hush_crypto::x25519::{PrivateKey, PublicKey as DhPublicKey};
use hush_discovery::messages::{self, NodeInfo};
use hush_discovery::{DiscoveryError, LookupClient, NodeId};
use hush_transport::{NetworkAddress, Packet, PacketTransport, PacketType, SendOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Deadline for one RPC round-trip.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Sealed payload framing: sender public key plus AEAD nonce.
const SEAL_HEADER: usize = 32 + 12;

/// Retrieval request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetWire {
    /// Queried pseudonym
    pub pseudonym: Pseudonym,
    /// Queried epoch
    pub epoch: u64,
}

/// Retrieval response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponseWire {
    /// Echoed pseudonym
    pub pseudonym: Pseudonym,
    /// Echoed epoch
    pub epoch: u64,
    /// Matching envelopes
    pub envelopes: Vec<StoredEnvelope>,
}

/// The RPC client half shared by lookups, pings, and relay calls.
#[derive(Clone)]
pub struct DhtRpc {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    transport: Arc<dyn PacketTransport>,
    self_public: PublicKey,
    self_secret: [u8; 32],
    pending_find: DashMap<NodeId, oneshot::Sender<Vec<NodeInfo>>>,
    pending_ping: DashMap<[u8; 8], oneshot::Sender<NodeId>>,
    pending_put: DashMap<[u8; 32], oneshot::Sender<bool>>,
    pending_get: DashMap<([u8; 32], u64), oneshot::Sender<Vec<StoredEnvelope>>>,
}

impl DhtRpc {
    /// Create an RPC client over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn PacketTransport>, self_public: PublicKey, self_secret: [u8; 32]) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                transport,
                self_public,
                self_secret,
                pending_find: DashMap::new(),
                pending_ping: DashMap::new(),
                pending_put: DashMap::new(),
                pending_get: DashMap::new(),
            }),
        }
    }

    /// Our own id in the DHT key space.
    #[must_use]
    pub fn self_id(&self) -> NodeId {
        NodeId::from_public_key(self.inner.self_public)
    }

    fn pair_key(&self, peer: &PublicKey) -> Result<[u8; 32]> {
        let secret = PrivateKey::from_bytes(self.inner.self_secret);
        let shared = secret
            .exchange(&DhPublicKey::from_bytes(*peer))
            .ok_or(Error::InvalidPublicKey)?;

        let mut key = [0u8; 32];
        hkdf(b"hush/dht", shared.as_bytes(), &[], &mut key);
        Ok(key)
    }

    /// Seal a payload to a peer: `self_public ‖ nonce ‖ ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] for a low-order peer key and
    /// crypto errors from the AEAD.
    pub fn seal_to(&self, peer: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.pair_key(peer)?;

        let mut nonce = [0u8; 12];
        hush_crypto::random::fill_random(&mut nonce)?;

        let ciphertext =
            AeadKey::new(key).seal(&Nonce::from_bytes(nonce), plaintext, &self.inner.self_public)?;

        let mut payload = Vec::with_capacity(SEAL_HEADER + ciphertext.len());
        payload.extend_from_slice(&self.inner.self_public);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    /// Open a sealed payload, returning the sender's public key and the
    /// plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadMac`] for malformed or unauthentic payloads.
    pub fn open_from(&self, payload: &[u8]) -> Result<(PublicKey, Vec<u8>)> {
        if payload.len() < SEAL_HEADER + hush_crypto::AEAD_TAG_SIZE {
            return Err(Error::BadMac);
        }

        let mut sender = [0u8; 32];
        sender.copy_from_slice(&payload[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&payload[32..44]);

        let key = self.pair_key(&sender)?;
        let plaintext =
            AeadKey::new(key).open(&Nonce::from_bytes(nonce), &payload[SEAL_HEADER..], &sender)?;

        Ok((sender, plaintext))
    }

    async fn send_packet(&self, packet_type: PacketType, payload: Vec<u8>, addr: &NetworkAddress) -> Result<()> {
        let packet = Packet::new(packet_type, payload)?;
        match self.inner.transport.send(&packet, addr).await? {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Unreachable => Err(Error::NodeUnreachable),
            SendOutcome::Backpressure => Err(Error::Backpressure),
        }
    }

    /// Probe a contact and wait for the nonce echo.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeUnreachable`] on send failure or deadline
    /// expiry.
    pub async fn ping(&self, peer: &NodeInfo) -> Result<()> {
        let nonce = hush_crypto::random::random_8()?;
        let sealed = self.seal_to(peer.id.as_bytes(), &messages::encode_ping(nonce))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending_ping.insert(nonce, tx);

        let addr = NetworkAddress::from_socket_addr(peer.addr)?;
        if let Err(e) = self.send_packet(PacketType::PingRequest, sealed, &addr).await {
            self.inner.pending_ping.remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(_)) => Ok(()),
            _ => {
                self.inner.pending_ping.remove(&nonce);
                Err(Error::NodeUnreachable)
            }
        }
    }

    /// Resolve an inbound ping response.
    pub fn resolve_ping(&self, nonce: [u8; 8], from: NodeId) {
        if let Some((_, tx)) = self.inner.pending_ping.remove(&nonce) {
            let _ = tx.send(from);
        }
    }

    /// Resolve an inbound FIND_NODE response from a contacted node.
    pub fn resolve_find_response(&self, from: NodeId, nodes: Vec<NodeInfo>) {
        if let Some((_, tx)) = self.inner.pending_find.remove(&from) {
            let _ = tx.send(nodes);
        }
    }

    /// Resolve an inbound store acknowledgment.
    pub fn resolve_put_ack(&self, message_id: [u8; 32]) {
        if let Some((_, tx)) = self.inner.pending_put.remove(&message_id) {
            let _ = tx.send(true);
        }
    }

    /// Resolve an inbound retrieval response.
    pub fn resolve_get_response(&self, wire: GetResponseWire) {
        let key = (*wire.pseudonym.as_bytes(), wire.epoch);
        if let Some((_, tx)) = self.inner.pending_get.remove(&key) {
            let _ = tx.send(wire.envelopes);
        }
    }
}

impl LookupClient for DhtRpc {
    async fn query(
        &self,
        peer: NodeInfo,
        target: NodeId,
    ) -> std::result::Result<Vec<NodeInfo>, DiscoveryError> {
        let payload = messages::encode_find_node_request(&target);
        let sealed = self
            .seal_to(peer.id.as_bytes(), &payload)
            .map_err(|e| DiscoveryError::QueryFailed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending_find.insert(peer.id, tx);

        let addr = NetworkAddress::from_socket_addr(peer.addr)
            .map_err(|e| DiscoveryError::QueryFailed(e.to_string()))?;

        if let Err(e) = self.send_packet(PacketType::FindNodeRequest, sealed, &addr).await {
            self.inner.pending_find.remove(&peer.id);
            return Err(DiscoveryError::QueryFailed(e.to_string()));
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(nodes)) => Ok(nodes),
            _ => {
                self.inner.pending_find.remove(&peer.id);
                Err(DiscoveryError::QueryFailed("lookup deadline expired".into()))
            }
        }
    }
}

impl RelayApi for DhtRpc {
    async fn put(
        &self,
        relay: NodeInfo,
        request: PutRequest,
    ) -> std::result::Result<bool, AsyncError> {
        let message_id = request.message_id;
        let payload = request.encode()?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending_put.insert(message_id, tx);

        let addr = NetworkAddress::from_socket_addr(relay.addr)
            .map_err(|e| AsyncError::Relay(e.to_string()))?;

        if let Err(e) = self.send_packet(PacketType::AsyncPut, payload, &addr).await {
            self.inner.pending_put.remove(&message_id);
            return Err(AsyncError::Relay(e.to_string()));
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(acked)) => Ok(acked),
            _ => {
                self.inner.pending_put.remove(&message_id);
                Err(AsyncError::Relay("store deadline expired".into()))
            }
        }
    }

    async fn get(
        &self,
        relay: NodeInfo,
        pseudonym: Pseudonym,
        epoch: u64,
    ) -> std::result::Result<Vec<StoredEnvelope>, AsyncError> {
        let wire = GetWire { pseudonym, epoch };
        let payload = bincode::serialize(&wire).map_err(|e| AsyncError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let key = (*pseudonym.as_bytes(), epoch);
        self.inner.pending_get.insert(key, tx);

        let addr = NetworkAddress::from_socket_addr(relay.addr)
            .map_err(|e| AsyncError::Relay(e.to_string()))?;

        if let Err(e) = self.send_packet(PacketType::AsyncGet, payload, &addr).await {
            self.inner.pending_get.remove(&key);
            return Err(AsyncError::Relay(e.to_string()));
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(envelopes)) => Ok(envelopes),
            _ => {
                self.inner.pending_get.remove(&key);
                Err(AsyncError::Relay("retrieval deadline expired".into()))
            }
        }
    }
}
