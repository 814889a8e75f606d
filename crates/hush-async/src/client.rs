//! Delivery and retrieval client, plus the pre-key refresh sub-protocol.
//!
//! The client is transport-agnostic: it drives a [`RelayApi`]
//! implementation, so the same logic runs over real relay packets and
//! over in-process stores in tests. Storage policy: success is at least
//! one relay ack; a relay rejection is advisory and the next relay is
//! tried; no reachable relay at all is an error surfaced to the caller.

use crate::envelope::seal_envelope;
use crate::epoch::retrieval_epochs;
use crate::error::AsyncError;
use crate::pseudonym::Pseudonym;
use crate::store::StoredEnvelope;
use hush_crypto::prekey::{PreKeyPool, PreKeyRecord, RemotePreKeys};
use hush_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use hush_discovery::messages::NodeInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A store request as sent to relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    /// Content-derived deduplication id
    pub message_id: [u8; 32],
    /// Recipient pseudonym for the stamped epoch
    pub pseudonym: Pseudonym,
    /// Epoch the sender stamped
    pub epoch: u64,
    /// Encoded envelope
    pub payload: Vec<u8>,
}

impl PutRequest {
    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>, AsyncError> {
        bincode::serialize(self).map_err(|e| AsyncError::Malformed(e.to_string()))
    }

    /// Parse from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, AsyncError> {
        bincode::deserialize(bytes).map_err(|e| AsyncError::Malformed(e.to_string()))
    }
}

/// One relay round-trip, implemented over the packet plumbing by the
/// runtime and over an in-memory store in tests.
pub trait RelayApi: Send + Sync {
    /// Store an envelope on one relay. `Ok(true)` is an ack, `Ok(false)`
    /// an advisory rejection.
    fn put(
        &self,
        relay: NodeInfo,
        request: PutRequest,
    ) -> impl std::future::Future<Output = Result<bool, AsyncError>> + Send;

    /// Fetch envelopes under a pseudonym for one epoch from one relay.
    fn get(
        &self,
        relay: NodeInfo,
        pseudonym: Pseudonym,
        epoch: u64,
    ) -> impl std::future::Future<Output = Result<Vec<StoredEnvelope>, AsyncError>> + Send;
}

/// Build a store request for an offline friend.
///
/// Consumes one of the recipient's pre-keys from the sender's stock. The
/// message id is the BLAKE3 hash of the sealed payload, which makes
/// replayed stores and replayed retrievals collapse to one delivery.
///
/// # Errors
///
/// Returns [`AsyncError::NoPreKeys`] when the stock is below minimum and
/// envelope errors otherwise.
pub fn prepare_offline_message(
    recipient_public: &[u8; 32],
    stock: &mut RemotePreKeys,
    plaintext: &[u8],
    current_epoch: u64,
) -> Result<PutRequest, AsyncError> {
    let prekey = stock.take_for_send().ok_or(AsyncError::NoPreKeys)?;

    let envelope = seal_envelope(&prekey, plaintext)?;
    let payload = envelope.encode()?;
    let message_id = hush_crypto::hash::hash(&payload);

    Ok(PutRequest {
        message_id,
        pseudonym: Pseudonym::derive(recipient_public, current_epoch),
        epoch: current_epoch,
        payload,
    })
}

/// Entrust a message to the relay set.
///
/// # Errors
///
/// Returns [`AsyncError::NoStorageNodes`] when the relay list is empty or
/// no relay acked.
pub async fn deliver<R: RelayApi>(
    api: &R,
    relays: &[NodeInfo],
    request: PutRequest,
) -> Result<(), AsyncError> {
    if relays.is_empty() {
        return Err(AsyncError::NoStorageNodes);
    }

    for relay in relays {
        match api.put(*relay, request.clone()).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                tracing::debug!(relay = %relay.id, "relay declined store, trying next");
            }
            Err(e) => {
                tracing::debug!(relay = %relay.id, error = %e, "relay store failed, trying next");
            }
        }
    }

    Err(AsyncError::NoStorageNodes)
}

/// Deduplication state across retrievals.
///
/// Survives for the life of the node, so a replayed relay response never
/// produces a second delivery.
#[derive(Debug, Default)]
pub struct RetrievalState {
    seen: HashSet<[u8; 32]>,
}

impl RetrievalState {
    /// Fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message id; returns whether it was new.
    pub fn mark_new(&mut self, message_id: [u8; 32]) -> bool {
        self.seen.insert(message_id)
    }
}

/// Drain waiting messages for ourselves from the relay set.
///
/// Queries every pseudonym in the acceptance window on every relay,
/// deduplicating by message id through `state`.
pub async fn retrieve<R: RelayApi>(
    api: &R,
    relays: &[NodeInfo],
    recipient_public: &[u8; 32],
    current_epoch: u64,
    state: &mut RetrievalState,
) -> Vec<StoredEnvelope> {
    let mut collected = Vec::new();

    for epoch in retrieval_epochs(current_epoch) {
        let pseudonym = Pseudonym::derive(recipient_public, epoch);

        for relay in relays {
            let envelopes = match api.get(*relay, pseudonym, epoch).await {
                Ok(envelopes) => envelopes,
                Err(e) => {
                    tracing::debug!(relay = %relay.id, error = %e, "relay fetch failed");
                    continue;
                }
            };

            for envelope in envelopes {
                if state.mark_new(envelope.message_id) {
                    collected.push(envelope);
                }
            }
        }
    }

    collected
}

/// Pre-key refresh request: sent when a friend comes online and the
/// sender's stock of their pre-keys has run low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyRefreshRequest {
    /// Number of fresh pre-keys wanted
    pub count: u16,
}

impl PreKeyRefreshRequest {
    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>, AsyncError> {
        bincode::serialize(self).map_err(|e| AsyncError::Malformed(e.to_string()))
    }

    /// Parse from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, AsyncError> {
        bincode::deserialize(bytes).map_err(|e| AsyncError::Malformed(e.to_string()))
    }
}

/// Signed batch of fresh pre-keys.
///
/// The batch is signed by the owner's Ed25519 identity key so neither a
/// relay nor an on-path attacker can substitute keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyRefreshResponse {
    /// Fresh pre-key records
    pub batch: Vec<PreKeyRecord>,
    /// Ed25519 signature over the serialized batch
    pub signature: Vec<u8>,
}

impl PreKeyRefreshResponse {
    /// Mint and sign a fresh batch from the local pool.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on serialization failure.
    pub fn mint_signed(
        pool: &mut PreKeyPool,
        signing_key: &SigningKey,
        count: u16,
        epoch: u64,
    ) -> Result<Self, AsyncError> {
        let batch = pool.mint(&mut rand_core::OsRng, usize::from(count), epoch);
        let batch_bytes =
            bincode::serialize(&batch).map_err(|e| AsyncError::Malformed(e.to_string()))?;
        let signature = signing_key.sign(&batch_bytes);

        Ok(Self {
            batch,
            signature: signature.as_bytes().to_vec(),
        })
    }

    /// Verify the signature and release the batch.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] for a bad signature or encoding.
    pub fn verify(self, owner: &VerifyingKey) -> Result<Vec<PreKeyRecord>, AsyncError> {
        let batch_bytes =
            bincode::serialize(&self.batch).map_err(|e| AsyncError::Malformed(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| AsyncError::Malformed("bad signature length".into()))?;

        owner
            .verify(&batch_bytes, &signature)
            .map_err(|_| AsyncError::Malformed("pre-key batch signature invalid".into()))?;

        Ok(self.batch)
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>, AsyncError> {
        bincode::serialize(self).map_err(|e| AsyncError::Malformed(e.to_string()))
    }

    /// Parse from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::Malformed`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, AsyncError> {
        bincode::deserialize(bytes).map_err(|e| AsyncError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::open_offline_message;
    use crate::store::ObfuscatedStore;
    use hush_discovery::node_id::NodeId;
    use rand_core::OsRng;
    use std::sync::{Arc, Mutex};

    /// In-memory relay network backed by real stores.
    #[derive(Clone, Default)]
    struct MemoryRelays {
        stores: Arc<Mutex<std::collections::HashMap<NodeId, ObfuscatedStore>>>,
        current_epoch: u64,
        reachable: bool,
    }

    impl MemoryRelays {
        fn new(current_epoch: u64) -> Self {
            Self {
                stores: Arc::default(),
                current_epoch,
                reachable: true,
            }
        }
    }

    impl RelayApi for MemoryRelays {
        async fn put(&self, relay: NodeInfo, request: PutRequest) -> Result<bool, AsyncError> {
            if !self.reachable {
                return Err(AsyncError::Relay("down".into()));
            }
            let mut stores = self.stores.lock().unwrap();
            let store = stores.entry(relay.id).or_default();
            match store.put(
                request.pseudonym,
                request.epoch,
                request.message_id,
                request.payload,
                self.current_epoch,
            ) {
                Ok(()) => Ok(true),
                Err(AsyncError::Relay(_)) => Ok(false),
                Err(e) => Err(e),
            }
        }

        async fn get(
            &self,
            relay: NodeInfo,
            pseudonym: Pseudonym,
            epoch: u64,
        ) -> Result<Vec<StoredEnvelope>, AsyncError> {
            if !self.reachable {
                return Err(AsyncError::Relay("down".into()));
            }
            let stores = self.stores.lock().unwrap();
            Ok(stores
                .get(&relay.id)
                .map(|store| store.get(&pseudonym, epoch))
                .unwrap_or_default())
        }
    }

    fn relay(tag: u8) -> NodeInfo {
        NodeInfo {
            id: NodeId::from_bytes([tag; 32]),
            addr: format!("127.0.0.1:{}", 9000 + u16::from(tag)).parse().unwrap(),
        }
    }

    fn recipient() -> ([u8; 32], PreKeyPool, RemotePreKeys) {
        let public = [0x77u8; 32];
        let mut pool = PreKeyPool::new();
        let mut stock = RemotePreKeys::new();
        stock.replenish(pool.mint(&mut OsRng, 10, 1));
        (public, pool, stock)
    }

    #[tokio::test]
    async fn test_offline_delivery_roundtrip() {
        let (public, mut pool, mut stock) = recipient();
        let net = MemoryRelays::new(100);
        let relays = [relay(1), relay(2)];

        let request =
            prepare_offline_message(&public, &mut stock, b"queued for later", 100).unwrap();
        deliver(&net, &relays, request).await.unwrap();

        let mut state = RetrievalState::new();
        let envelopes = retrieve(&net, &relays, &public, 100, &mut state).await;
        assert_eq!(envelopes.len(), 1);

        let envelope = crate::envelope::Envelope::decode(&envelopes[0].payload).unwrap();
        let plaintext = open_offline_message(&mut pool, &envelope).unwrap();
        assert_eq!(plaintext, b"queued for later");
    }

    #[tokio::test]
    async fn test_replayed_relay_response_deduplicated() {
        let (public, _pool, mut stock) = recipient();
        let net = MemoryRelays::new(100);
        let relays = [relay(1)];

        let request = prepare_offline_message(&public, &mut stock, b"once", 100).unwrap();
        deliver(&net, &relays, request).await.unwrap();

        let mut state = RetrievalState::new();
        let first = retrieve(&net, &relays, &public, 100, &mut state).await;
        assert_eq!(first.len(), 1);

        // The relay replays the same response
        let second = retrieve(&net, &relays, &public, 100, &mut state).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_no_prekeys_refused() {
        let public = [0x77u8; 32];
        let mut stock = RemotePreKeys::new();

        let result = prepare_offline_message(&public, &mut stock, b"msg", 100);
        assert_eq!(result.unwrap_err(), AsyncError::NoPreKeys);
    }

    #[tokio::test]
    async fn test_no_relays_is_no_storage_nodes() {
        let (public, _pool, mut stock) = recipient();
        let net = MemoryRelays::new(100);

        let request = prepare_offline_message(&public, &mut stock, b"msg", 100).unwrap();
        assert_eq!(
            deliver(&net, &[], request).await.unwrap_err(),
            AsyncError::NoStorageNodes
        );
    }

    #[tokio::test]
    async fn test_all_relays_down_is_no_storage_nodes() {
        let (public, _pool, mut stock) = recipient();
        let mut net = MemoryRelays::new(100);
        net.reachable = false;

        let request = prepare_offline_message(&public, &mut stock, b"msg", 100).unwrap();
        assert_eq!(
            deliver(&net, &[relay(1), relay(2)], request).await.unwrap_err(),
            AsyncError::NoStorageNodes
        );
    }

    #[tokio::test]
    async fn test_refresh_response_sign_verify() {
        let signing = SigningKey::generate(&mut OsRng);
        let mut pool = PreKeyPool::new();

        let response =
            PreKeyRefreshResponse::mint_signed(&mut pool, &signing, 10, 5).unwrap();
        let decoded = PreKeyRefreshResponse::decode(&response.encode().unwrap()).unwrap();

        let batch = decoded.verify(&signing.verifying_key()).unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(pool.len(), 10);
    }

    #[tokio::test]
    async fn test_refresh_response_tamper_rejected() {
        let signing = SigningKey::generate(&mut OsRng);
        let imposter = SigningKey::generate(&mut OsRng);
        let mut pool = PreKeyPool::new();

        let mut response =
            PreKeyRefreshResponse::mint_signed(&mut pool, &signing, 4, 5).unwrap();

        // Wrong signer
        assert!(response.clone().verify(&imposter.verifying_key()).is_err());

        // Tampered batch
        response.batch[0].public[0] ^= 1;
        assert!(response.verify(&signing.verifying_key()).is_err());
    }
}
