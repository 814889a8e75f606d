//! Noise-IK handshake for mutually authenticated sessions.
//!
//! Implements the `IK` pattern using the snow library:
//! - Pattern: `IK` (initiator knows the responder's static key)
//! - DH: `25519` (Curve25519)
//! - Cipher: `ChaChaPoly` (ChaCha20-Poly1305)
//! - Hash: `SHA256`
//!
//! ## Message Flow
//!
//! ```text
//! Message 1: Initiator → Responder: e, es, s, ss  [nonce ‖ timestamp]
//! Message 2: Responder → Initiator: e, ee, se
//! ```
//!
//! The message 1 payload carries a 16-byte random nonce and an 8-byte
//! big-endian UNIX timestamp. The responder accepts the message only when
//! the timestamp is within the freshness window and the nonce has not been
//! seen before, which stops captured handshakes from being replayed.
//!
//! After message 2, both parties derive directional record keys from the
//! handshake hash. The handshake hash also binds every subsequent record
//! to this particular handshake.

use crate::hash::hkdf;
use crate::{CryptoError, HANDSHAKE_NONCE_SIZE, SessionKeys, random};
use snow::{Builder, HandshakeState};
use std::collections::HashMap;
use zeroize::Zeroize;

/// Noise protocol pattern used by HUSH sessions.
const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

/// Maximum handshake message size.
/// Message 1: 32 (e) + 48 (s, encrypted) + 24 payload + 16 tag = 120 bytes.
/// Message 2: 32 (e) + 16 tag = 48 bytes.
/// Generous headroom for payload growth.
const MAX_HANDSHAKE_MSG_SIZE: usize = 512;

/// Message 1 payload size: nonce plus big-endian timestamp.
pub const MSG1_PAYLOAD_SIZE: usize = HANDSHAKE_NONCE_SIZE + 8;

/// Freshness window for handshake timestamps and replay-cache entries.
pub const HANDSHAKE_FRESHNESS_SECS: u64 = 300;

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends message 1
    Initiator,
    /// Receives message 1
    Responder,
}

/// Progress of the two-message exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing exchanged yet
    Initial,
    /// Message 1 sent (initiator) or received (responder)
    Message1Done,
    /// Message 2 exchanged, transport keys available
    Complete,
}

/// Static X25519 keypair in the form the snow builder consumes.
///
/// This is the node's long-term identity key used across all sessions.
pub struct StaticKeypair {
    private: Vec<u8>,
    public: [u8; 32],
}

impl StaticKeypair {
    /// Generate a new random keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if keypair generation fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let builder = Builder::new(parse_pattern()?);
        let keypair = builder
            .generate_keypair()
            .map_err(|e| CryptoError::Handshake(format!("keypair generation: {e:?}")))?;

        let mut public = [0u8; 32];
        public.copy_from_slice(&keypair.public);

        Ok(Self {
            private: keypair.private,
            public,
        })
    }

    /// Create from an existing X25519 private key.
    #[must_use]
    pub fn from_private(private: [u8; 32]) -> Self {
        use crate::x25519::PrivateKey;

        let secret = PrivateKey::from_bytes(private);
        let public = secret.public_key().to_bytes();

        Self {
            private: private.to_vec(),
            public,
        }
    }

    /// Get the public key bytes.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Get the private key bytes.
    ///
    /// # Security
    ///
    /// This is the long-term identity key. Handle with extreme care.
    #[must_use]
    pub fn private_key(&self) -> &[u8] {
        &self.private
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl Clone for StaticKeypair {
    fn clone(&self) -> Self {
        Self {
            private: self.private.clone(),
            public: self.public,
        }
    }
}

fn parse_pattern() -> Result<snow::params::NoiseParams, CryptoError> {
    NOISE_PATTERN
        .parse()
        .map_err(|e| CryptoError::Handshake(format!("pattern parse: {e:?}")))
}

/// Replay cache for handshake message 1 nonces.
///
/// Entries live for [`HANDSHAKE_FRESHNESS_SECS`]; `gc` must run on the
/// maintenance schedule to keep the cache bounded under sustained
/// handshake traffic.
pub struct HandshakeReplayCache {
    entries: HashMap<[u8; HANDSHAKE_NONCE_SIZE], CacheEntry>,
}

struct CacheEntry {
    peer_public: [u8; 32],
    received_at: u64,
}

impl HandshakeReplayCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record a nonce, rejecting duplicates within the freshness window.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::ReplayDetected`] if the nonce is already
    /// present and fresh.
    pub fn check_and_insert(
        &mut self,
        nonce: [u8; HANDSHAKE_NONCE_SIZE],
        peer_public: [u8; 32],
        now_unix: u64,
    ) -> Result<(), CryptoError> {
        if let Some(entry) = self.entries.get(&nonce) {
            if now_unix.saturating_sub(entry.received_at) <= HANDSHAKE_FRESHNESS_SECS {
                return Err(CryptoError::ReplayDetected);
            }
        }

        self.entries.insert(
            nonce,
            CacheEntry {
                peer_public,
                received_at: now_unix,
            },
        );
        Ok(())
    }

    /// Drop entries older than the freshness window.
    pub fn gc(&mut self, now_unix: u64) {
        self.entries
            .retain(|_, entry| now_unix.saturating_sub(entry.received_at) <= HANDSHAKE_FRESHNESS_SECS);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Peer that originally presented a cached nonce, if still cached.
    #[must_use]
    pub fn peer_for_nonce(&self, nonce: &[u8; HANDSHAKE_NONCE_SIZE]) -> Option<[u8; 32]> {
        self.entries.get(nonce).map(|e| e.peer_public)
    }
}

impl Default for HandshakeReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A Noise-IK handshake in progress.
pub struct IkHandshake {
    state: HandshakeState,
    role: Role,
    phase: HandshakePhase,
}

impl IkHandshake {
    /// Create a handshake as the initiator.
    ///
    /// The initiator must already know the responder's static public key;
    /// that knowledge is what authenticates the responder.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the snow state cannot be built.
    pub fn initiator(local: &StaticKeypair, peer_public: &[u8; 32]) -> Result<Self, CryptoError> {
        let state = Builder::new(parse_pattern()?)
            .local_private_key(&local.private)
            .map_err(|e| CryptoError::Handshake(format!("local key: {e:?}")))?
            .remote_public_key(peer_public)
            .map_err(|e| CryptoError::Handshake(format!("remote key: {e:?}")))?
            .build_initiator()
            .map_err(|e| CryptoError::Handshake(format!("build: {e:?}")))?;

        Ok(Self {
            state,
            role: Role::Initiator,
            phase: HandshakePhase::Initial,
        })
    }

    /// Create a handshake as the responder.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the snow state cannot be built.
    pub fn responder(local: &StaticKeypair) -> Result<Self, CryptoError> {
        let state = Builder::new(parse_pattern()?)
            .local_private_key(&local.private)
            .map_err(|e| CryptoError::Handshake(format!("local key: {e:?}")))?
            .build_responder()
            .map_err(|e| CryptoError::Handshake(format!("build: {e:?}")))?;

        Ok(Self {
            state,
            role: Role::Responder,
            phase: HandshakePhase::Initial,
        })
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Role of this side.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether message 2 has been exchanged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Write handshake message 1 (initiator only).
    ///
    /// The payload carries a fresh random nonce and the caller-supplied
    /// UNIX timestamp for the responder's replay checks.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] out of order,
    /// [`CryptoError::RandomFailed`] if nonce generation fails, or
    /// [`CryptoError::Handshake`] on snow failure.
    pub fn write_message_1(&mut self, now_unix: u64) -> Result<Vec<u8>, CryptoError> {
        if self.role != Role::Initiator || self.phase != HandshakePhase::Initial {
            return Err(CryptoError::InvalidState);
        }

        let nonce = random::random_16()?;
        let mut payload = [0u8; MSG1_PAYLOAD_SIZE];
        payload[..HANDSHAKE_NONCE_SIZE].copy_from_slice(&nonce);
        payload[HANDSHAKE_NONCE_SIZE..].copy_from_slice(&now_unix.to_be_bytes());

        let mut message = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self
            .state
            .write_message(&payload, &mut message)
            .map_err(|e| CryptoError::Handshake(format!("write msg1: {e:?}")))?;
        message.truncate(len);

        self.phase = HandshakePhase::Message1Done;
        Ok(message)
    }

    /// Read handshake message 1 (responder only).
    ///
    /// Validates the embedded timestamp against the freshness window and
    /// the nonce against the replay cache before accepting. Returns the
    /// initiator's static public key on success.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::BadMac`] if decryption or authentication fails
    /// - [`CryptoError::StaleTimestamp`] if |now − timestamp| exceeds the window
    /// - [`CryptoError::ReplayDetected`] if the nonce was already seen
    /// - [`CryptoError::InvalidState`] out of order
    pub fn read_message_1(
        &mut self,
        message: &[u8],
        now_unix: u64,
        replay_cache: &mut HandshakeReplayCache,
    ) -> Result<[u8; 32], CryptoError> {
        if self.role != Role::Responder || self.phase != HandshakePhase::Initial {
            return Err(CryptoError::InvalidState);
        }

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self
            .state
            .read_message(message, &mut payload)
            .map_err(|_| CryptoError::BadMac)?;
        payload.truncate(len);

        if payload.len() != MSG1_PAYLOAD_SIZE {
            return Err(CryptoError::BadMac);
        }

        let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
        nonce.copy_from_slice(&payload[..HANDSHAKE_NONCE_SIZE]);
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&payload[HANDSHAKE_NONCE_SIZE..]);
        let timestamp = u64::from_be_bytes(ts_bytes);

        let drift = now_unix.abs_diff(timestamp);
        if drift > HANDSHAKE_FRESHNESS_SECS {
            return Err(CryptoError::StaleTimestamp);
        }

        let remote = self
            .state
            .get_remote_static()
            .ok_or(CryptoError::InvalidState)?;
        let mut remote_public = [0u8; 32];
        remote_public.copy_from_slice(remote);

        replay_cache.check_and_insert(nonce, remote_public, now_unix)?;

        self.phase = HandshakePhase::Message1Done;
        Ok(remote_public)
    }

    /// Write handshake message 2 (responder only).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] out of order or
    /// [`CryptoError::Handshake`] on snow failure.
    pub fn write_message_2(&mut self) -> Result<Vec<u8>, CryptoError> {
        if self.role != Role::Responder || self.phase != HandshakePhase::Message1Done {
            return Err(CryptoError::InvalidState);
        }

        let mut message = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self
            .state
            .write_message(&[], &mut message)
            .map_err(|e| CryptoError::Handshake(format!("write msg2: {e:?}")))?;
        message.truncate(len);

        self.phase = HandshakePhase::Complete;
        Ok(message)
    }

    /// Read handshake message 2 (initiator only).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadMac`] if authentication fails or
    /// [`CryptoError::InvalidState`] out of order.
    pub fn read_message_2(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        if self.role != Role::Initiator || self.phase != HandshakePhase::Message1Done {
            return Err(CryptoError::InvalidState);
        }

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        self.state
            .read_message(message, &mut payload)
            .map_err(|_| CryptoError::BadMac)?;

        self.phase = HandshakePhase::Complete;
        Ok(())
    }

    /// The remote peer's static public key, once known.
    #[must_use]
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().map(|key| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(key);
            arr
        })
    }

    /// Complete the handshake and derive directional record keys.
    ///
    /// Both parties derive the same two keys from the handshake hash and
    /// assign send/recv by role.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if message 2 has not been
    /// exchanged yet.
    pub fn into_session_keys(self) -> Result<SessionKeys, CryptoError> {
        if self.phase != HandshakePhase::Complete {
            return Err(CryptoError::InvalidState);
        }

        let hash = self.state.get_handshake_hash();
        let mut handshake_hash = [0u8; 32];
        handshake_hash.copy_from_slice(&hash[..32]);

        Ok(derive_directional_keys(
            &handshake_hash,
            hash,
            self.role == Role::Initiator,
        ))
    }
}

/// Split key material into directional record keys.
fn derive_directional_keys(handshake_hash: &[u8; 32], ikm: &[u8], initiator: bool) -> SessionKeys {
    let mut key_i2r = [0u8; 32];
    let mut key_r2i = [0u8; 32];
    hkdf(handshake_hash, ikm, b"hush/i2r", &mut key_i2r);
    hkdf(handshake_hash, ikm, b"hush/r2i", &mut key_r2i);

    let (send_key, recv_key) = if initiator {
        (key_i2r, key_r2i)
    } else {
        (key_r2i, key_i2r)
    };

    SessionKeys {
        send_key,
        recv_key,
        handshake_hash: *handshake_hash,
    }
}

/// Derive replacement keys for an in-session rekey.
///
/// The rekey sender generates a fresh ephemeral, computes a DH against the
/// peer's static key, and both sides feed the shared secret plus the old
/// handshake hash into HKDF. The returned keys carry a new handshake hash
/// chaining the old one, so records under the new keys cannot be confused
/// with the previous era.
#[must_use]
pub fn derive_rekey_keys(
    old_hash: &[u8; 32],
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    rekey_sender: bool,
) -> SessionKeys {
    let mut next_hash_input = Vec::with_capacity(64 + 11);
    next_hash_input.extend_from_slice(old_hash);
    next_hash_input.extend_from_slice(ephemeral_public);
    next_hash_input.extend_from_slice(b"hush/rekey");
    let next_hash = crate::hash::hash(&next_hash_input);

    let mut keys = derive_directional_keys(&next_hash, shared_secret, rekey_sender);
    keys.handshake_hash = next_hash;
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn complete_handshake() -> (SessionKeys, SessionKeys, [u8; 32], [u8; 32]) {
        let initiator_keys = StaticKeypair::generate().unwrap();
        let responder_keys = StaticKeypair::generate().unwrap();
        let mut cache = HandshakeReplayCache::new();

        let mut initiator =
            IkHandshake::initiator(&initiator_keys, responder_keys.public_key()).unwrap();
        let mut responder = IkHandshake::responder(&responder_keys).unwrap();

        let msg1 = initiator.write_message_1(NOW).unwrap();
        let remote = responder.read_message_1(&msg1, NOW, &mut cache).unwrap();
        assert_eq!(remote, *initiator_keys.public_key());

        let msg2 = responder.write_message_2().unwrap();
        initiator.read_message_2(&msg2).unwrap();

        let i_pub = *initiator_keys.public_key();
        let r_pub = *responder_keys.public_key();
        (
            initiator.into_session_keys().unwrap(),
            responder.into_session_keys().unwrap(),
            i_pub,
            r_pub,
        )
    }

    #[test]
    fn test_full_handshake_key_agreement() {
        let (initiator_keys, responder_keys, _, _) = complete_handshake();

        assert_eq!(initiator_keys.send_key, responder_keys.recv_key);
        assert_eq!(initiator_keys.recv_key, responder_keys.send_key);
        assert_eq!(initiator_keys.handshake_hash, responder_keys.handshake_hash);
        assert_ne!(initiator_keys.send_key, initiator_keys.recv_key);
    }

    #[test]
    fn test_replay_of_message_1_rejected() {
        let initiator_keys = StaticKeypair::generate().unwrap();
        let responder_keys = StaticKeypair::generate().unwrap();
        let mut cache = HandshakeReplayCache::new();

        let mut initiator =
            IkHandshake::initiator(&initiator_keys, responder_keys.public_key()).unwrap();
        let msg1 = initiator.write_message_1(NOW).unwrap();

        let mut responder = IkHandshake::responder(&responder_keys).unwrap();
        responder.read_message_1(&msg1, NOW, &mut cache).unwrap();

        // Attacker replays the captured message 30 seconds later
        let mut replay_target = IkHandshake::responder(&responder_keys).unwrap();
        let result = replay_target.read_message_1(&msg1, NOW + 30, &mut cache);
        assert_eq!(result, Err(CryptoError::ReplayDetected));
    }

    #[test]
    fn test_fresh_nonce_after_window_accepted() {
        let responder_keys = StaticKeypair::generate().unwrap();
        let initiator_keys = StaticKeypair::generate().unwrap();
        let mut cache = HandshakeReplayCache::new();

        let mut first =
            IkHandshake::initiator(&initiator_keys, responder_keys.public_key()).unwrap();
        let msg1 = first.write_message_1(NOW).unwrap();
        let mut responder = IkHandshake::responder(&responder_keys).unwrap();
        responder.read_message_1(&msg1, NOW, &mut cache).unwrap();

        cache.gc(NOW + HANDSHAKE_FRESHNESS_SECS + 1);

        // A brand new handshake (fresh nonce) succeeds after the window
        let mut second =
            IkHandshake::initiator(&initiator_keys, responder_keys.public_key()).unwrap();
        let later = NOW + HANDSHAKE_FRESHNESS_SECS + 1;
        let msg1b = second.write_message_1(later).unwrap();
        let mut responder2 = IkHandshake::responder(&responder_keys).unwrap();
        responder2.read_message_1(&msg1b, later, &mut cache).unwrap();
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let initiator_keys = StaticKeypair::generate().unwrap();
        let responder_keys = StaticKeypair::generate().unwrap();
        let mut cache = HandshakeReplayCache::new();

        let mut initiator =
            IkHandshake::initiator(&initiator_keys, responder_keys.public_key()).unwrap();
        let msg1 = initiator.write_message_1(NOW).unwrap();

        let mut responder = IkHandshake::responder(&responder_keys).unwrap();
        let result = responder.read_message_1(&msg1, NOW + HANDSHAKE_FRESHNESS_SECS + 60, &mut cache);
        assert_eq!(result, Err(CryptoError::StaleTimestamp));
    }

    #[test]
    fn test_wrong_responder_key_fails() {
        let initiator_keys = StaticKeypair::generate().unwrap();
        let responder_keys = StaticKeypair::generate().unwrap();
        let imposter_keys = StaticKeypair::generate().unwrap();
        let mut cache = HandshakeReplayCache::new();

        // Initiator targets the real responder's key; an imposter without
        // that private key cannot read message 1.
        let mut initiator =
            IkHandshake::initiator(&initiator_keys, responder_keys.public_key()).unwrap();
        let msg1 = initiator.write_message_1(NOW).unwrap();

        let mut imposter = IkHandshake::responder(&imposter_keys).unwrap();
        assert_eq!(
            imposter.read_message_1(&msg1, NOW, &mut cache),
            Err(CryptoError::BadMac)
        );
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let keys = StaticKeypair::generate().unwrap();
        let peer = StaticKeypair::generate().unwrap();

        let mut initiator = IkHandshake::initiator(&keys, peer.public_key()).unwrap();
        assert_eq!(initiator.read_message_2(&[0u8; 48]), Err(CryptoError::InvalidState));

        let mut responder = IkHandshake::responder(&keys).unwrap();
        assert_eq!(responder.write_message_2(), Err(CryptoError::InvalidState));
    }

    #[test]
    fn test_incomplete_handshake_yields_no_keys() {
        let keys = StaticKeypair::generate().unwrap();
        let peer = StaticKeypair::generate().unwrap();

        let mut initiator = IkHandshake::initiator(&keys, peer.public_key()).unwrap();
        let _ = initiator.write_message_1(NOW).unwrap();
        assert!(initiator.into_session_keys().is_err());
    }

    #[test]
    fn test_replay_cache_gc() {
        let mut cache = HandshakeReplayCache::new();
        cache.check_and_insert([1u8; 16], [0u8; 32], NOW).unwrap();
        cache.check_and_insert([2u8; 16], [0u8; 32], NOW + 200).unwrap();
        assert_eq!(cache.len(), 2);

        cache.gc(NOW + HANDSHAKE_FRESHNESS_SECS + 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.peer_for_nonce(&[1u8; 16]).is_none());
        assert!(cache.peer_for_nonce(&[2u8; 16]).is_some());
    }

    #[test]
    fn test_rekey_derivation_symmetric() {
        let (initiator_keys, _, _, _) = complete_handshake();
        let shared = [0x5au8; 32];
        let eph = [0x33u8; 32];

        let sender = derive_rekey_keys(&initiator_keys.handshake_hash, &shared, &eph, true);
        let receiver = derive_rekey_keys(&initiator_keys.handshake_hash, &shared, &eph, false);

        assert_eq!(sender.send_key, receiver.recv_key);
        assert_eq!(sender.recv_key, receiver.send_key);
        assert_eq!(sender.handshake_hash, receiver.handshake_hash);
        assert_ne!(sender.handshake_hash, initiator_keys.handshake_hash);
    }

    #[test]
    fn test_keypair_from_private_roundtrip() {
        let original = StaticKeypair::generate().unwrap();
        let mut private = [0u8; 32];
        private.copy_from_slice(original.private_key());

        let restored = StaticKeypair::from_private(private);
        assert_eq!(original.public_key(), restored.public_key());
    }
}
