//! Per-peer session lifecycle.
//!
//! Wraps the Noise-IK handshake and the record layer into one state
//! machine per friend pair:
//!
//! ```text
//! Closed → HsInit (sent msg1) → Established
//! Closed → HsWait (received msg1 / sent msg2) → Established
//! Established → Rekey → Established → Closed
//! ```
//!
//! Handshakes that sit unanswered past the timeout close with a
//! retriable error. Rekeys swap directional keys atomically while keeping
//! the previous era's keys alive for a short grace window, so a record
//! sealed just before the swap still opens if its counter fits the old
//! window.

use crate::PublicKey;
use crate::error::{Error, Result};
use hush_crypto::noise::{
    HandshakeReplayCache, IkHandshake, StaticKeypair, derive_rekey_keys,
};
use hush_crypto::session::SessionCrypto;
use hush_crypto::x25519::{PrivateKey, PublicKey as DhPublicKey};
use rand_core::OsRng;

/// Handshake timeout.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Handshake retry backoff, in seconds.
const HANDSHAKE_BACKOFF_SECS: &[u64] = &[5, 10, 30, 60];

/// Handshake retry budget.
pub const HANDSHAKE_MAX_ATTEMPTS: u32 = 5;

/// How long the previous key era stays usable after a rekey.
const REKEY_GRACE_MS: u64 = 60_000;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No keys, no handshake in flight
    #[default]
    Closed,
    /// Initiator: message 1 sent, awaiting message 2
    HsInit,
    /// Responder: message 1 received, message 2 being produced
    HsWait,
    /// Directional keys live
    Established,
    /// Key swap in progress
    Rekey,
}

/// One peer's session.
pub struct Session {
    peer: PublicKey,
    state: SessionState,
    handshake: Option<IkHandshake>,
    crypto: Option<SessionCrypto>,
    /// Previous key era kept through the rekey grace window
    previous: Option<(SessionCrypto, u64)>,
    /// Handshake hash of the current era
    hash: [u8; 32],
    handshake_started_ms: u64,
    handshake_attempts: u32,
    next_retry_ms: u64,
    /// Clock milliseconds when the session became Established
    pub established_at_ms: u64,
    /// Clock milliseconds of last successful seal or open
    pub last_used_ms: u64,
}

impl Session {
    /// Create a closed session for a peer.
    #[must_use]
    pub fn new(peer: PublicKey) -> Self {
        Self {
            peer,
            state: SessionState::Closed,
            handshake: None,
            crypto: None,
            previous: None,
            hash: [0u8; 32],
            handshake_started_ms: 0,
            handshake_attempts: 0,
            next_retry_ms: 0,
            established_at_ms: 0,
            last_used_ms: 0,
        }
    }

    /// The peer's public key.
    #[must_use]
    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether records can be sealed right now.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Established | SessionState::Rekey)
    }

    /// Begin a handshake as initiator; returns message 1.
    ///
    /// Valid from `Closed` or as a restart from `HsInit`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionBusy`] over an established session.
    pub fn start_handshake(
        &mut self,
        local: &StaticKeypair,
        now_ms: u64,
        now_unix: u64,
    ) -> Result<Vec<u8>> {
        if self.is_established() {
            return Err(Error::SessionBusy);
        }

        let mut handshake = IkHandshake::initiator(local, &self.peer)?;
        let msg1 = handshake.write_message_1(now_unix)?;

        self.handshake = Some(handshake);
        self.state = SessionState::HsInit;
        self.handshake_started_ms = now_ms;
        Ok(msg1)
    }

    /// Process an incoming message 1 as responder; returns message 2.
    ///
    /// On success the session is established with directional keys and
    /// the initiator's static public key is returned.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::BadMac`], [`Error::ReplayDetected`], and
    /// [`Error::StaleTimestamp`] from the handshake engine, and returns
    /// [`Error::SessionBusy`] over an established session.
    pub fn accept_handshake(
        &mut self,
        local: &StaticKeypair,
        msg1: &[u8],
        now_ms: u64,
        now_unix: u64,
        replay_cache: &mut HandshakeReplayCache,
    ) -> Result<(Vec<u8>, PublicKey)> {
        if self.is_established() {
            return Err(Error::SessionBusy);
        }

        let mut handshake = IkHandshake::responder(local)?;
        let initiator = handshake.read_message_1(msg1, now_unix, replay_cache)?;
        self.peer = initiator;
        self.state = SessionState::HsWait;
        self.handshake_started_ms = now_ms;

        let msg2 = handshake.write_message_2()?;
        let keys = handshake.into_session_keys()?;

        self.hash = keys.handshake_hash;
        self.crypto = Some(SessionCrypto::new(&keys));
        self.handshake = None;
        self.state = SessionState::Established;
        self.established_at_ms = now_ms;
        self.handshake_attempts = 0;
        Ok((msg2, initiator))
    }

    /// Process message 2 as initiator, completing the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionBusy`] outside `HsInit` and
    /// [`Error::BadMac`] if the message fails to authenticate.
    pub fn finish_handshake(&mut self, msg2: &[u8], now_ms: u64) -> Result<()> {
        if self.state != SessionState::HsInit {
            return Err(Error::SessionBusy);
        }
        let Some(handshake) = self.handshake.as_mut() else {
            return Err(Error::SessionBusy);
        };

        handshake.read_message_2(msg2)?;
        let keys = self
            .handshake
            .take()
            .expect("handshake present in HsInit")
            .into_session_keys()?;

        self.hash = keys.handshake_hash;
        self.crypto = Some(SessionCrypto::new(&keys));
        self.state = SessionState::Established;
        self.established_at_ms = now_ms;
        self.handshake_attempts = 0;
        Ok(())
    }

    /// Whether an in-flight handshake has exceeded the timeout.
    #[must_use]
    pub fn handshake_expired(&self, now_ms: u64) -> bool {
        matches!(self.state, SessionState::HsInit | SessionState::HsWait)
            && now_ms.saturating_sub(self.handshake_started_ms) > HANDSHAKE_TIMEOUT_MS
    }

    /// Record a handshake timeout and schedule the next retry.
    ///
    /// Returns the clock time of the next retry, or `None` once the
    /// budget is spent (the session closes).
    pub fn note_handshake_timeout(&mut self, now_ms: u64) -> Option<u64> {
        self.handshake = None;
        self.state = SessionState::Closed;
        self.handshake_attempts += 1;

        if self.handshake_attempts >= HANDSHAKE_MAX_ATTEMPTS {
            self.handshake_attempts = 0;
            return None;
        }

        let delay = HANDSHAKE_BACKOFF_SECS
            .get(self.handshake_attempts as usize - 1)
            .copied()
            .unwrap_or(60);
        self.next_retry_ms = now_ms + delay * 1000;
        Some(self.next_retry_ms)
    }

    /// Whether a scheduled handshake retry is due.
    #[must_use]
    pub fn retry_due(&self, now_ms: u64) -> bool {
        self.state == SessionState::Closed
            && self.handshake_attempts > 0
            && now_ms >= self.next_retry_ms
    }

    /// Seal a plaintext into a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] without an established session.
    pub fn encrypt(&mut self, plaintext: &[u8], now_ms: u64) -> Result<Vec<u8>> {
        let Some(crypto) = self.crypto.as_mut() else {
            return Err(Error::FriendOffline);
        };
        let record = crypto.seal(plaintext)?;
        self.last_used_ms = now_ms;
        Ok(record)
    }

    /// Open a record into its plaintext.
    ///
    /// During the rekey grace window a record that fails under the
    /// current keys is retried against the previous era; its counter must
    /// still fit the old receive window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] without keys, [`Error::BadMac`]
    /// or [`Error::OutOfWindow`] from the record layer.
    pub fn decrypt(&mut self, record: &[u8], now_ms: u64) -> Result<Vec<u8>> {
        self.expire_previous(now_ms);

        let Some(crypto) = self.crypto.as_mut() else {
            return Err(Error::FriendOffline);
        };

        match crypto.open(record) {
            Ok(plaintext) => {
                self.last_used_ms = now_ms;
                Ok(plaintext)
            }
            Err(hush_crypto::CryptoError::BadMac) => {
                if let Some((old, _)) = self.previous.as_mut() {
                    let plaintext = old.open(record)?;
                    self.last_used_ms = now_ms;
                    return Ok(plaintext);
                }
                Err(Error::BadMac)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the record layer wants a rekey.
    #[must_use]
    pub fn needs_rekey(&self) -> bool {
        self.crypto.as_ref().is_some_and(SessionCrypto::needs_rekey)
    }

    /// Perform a rekey as the sending side.
    ///
    /// Generates a fresh ephemeral, seals it into a rekey record under
    /// the current keys, then swaps to the new era. Returns the record to
    /// transmit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] without an established session.
    pub fn begin_rekey(&mut self, now_ms: u64) -> Result<Vec<u8>> {
        if !self.is_established() {
            return Err(Error::FriendOffline);
        }
        self.state = SessionState::Rekey;

        let ephemeral = PrivateKey::generate(&mut OsRng);
        let ephemeral_public = ephemeral.public_key().to_bytes();

        let peer_static = DhPublicKey::from_bytes(self.peer);
        let shared = ephemeral
            .exchange(&peer_static)
            .ok_or(Error::BadMac)?;

        let record = {
            let crypto = self.crypto.as_mut().ok_or(Error::FriendOffline)?;
            crypto.seal(&ephemeral_public)?
        };

        let keys = derive_rekey_keys(&self.hash, shared.as_bytes(), &ephemeral_public, true);
        self.swap_era(keys, now_ms);
        Ok(record)
    }

    /// Process an incoming rekey record as the receiving side.
    ///
    /// # Errors
    ///
    /// Returns record-layer errors if the rekey record does not
    /// authenticate.
    pub fn handle_rekey(
        &mut self,
        record: &[u8],
        local_secret: &PrivateKey,
        now_ms: u64,
    ) -> Result<()> {
        let payload = self.decrypt(record, now_ms)?;
        let ephemeral_public: [u8; 32] = payload
            .as_slice()
            .try_into()
            .map_err(|_| Error::BadMac)?;

        let shared = local_secret
            .exchange(&DhPublicKey::from_bytes(ephemeral_public))
            .ok_or(Error::BadMac)?;

        let keys = derive_rekey_keys(&self.hash, shared.as_bytes(), &ephemeral_public, false);
        self.swap_era(keys, now_ms);
        Ok(())
    }

    fn swap_era(&mut self, keys: hush_crypto::SessionKeys, now_ms: u64) {
        let old = self.crypto.replace(SessionCrypto::new(&keys));
        if let Some(old) = old {
            self.previous = Some((old, now_ms));
        }
        self.hash = keys.handshake_hash;
        self.state = SessionState::Established;
    }

    fn expire_previous(&mut self, now_ms: u64) {
        if let Some((_, swapped_at)) = self.previous.as_ref() {
            if now_ms.saturating_sub(*swapped_at) > REKEY_GRACE_MS {
                self.previous = None;
            }
        }
    }

    /// Zeroize keys and return to `Closed`.
    pub fn close(&mut self) {
        // SessionCrypto zeroizes on drop
        self.crypto = None;
        self.previous = None;
        self.handshake = None;
        self.hash = [0u8; 32];
        self.state = SessionState::Closed;
        self.handshake_attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_UNIX: u64 = 1_700_000_000;

    fn establish_pair() -> (Session, Session, StaticKeypair, StaticKeypair) {
        let alice_keys = StaticKeypair::generate().unwrap();
        let bob_keys = StaticKeypair::generate().unwrap();
        let mut cache = HandshakeReplayCache::new();

        let mut alice = Session::new(*bob_keys.public_key());
        let mut bob = Session::new(*alice_keys.public_key());

        let msg1 = alice.start_handshake(&alice_keys, 0, NOW_UNIX).unwrap();
        assert_eq!(alice.state(), SessionState::HsInit);

        let (msg2, initiator) = bob
            .accept_handshake(&bob_keys, &msg1, 0, NOW_UNIX, &mut cache)
            .unwrap();
        assert_eq!(initiator, *alice_keys.public_key());
        assert_eq!(bob.state(), SessionState::Established);

        alice.finish_handshake(&msg2, 0).unwrap();
        assert_eq!(alice.state(), SessionState::Established);

        (alice, bob, alice_keys, bob_keys)
    }

    #[test]
    fn test_handshake_and_messaging() {
        let (mut alice, mut bob, _, _) = establish_pair();

        let record = alice.encrypt(b"hello", 10).unwrap();
        assert_eq!(bob.decrypt(&record, 10).unwrap(), b"hello");

        let reply = bob.encrypt(b"hi", 20).unwrap();
        assert_eq!(alice.decrypt(&reply, 20).unwrap(), b"hi");
    }

    #[test]
    fn test_start_over_established_is_busy() {
        let (mut alice, _, alice_keys, _) = establish_pair();
        assert_eq!(
            alice.start_handshake(&alice_keys, 100, NOW_UNIX),
            Err(Error::SessionBusy)
        );
    }

    #[test]
    fn test_encrypt_without_session() {
        let mut session = Session::new([1u8; 32]);
        assert_eq!(session.encrypt(b"x", 0), Err(Error::FriendOffline));
    }

    #[test]
    fn test_handshake_timeout_and_backoff() {
        let keys = StaticKeypair::generate().unwrap();
        let peer = StaticKeypair::generate().unwrap();
        let mut session = Session::new(*peer.public_key());

        session.start_handshake(&keys, 0, NOW_UNIX).unwrap();
        assert!(!session.handshake_expired(HANDSHAKE_TIMEOUT_MS));
        assert!(session.handshake_expired(HANDSHAKE_TIMEOUT_MS + 1));

        // First timeout: retry in 5s
        let retry = session.note_handshake_timeout(40_000).unwrap();
        assert_eq!(retry, 45_000);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.retry_due(44_999));
        assert!(session.retry_due(45_000));

        // Second and third: 10s, 30s
        assert_eq!(session.note_handshake_timeout(50_000), Some(60_000));
        assert_eq!(session.note_handshake_timeout(70_000), Some(100_000));
        // Fourth: 60s
        assert_eq!(session.note_handshake_timeout(110_000), Some(170_000));
        // Fifth: budget spent
        assert_eq!(session.note_handshake_timeout(180_000), None);
    }

    #[test]
    fn test_rekey_swaps_keys_both_sides() {
        let (mut alice, mut bob, alice_keys, bob_keys) = establish_pair();
        let _ = alice_keys;

        let rekey_record = alice.begin_rekey(1000).unwrap();

        let bob_secret = {
            let mut secret = [0u8; 32];
            secret.copy_from_slice(bob_keys.private_key());
            PrivateKey::from_bytes(secret)
        };
        bob.handle_rekey(&rekey_record, &bob_secret, 1000).unwrap();

        // New era works in both directions
        let record = alice.encrypt(b"post-rekey", 2000).unwrap();
        assert_eq!(bob.decrypt(&record, 2000).unwrap(), b"post-rekey");
        let reply = bob.encrypt(b"ack", 2000).unwrap();
        assert_eq!(alice.decrypt(&reply, 2000).unwrap(), b"ack");
    }

    #[test]
    fn test_old_era_record_accepted_during_grace() {
        let (mut alice, mut bob, _, bob_keys) = establish_pair();

        // Alice seals a record, then immediately rekeys
        let in_flight = alice.encrypt(b"in flight", 500).unwrap();
        let rekey_record = alice.begin_rekey(1000).unwrap();

        let bob_secret = {
            let mut secret = [0u8; 32];
            secret.copy_from_slice(bob_keys.private_key());
            PrivateKey::from_bytes(secret)
        };
        bob.handle_rekey(&rekey_record, &bob_secret, 1000).unwrap();

        // The old-era record arrives after the swap and still opens
        assert_eq!(bob.decrypt(&in_flight, 1500).unwrap(), b"in flight");
    }

    #[test]
    fn test_old_era_rejected_after_grace() {
        let (mut alice, mut bob, _, bob_keys) = establish_pair();

        let in_flight = alice.encrypt(b"too late", 500).unwrap();
        let rekey_record = alice.begin_rekey(1000).unwrap();

        let bob_secret = {
            let mut secret = [0u8; 32];
            secret.copy_from_slice(bob_keys.private_key());
            PrivateKey::from_bytes(secret)
        };
        bob.handle_rekey(&rekey_record, &bob_secret, 1000).unwrap();

        // Far past the grace window the old era is gone
        assert!(bob.decrypt(&in_flight, 1000 + REKEY_GRACE_MS + 1).is_err());
    }

    #[test]
    fn test_close_zeroizes_state() {
        let (mut alice, _, _, _) = establish_pair();
        alice.close();

        assert_eq!(alice.state(), SessionState::Closed);
        assert_eq!(alice.encrypt(b"x", 0), Err(Error::FriendOffline));
    }

    #[test]
    fn test_cross_session_decrypt_fails() {
        let (mut alice, _, _, _) = establish_pair();
        let (_, mut other_bob, _, _) = establish_pair();

        let record = alice.encrypt(b"secret", 0).unwrap();
        assert_eq!(other_bob.decrypt(&record, 0), Err(Error::BadMac));
    }
}
