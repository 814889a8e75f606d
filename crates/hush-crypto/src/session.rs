//! Record-layer encryption state for an established session.
//!
//! Wraps the directional AEAD keys from a completed handshake with
//! monotonic send counters and a sliding receive window. Records are
//! self-framing: an 8-byte big-endian counter followed by the AEAD
//! ciphertext, authenticated against the handshake hash.

use crate::aead::{AeadKey, Nonce};
use crate::replay::RecordWindow;
use crate::{CryptoError, SessionKeys};
use zeroize::ZeroizeOnDrop;

/// Record counter size prepended to every sealed record.
pub const RECORD_COUNTER_SIZE: usize = 8;

/// Minimum size of a valid record: counter plus AEAD tag.
pub const MIN_RECORD_SIZE: usize = RECORD_COUNTER_SIZE + crate::AEAD_TAG_SIZE;

/// Send counter value at which sealing refuses outright.
pub const REKEY_THRESHOLD: u64 = 1 << 20;

/// Headroom below the hard threshold where `needs_rekey` starts
/// reporting true, leaving counters for the rekey exchange itself.
pub const REKEY_MARGIN: u64 = 1024;

/// Bidirectional record encryption state.
#[derive(ZeroizeOnDrop)]
pub struct SessionCrypto {
    send_key: AeadKey,
    recv_key: AeadKey,
    /// Handshake hash bound into every record as associated data
    handshake_hash: [u8; 32],
    #[zeroize(skip)]
    send_counter: u64,
    #[zeroize(skip)]
    recv_window: RecordWindow,
}

impl SessionCrypto {
    /// Create record state from handshake-derived keys.
    #[must_use]
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            send_key: AeadKey::new(keys.send_key),
            recv_key: AeadKey::new(keys.recv_key),
            handshake_hash: keys.handshake_hash,
            send_counter: 0,
            recv_window: RecordWindow::new(),
        }
    }

    /// Seal a plaintext into a record.
    ///
    /// The record carries its counter in the clear; the counter is also
    /// mixed into the associated data so it cannot be rewritten in flight.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CounterExhausted`] once the send counter
    /// reaches the rekey threshold, and [`CryptoError::EncryptionFailed`]
    /// on AEAD failure.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.send_counter >= REKEY_THRESHOLD {
            return Err(CryptoError::CounterExhausted);
        }

        let counter = self.send_counter;
        let nonce = Nonce::from_counter(counter);
        let aad = self.record_aad(counter);

        let ciphertext = self.send_key.seal(&nonce, plaintext, &aad)?;
        self.send_counter += 1;

        let mut record = Vec::with_capacity(RECORD_COUNTER_SIZE + ciphertext.len());
        record.extend_from_slice(&counter.to_be_bytes());
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Open a record into its plaintext.
    ///
    /// The counter is validated against the sliding window before
    /// decryption and committed to the window only after authentication
    /// succeeds, so forged counters cannot poison the window.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::OutOfWindow`] for counters outside or already
    /// seen within the window, [`CryptoError::BadMac`] on authentication
    /// failure.
    pub fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < MIN_RECORD_SIZE {
            return Err(CryptoError::BadMac);
        }

        let mut counter_bytes = [0u8; RECORD_COUNTER_SIZE];
        counter_bytes.copy_from_slice(&record[..RECORD_COUNTER_SIZE]);
        let counter = u64::from_be_bytes(counter_bytes);

        self.recv_window.check(counter)?;

        let nonce = Nonce::from_counter(counter);
        let aad = self.record_aad(counter);
        let plaintext = self
            .recv_key
            .open(&nonce, &record[RECORD_COUNTER_SIZE..], &aad)?;

        self.recv_window.commit(counter);
        Ok(plaintext)
    }

    /// Current send counter.
    #[must_use]
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// Highest receive counter accepted so far.
    #[must_use]
    pub fn recv_highest(&self) -> Option<u64> {
        self.recv_window.highest()
    }

    /// Whether the send counter has entered the rekey margin.
    #[must_use]
    pub fn needs_rekey(&self) -> bool {
        self.send_counter >= REKEY_THRESHOLD - REKEY_MARGIN
    }

    /// Swap in fresh directional keys.
    ///
    /// Counters and the receive window reset together with the keys, as a
    /// single state update.
    pub fn update_keys(&mut self, keys: &SessionKeys) {
        self.send_key = AeadKey::new(keys.send_key);
        self.recv_key = AeadKey::new(keys.recv_key);
        self.handshake_hash = keys.handshake_hash;
        self.send_counter = 0;
        self.recv_window.reset();
    }

    fn record_aad(&self, counter: u64) -> [u8; 40] {
        let mut aad = [0u8; 40];
        aad[..32].copy_from_slice(&self.handshake_hash);
        aad[32..].copy_from_slice(&counter.to_be_bytes());
        aad
    }
}
