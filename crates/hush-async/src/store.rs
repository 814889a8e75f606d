//! Relay-side obfuscated message store.
//!
//! A storage node holds opaque envelopes bucketed by pseudonym and epoch.
//! It never sees sender, recipient, or plaintext; its only jobs are
//! bounded retention, epoch rotation, and handing envelopes back to
//! whoever can name the pseudonym. Pseudonym lookups compare in constant
//! time since the query value is attacker-supplied.

use crate::epoch::{EPOCH_WINDOW, validate_epoch};
use crate::error::AsyncError;
use crate::pseudonym::Pseudonym;
use serde::{Deserialize, Serialize};

/// Most envelopes returned per `get` call.
pub const MAX_RESULTS_PER_GET: usize = 16;

/// Retention cap per pseudonym bucket.
const PER_PSEUDONYM_CAP: usize = 32;

/// Retention cap across the whole store.
const TOTAL_CAP: usize = 4096;

/// Largest accepted stored payload (top padding bucket plus envelope
/// framing headroom).
const MAX_PAYLOAD: usize = 16384 + 128;

/// One stored envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEnvelope {
    /// Content-derived id used for replay deduplication
    pub message_id: [u8; 32],
    /// Epoch the sender stamped
    pub epoch: u64,
    /// Opaque encoded envelope
    pub payload: Vec<u8>,
}

/// The store: pseudonym buckets scanned with constant-time comparison.
#[derive(Default)]
pub struct ObfuscatedStore {
    buckets: Vec<(Pseudonym, Vec<StoredEnvelope>)>,
    total: usize,
}

impl ObfuscatedStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an envelope for storage.
    ///
    /// # Errors
    ///
    /// - [`AsyncError::StaleEpoch`] outside the acceptance window
    /// - [`AsyncError::Malformed`] for oversized payloads
    /// - [`AsyncError::Relay`] when capacity is exhausted
    pub fn put(
        &mut self,
        pseudonym: Pseudonym,
        epoch: u64,
        message_id: [u8; 32],
        payload: Vec<u8>,
        current_epoch: u64,
    ) -> Result<(), AsyncError> {
        validate_epoch(current_epoch, epoch)?;

        if payload.len() > MAX_PAYLOAD {
            return Err(AsyncError::Malformed(format!(
                "stored payload of {} bytes",
                payload.len()
            )));
        }

        let bucket = match self.find_bucket_mut(&pseudonym) {
            Some(index) => &mut self.buckets[index].1,
            None => {
                self.buckets.push((pseudonym, Vec::new()));
                &mut self.buckets.last_mut().expect("just pushed").1
            }
        };

        // Replayed puts are idempotent
        if bucket.iter().any(|e| e.message_id == message_id) {
            return Ok(());
        }

        if bucket.len() >= PER_PSEUDONYM_CAP || self.total >= TOTAL_CAP {
            return Err(AsyncError::Relay("store at capacity".into()));
        }

        bucket.push(StoredEnvelope {
            message_id,
            epoch,
            payload,
        });
        self.total += 1;
        Ok(())
    }

    /// Fetch envelopes under a pseudonym for one epoch.
    ///
    /// Returns at most [`MAX_RESULTS_PER_GET`] entries. Entries stay in
    /// the store until epoch rotation purges them, so a crashed retriever
    /// can come back.
    #[must_use]
    pub fn get(&self, pseudonym: &Pseudonym, epoch: u64) -> Vec<StoredEnvelope> {
        let Some(index) = self.find_bucket(pseudonym) else {
            return Vec::new();
        };

        self.buckets[index]
            .1
            .iter()
            .filter(|e| e.epoch == epoch)
            .take(MAX_RESULTS_PER_GET)
            .cloned()
            .collect()
    }

    /// Purge entries older than the retention window and compact empty
    /// pseudonym buckets.
    pub fn cleanup_old_epochs(&mut self, current_epoch: u64) {
        let mut removed = 0usize;
        for (_, bucket) in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|e| current_epoch.saturating_sub(e.epoch) <= EPOCH_WINDOW);
            removed += before - bucket.len();
        }
        self.buckets.retain(|(_, bucket)| !bucket.is_empty());
        self.total -= removed;

        if removed > 0 {
            tracing::debug!(removed, current_epoch, "purged expired stored messages");
        }
    }

    /// Total stored envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of live pseudonym buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn find_bucket(&self, pseudonym: &Pseudonym) -> Option<usize> {
        // Constant-time compare against every key: the probe value is
        // attacker-supplied
        let mut found = None;
        for (i, (key, _)) in self.buckets.iter().enumerate() {
            if key.ct_matches(pseudonym) && found.is_none() {
                found = Some(i);
            }
        }
        found
    }

    fn find_bucket_mut(&mut self, pseudonym: &Pseudonym) -> Option<usize> {
        self.find_bucket(pseudonym)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudonym(tag: u8) -> Pseudonym {
        Pseudonym::from_bytes([tag; 32])
    }

    fn message_id(tag: u8) -> [u8; 32] {
        [tag; 32]
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut store = ObfuscatedStore::new();
        store
            .put(pseudonym(1), 10, message_id(1), vec![1, 2, 3], 10)
            .unwrap();

        let got = store.get(&pseudonym(1), 10);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, vec![1, 2, 3]);

        // Different epoch or pseudonym: nothing
        assert!(store.get(&pseudonym(1), 11).is_empty());
        assert!(store.get(&pseudonym(2), 10).is_empty());
    }

    #[test]
    fn test_stale_epoch_rejected_on_put() {
        let mut store = ObfuscatedStore::new();
        assert_eq!(
            store.put(pseudonym(1), 6, message_id(1), vec![1], 10),
            Err(AsyncError::StaleEpoch)
        );
        // Boundary: exactly window-old is accepted
        store.put(pseudonym(1), 7, message_id(1), vec![1], 10).unwrap();
    }

    #[test]
    fn test_replayed_put_idempotent() {
        let mut store = ObfuscatedStore::new();
        store.put(pseudonym(1), 10, message_id(1), vec![1], 10).unwrap();
        store.put(pseudonym(1), 10, message_id(1), vec![1], 10).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&pseudonym(1), 10).len(), 1);
    }

    #[test]
    fn test_cleanup_purges_and_compacts() {
        let mut store = ObfuscatedStore::new();
        store.put(pseudonym(1), 10, message_id(1), vec![1], 10).unwrap();
        store.put(pseudonym(2), 12, message_id(2), vec![2], 12).unwrap();

        // Epoch advances far past the first message's epoch
        store.cleanup_old_epochs(14);
        assert_eq!(store.len(), 1);
        assert_eq!(store.bucket_count(), 1);
        assert!(store.get(&pseudonym(1), 10).is_empty());
        assert_eq!(store.get(&pseudonym(2), 12).len(), 1);
    }

    #[test]
    fn test_per_pseudonym_cap() {
        let mut store = ObfuscatedStore::new();
        for i in 0..32u8 {
            store
                .put(pseudonym(1), 10, message_id(i), vec![i], 10)
                .unwrap();
        }
        assert!(matches!(
            store.put(pseudonym(1), 10, message_id(200), vec![0], 10),
            Err(AsyncError::Relay(_))
        ));
    }

    #[test]
    fn test_get_bounded() {
        let mut store = ObfuscatedStore::new();
        for i in 0..20u8 {
            store
                .put(pseudonym(1), 10, message_id(i), vec![i], 10)
                .unwrap();
        }
        assert_eq!(store.get(&pseudonym(1), 10).len(), MAX_RESULTS_PER_GET);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut store = ObfuscatedStore::new();
        assert!(matches!(
            store.put(pseudonym(1), 10, message_id(1), vec![0; 20000], 10),
            Err(AsyncError::Malformed(_))
        ));
    }
}
