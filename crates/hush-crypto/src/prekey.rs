//! One-time pre-keys for offline forward secrecy.
//!
//! A recipient mints batches of ephemeral X25519 keypairs and publishes the
//! public halves. A sender who finds the recipient offline performs a DH
//! against one published pre-key to seal a message the recipient can open
//! later, without a live handshake. Each pre-key is consumed at most once
//! on either side.
//!
//! Two watermarks govern pool health: dropping below [`LOW_WATERMARK`]
//! triggers an asynchronous refresh, and a sender whose stock of a
//! recipient's pre-keys falls below [`MINIMUM`] refuses new sends until the
//! stock is replenished.

use crate::x25519::PrivateKey;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pool size below which an asynchronous refresh is requested.
pub const LOW_WATERMARK: usize = 10;

/// Pool size below which new sends are refused.
pub const MINIMUM: usize = 5;

/// Published (public) half of a one-time pre-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyRecord {
    /// Pool-unique identifier, carried in envelope headers
    pub id: u32,
    /// X25519 public key
    pub public: [u8; 32],
    /// Epoch in which the key was minted
    pub issued_epoch: u64,
}

/// Serializable private half, used only by savedata.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyExport {
    /// Pool-unique identifier
    pub id: u32,
    /// Raw X25519 secret
    pub secret: [u8; 32],
    /// Epoch in which the key was minted
    pub issued_epoch: u64,
}

struct PreKey {
    secret: PrivateKey,
    public: [u8; 32],
    issued_epoch: u64,
}

/// The node's own pool of unspent pre-keys.
pub struct PreKeyPool {
    keys: HashMap<u32, PreKey>,
    next_id: u32,
}

impl PreKeyPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            next_id: 1,
        }
    }

    /// Mint `count` fresh pre-keys, returning the publishable records.
    pub fn mint<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        count: usize,
        epoch: u64,
    ) -> Vec<PreKeyRecord> {
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);

            let secret = PrivateKey::generate(rng);
            let public = secret.public_key().to_bytes();
            self.keys.insert(
                id,
                PreKey {
                    secret,
                    public,
                    issued_epoch: epoch,
                },
            );
            records.push(PreKeyRecord {
                id,
                public,
                issued_epoch: epoch,
            });
        }
        records
    }

    /// Consume the pre-key with the given id.
    ///
    /// Returns `None` if the id is unknown or was already consumed; each
    /// id yields its secret exactly once.
    pub fn take(&mut self, id: u32) -> Option<PrivateKey> {
        self.keys.remove(&id).map(|key| key.secret)
    }

    /// Number of unspent keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether the pool has dropped below the refresh watermark.
    #[must_use]
    pub fn needs_refill(&self) -> bool {
        self.keys.len() < LOW_WATERMARK
    }

    /// Publishable records for every unspent key.
    #[must_use]
    pub fn records(&self) -> Vec<PreKeyRecord> {
        let mut records: Vec<_> = self
            .keys
            .iter()
            .map(|(id, key)| PreKeyRecord {
                id: *id,
                public: key.public,
                issued_epoch: key.issued_epoch,
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Export private halves for savedata.
    #[must_use]
    pub fn export(&self) -> Vec<PreKeyExport> {
        let mut exports: Vec<_> = self
            .keys
            .iter()
            .map(|(id, key)| PreKeyExport {
                id: *id,
                secret: key.secret.to_bytes(),
                issued_epoch: key.issued_epoch,
            })
            .collect();
        exports.sort_by_key(|e| e.id);
        exports
    }

    /// Rebuild a pool from exported savedata.
    #[must_use]
    pub fn restore(exports: Vec<PreKeyExport>) -> Self {
        let mut keys = HashMap::new();
        let mut next_id = 1u32;
        for export in exports {
            let secret = PrivateKey::from_bytes(export.secret);
            let public = secret.public_key().to_bytes();
            next_id = next_id.max(export.id.wrapping_add(1).max(1));
            keys.insert(
                export.id,
                PreKey {
                    secret,
                    public,
                    issued_epoch: export.issued_epoch,
                },
            );
        }
        Self { keys, next_id }
    }
}

impl Default for PreKeyPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A sender's stock of one peer's published pre-keys.
#[derive(Debug, Clone, Default)]
pub struct RemotePreKeys {
    records: Vec<PreKeyRecord>,
}

impl RemotePreKeys {
    /// Create an empty stock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Merge a fresh batch, ignoring ids already held.
    pub fn replenish(&mut self, batch: Vec<PreKeyRecord>) {
        for record in batch {
            if !self.records.iter().any(|r| r.id == record.id) {
                self.records.push(record);
            }
        }
    }

    /// Number of unspent records held.
    #[must_use]
    pub fn available(&self) -> usize {
        self.records.len()
    }

    /// Whether a refresh should be requested.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.records.len() < LOW_WATERMARK
    }

    /// Take one record for an outbound send.
    ///
    /// Returns `None` when the stock is below [`MINIMUM`]: sends refuse
    /// rather than draining the last keys, even while a refresh is in
    /// flight.
    pub fn take_for_send(&mut self) -> Option<PreKeyRecord> {
        if self.records.len() < MINIMUM {
            return None;
        }
        self.records.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_mint_and_take_once() {
        let mut pool = PreKeyPool::new();
        let records = pool.mint(&mut OsRng, 3, 7);

        assert_eq!(records.len(), 3);
        assert_eq!(pool.len(), 3);

        let id = records[0].id;
        let secret = pool.take(id).unwrap();
        assert_eq!(secret.public_key().to_bytes(), records[0].public);

        // Second take of the same id yields nothing
        assert!(pool.take(id).is_none());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_ids_unique_and_increasing() {
        let mut pool = PreKeyPool::new();
        let a = pool.mint(&mut OsRng, 5, 0);
        let b = pool.mint(&mut OsRng, 5, 1);

        let mut ids: Vec<_> = a.iter().chain(b.iter()).map(|r| r.id).collect();
        let unique_before = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), unique_before);
    }

    #[test]
    fn test_needs_refill_watermark() {
        let mut pool = PreKeyPool::new();
        assert!(pool.needs_refill());

        pool.mint(&mut OsRng, LOW_WATERMARK, 0);
        assert!(!pool.needs_refill());

        let id = pool.records()[0].id;
        pool.take(id);
        assert!(pool.needs_refill());
    }

    #[test]
    fn test_export_restore_roundtrip() {
        let mut pool = PreKeyPool::new();
        let records = pool.mint(&mut OsRng, 4, 9);

        let restored = PreKeyPool::restore(pool.export());
        assert_eq!(restored.len(), 4);
        assert_eq!(restored.records(), records);

        // Restored pool continues id allocation past the old ids
        let mut restored = restored;
        let fresh = restored.mint(&mut OsRng, 1, 10);
        assert!(fresh[0].id > records.last().unwrap().id);
    }

    #[test]
    fn test_remote_stock_minimum_refusal() {
        let mut pool = PreKeyPool::new();
        let mut stock = RemotePreKeys::new();
        stock.replenish(pool.mint(&mut OsRng, MINIMUM, 0));

        // Exactly at the minimum: one take succeeds, dropping below it
        assert!(stock.take_for_send().is_some());
        // Below minimum: refused even though records remain
        assert!(stock.available() > 0);
        assert!(stock.take_for_send().is_none());
    }

    #[test]
    fn test_remote_stock_replenish_dedup() {
        let mut pool = PreKeyPool::new();
        let batch = pool.mint(&mut OsRng, 6, 0);

        let mut stock = RemotePreKeys::new();
        stock.replenish(batch.clone());
        stock.replenish(batch);
        assert_eq!(stock.available(), 6);
    }

    #[test]
    fn test_remote_stock_refresh_watermark() {
        let mut pool = PreKeyPool::new();
        let mut stock = RemotePreKeys::new();
        assert!(stock.needs_refresh());

        stock.replenish(pool.mint(&mut OsRng, LOW_WATERMARK, 0));
        assert!(!stock.needs_refresh());
    }
}
