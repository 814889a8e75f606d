//! Property-based tests for HUSH invariants.
//!
//! Uses proptest to verify protocol invariants across large input
//! spaces: savedata round-trips, id allocation, checksum sensitivity,
//! record-layer ordering, DHT closeness, and epoch windows.

use proptest::prelude::*;

// ============================================================================
// Savedata round-trip
// ============================================================================

mod savedata_properties {
    use super::*;
    use hush_core::savedata::{SavedFriend, Savedata};

    fn arb_friend() -> impl Strategy<Value = SavedFriend> {
        (any::<[u8; 32]>(), 1u32..10_000, ".{0,32}", ".{0,64}").prop_map(
            |(public_key, id, name, status_message)| SavedFriend {
                public_key,
                id,
                name,
                status_message,
            },
        )
    }

    proptest! {
        /// decode(encode(s)) preserves every observable field.
        #[test]
        fn savedata_roundtrip(
            secret_key in any::<[u8; 32]>(),
            nospam in any::<[u8; 4]>(),
            name in ".{0,32}",
            status_message in ".{0,64}",
            mut friends in prop::collection::vec(arb_friend(), 0..8),
        ) {
            // Distinct ids and keys, as the registry guarantees
            friends.sort_by_key(|f| f.id);
            friends.dedup_by_key(|f| f.id);
            friends.dedup_by_key(|f| f.public_key);

            let original = Savedata {
                secret_key,
                nospam,
                name,
                status_message,
                friends,
                requests: Vec::new(),
                prekeys: Vec::new(),
            };

            let decoded = Savedata::decode(&original.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded.secret_key, original.secret_key);
            prop_assert_eq!(decoded.nospam, original.nospam);
            prop_assert_eq!(decoded.name, original.name);
            prop_assert_eq!(decoded.status_message, original.status_message);
            prop_assert_eq!(decoded.friends, original.friends);
        }

        /// Corrupting the body never yields a quiet success with wrong data.
        #[test]
        fn savedata_truncation_detected(cut in 0usize..6) {
            let original = Savedata {
                secret_key: [7; 32],
                nospam: [1, 2, 3, 4],
                name: "n".into(),
                status_message: String::new(),
                friends: Vec::new(),
                requests: Vec::new(),
                prekeys: Vec::new(),
            };
            let bytes = original.encode().unwrap();
            prop_assert!(Savedata::decode(&bytes[..cut]).is_err());
        }
    }
}

// ============================================================================
// Friend id allocation
// ============================================================================

mod friend_id_properties {
    use super::*;
    use hush_core::friend::FriendRegistry;

    proptest! {
        /// Ids are distinct, strictly positive, and monotonically
        /// increasing from 1, regardless of interleaved removals.
        #[test]
        fn ids_distinct_positive_increasing(
            keys in prop::collection::hash_set(any::<[u8; 32]>(), 1..24),
            remove_mask in any::<u32>(),
        ) {
            let mut registry = FriendRegistry::new();
            let mut assigned = Vec::new();

            for (index, key) in keys.into_iter().enumerate() {
                let id = registry.add(key, 0).unwrap();
                assigned.push(id);

                // Occasionally remove the friend we just added
                if remove_mask & (1 << (index % 32)) != 0 {
                    registry.remove(id).unwrap();
                }
            }

            prop_assert_eq!(assigned[0], 1);
            for pair in assigned.windows(2) {
                prop_assert!(pair[1] > pair[0], "ids must strictly increase");
            }
            for id in assigned {
                prop_assert!(id > 0);
            }
        }
    }
}

// ============================================================================
// Nospam freshness
// ============================================================================

mod nospam_properties {
    use hush_core::identity::Identity;

    #[test]
    fn fresh_nospams_nonzero_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let identity = Identity::generate().unwrap();
            let nospam = identity.nospam();
            assert_ne!(nospam, [0u8; 4]);
            assert!(seen.insert(nospam), "duplicate nospam across 10 nodes");
        }
    }
}

// ============================================================================
// ToxID checksum
// ============================================================================

mod toxid_properties {
    use super::*;
    use hush_core::ToxId;

    proptest! {
        /// Any single-bit flip in the first 36 bytes alters the checksum.
        #[test]
        fn single_bit_flip_changes_checksum(
            public_key in any::<[u8; 32]>(),
            nospam in any::<[u8; 4]>(),
            bit in 0usize..(36 * 8),
        ) {
            let original = ToxId::new(public_key, nospam);
            let mut bytes = original.to_bytes();
            bytes[bit / 8] ^= 1 << (bit % 8);

            let mut flipped_key = [0u8; 32];
            flipped_key.copy_from_slice(&bytes[..32]);
            let mut flipped_nospam = [0u8; 4];
            flipped_nospam.copy_from_slice(&bytes[32..36]);
            let flipped = ToxId::new(flipped_key, flipped_nospam);

            prop_assert_ne!(original.checksum(), flipped.checksum());
        }

        /// Hex round-trip is lossless and uppercase.
        #[test]
        fn hex_roundtrip(public_key in any::<[u8; 32]>(), nospam in any::<[u8; 4]>()) {
            let id = ToxId::new(public_key, nospam);
            let hex = id.to_hex();
            prop_assert_eq!(hex.len(), 76);
            prop_assert_eq!(&hex, &hex.to_uppercase());
            prop_assert_eq!(ToxId::from_hex(&hex).unwrap(), id);
        }
    }
}

// ============================================================================
// Record layer: round-trip, cross-session, ordering window
// ============================================================================

mod record_properties {
    use super::*;
    use hush_crypto::session::SessionCrypto;
    use hush_crypto::{CryptoError, SessionKeys};

    fn paired(hash: [u8; 32]) -> (SessionCrypto, SessionCrypto) {
        let a = SessionKeys {
            send_key: [1; 32],
            recv_key: [2; 32],
            handshake_hash: hash,
        };
        let b = SessionKeys {
            send_key: [2; 32],
            recv_key: [1; 32],
            handshake_hash: hash,
        };
        (SessionCrypto::new(&a), SessionCrypto::new(&b))
    }

    proptest! {
        /// decrypt(encrypt(p)) == p for any plaintext within bounds, and
        /// a different session rejects the record.
        #[test]
        fn record_roundtrip_and_cross_session(
            plaintext in prop::collection::vec(any::<u8>(), 1..1372),
        ) {
            let (mut alice, mut bob) = paired([9; 32]);
            let record = alice.seal(&plaintext).unwrap();
            prop_assert_eq!(bob.open(&record).unwrap(), plaintext);

            let (_, mut stranger) = paired([10; 32]);
            prop_assert_eq!(stranger.open(&record), Err(CryptoError::BadMac));
        }

        /// Records are accepted in any order within the 64-counter
        /// window; anything at or below highest − 64 is rejected.
        #[test]
        fn ordering_window(order in Just((0..32usize).collect::<Vec<_>>()).prop_shuffle()) {
            let (mut alice, mut bob) = paired([9; 32]);

            let records: Vec<Vec<u8>> = (0..32)
                .map(|i| alice.seal(format!("m{i}").as_bytes()).unwrap())
                .collect();

            // Deliver all 32 in a random order: every one lands
            for &index in &order {
                prop_assert!(bob.open(&records[index]).is_ok());
            }

            // Push the window far ahead, then an ancient record fails
            let early = alice.seal(b"early").unwrap();
            for _ in 0..100 {
                let record = alice.seal(b"filler").unwrap();
                bob.open(&record).unwrap();
            }
            prop_assert_eq!(bob.open(&early), Err(CryptoError::OutOfWindow));
        }
    }
}

// ============================================================================
// DHT closeness and bucket capacity
// ============================================================================

mod dht_properties {
    use super::*;
    use hush_discovery::{NodeId, RoutingTable, routing::K};
    use std::net::SocketAddr;

    fn addr(i: u16) -> SocketAddr {
        format!("10.1.{}.{}:33445", i / 256, i % 256).parse().unwrap()
    }

    proptest! {
        /// find_closest returns the k nodes with globally smallest XOR
        /// distance to the target.
        #[test]
        fn closest_matches_brute_force(
            local in any::<[u8; 32]>(),
            nodes in prop::collection::hash_set(any::<[u8; 32]>(), 1..64),
            target in any::<[u8; 32]>(),
        ) {
            let local = NodeId::from_bytes(local);
            let target = NodeId::from_bytes(target);
            let mut table = RoutingTable::new(local);

            let mut inserted: Vec<NodeId> = Vec::new();
            for (i, bytes) in nodes.into_iter().enumerate() {
                let id = NodeId::from_bytes(bytes);
                if id != local {
                    table.insert(id, addr(u16::try_from(i).unwrap()), 0);
                }
            }
            for node in table.iter_nodes() {
                inserted.push(node.id);
            }

            let mut expected = inserted.clone();
            expected.sort_by(|a, b| a.distance(&target).cmp(&b.distance(&target)));
            expected.truncate(K);

            let got: Vec<NodeId> = table
                .find_closest(&target, K)
                .into_iter()
                .map(|n| n.id)
                .collect();

            prop_assert_eq!(got, expected);
        }

        /// No bucket ever exceeds k entries, whatever the insert order.
        #[test]
        fn bucket_capacity_bound(
            local in any::<[u8; 32]>(),
            nodes in prop::collection::vec(any::<[u8; 32]>(), 0..256),
        ) {
            let local = NodeId::from_bytes(local);
            let mut table = RoutingTable::new(local);

            for (i, bytes) in nodes.into_iter().enumerate() {
                table.insert(NodeId::from_bytes(bytes), addr(u16::try_from(i).unwrap()), 0);
            }

            for index in 0..256 {
                if let Some(bucket) = table.bucket(index) {
                    prop_assert!(bucket.len() <= K);
                }
            }
        }
    }
}

// ============================================================================
// Pseudonyms and epochs
// ============================================================================

mod async_properties {
    use super::*;
    use hush_async::{EPOCH_WINDOW, Pseudonym, validate_epoch};

    proptest! {
        /// Pseudonym derivation is pure and epoch-separated.
        #[test]
        fn pseudonym_pure_and_epoch_distinct(
            recipient in any::<[u8; 32]>(),
            epoch_a in any::<u64>(),
            epoch_b in any::<u64>(),
        ) {
            prop_assert_eq!(
                Pseudonym::derive(&recipient, epoch_a),
                Pseudonym::derive(&recipient, epoch_a)
            );
            if epoch_a != epoch_b {
                prop_assert_ne!(
                    Pseudonym::derive(&recipient, epoch_a),
                    Pseudonym::derive(&recipient, epoch_b)
                );
            }
        }

        /// The epoch window accepts exactly |current − e| <= 3.
        #[test]
        fn epoch_window_boundary(current in 100u64..1_000_000, offset in 0u64..32) {
            let accept_low = validate_epoch(current, current - offset.min(current));
            let accept_high = validate_epoch(current, current + offset);

            if offset <= EPOCH_WINDOW {
                prop_assert!(accept_low.is_ok());
                prop_assert!(accept_high.is_ok());
            } else {
                prop_assert!(accept_high.is_err());
                if offset <= current {
                    prop_assert!(accept_low.is_err());
                }
            }
        }
    }
}

// ============================================================================
// Pre-key minimum
// ============================================================================

mod prekey_properties {
    use super::*;
    use hush_crypto::prekey::{MINIMUM, PreKeyPool, RemotePreKeys};
    use rand::rngs::OsRng;

    proptest! {
        /// Sends refuse whenever the stock is below the minimum, even
        /// with keys still present.
        #[test]
        fn sends_refused_below_minimum(stocked in 0usize..16) {
            let mut pool = PreKeyPool::new();
            let mut stock = RemotePreKeys::new();
            stock.replenish(pool.mint(&mut OsRng, stocked, 0));

            let taken = stock.take_for_send();
            if stocked < MINIMUM {
                prop_assert!(taken.is_none());
            } else {
                prop_assert!(taken.is_some());
            }
        }
    }
}
