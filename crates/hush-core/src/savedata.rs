//! Versioned savedata persistence.
//!
//! Savedata is an opaque byte sequence: a 4-byte magic, a big-endian
//! version, then a bincode body. It persists everything a node needs to
//! come back as itself: identity secret, nospam, profile, friends with
//! their assigned ids, the request inbox, and the unspent pre-key pool.

use crate::error::{Error, Result};
use hush_crypto::prekey::PreKeyExport;
use serde::{Deserialize, Serialize};

/// Savedata magic bytes.
const MAGIC: [u8; 4] = *b"HSHD";

/// Current savedata version.
const VERSION: u16 = 1;

/// A friend as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedFriend {
    /// Long-term public key
    pub public_key: [u8; 32],
    /// Locally assigned id, preserved across restarts
    pub id: u32,
    /// Last known display name
    pub name: String,
    /// Last known status message
    pub status_message: String,
}

/// A pending friend request as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRequest {
    /// Sender's public key
    pub sender: [u8; 32],
    /// Greeting message
    pub message: String,
    /// UNIX seconds of receipt
    pub received_at: u64,
}

/// The full persisted state.
#[derive(Clone, Serialize, Deserialize)]
pub struct Savedata {
    /// Identity secret key
    pub secret_key: [u8; 32],
    /// Nospam; zero means "generate fresh on load"
    pub nospam: [u8; 4],
    /// Own display name
    pub name: String,
    /// Own status message
    pub status_message: String,
    /// Friend set with assigned ids
    pub friends: Vec<SavedFriend>,
    /// Unconsumed request inbox
    pub requests: Vec<SavedRequest>,
    /// Unspent pre-keys (private halves included)
    pub prekeys: Vec<PreKeyExport>,
}

impl Savedata {
    /// Serialize to the versioned wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SavedataCorrupt`] on a serialization failure
    /// (which indicates internal state corruption, not bad input).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|_| Error::SavedataCorrupt)?;

        let mut bytes = Vec::with_capacity(6 + body.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_be_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Parse a versioned savedata blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SavedataCorrupt`] for bad magic or body, and
    /// [`Error::SavedataVersionUnsupported`] for unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 || bytes[..4] != MAGIC {
            return Err(Error::SavedataCorrupt);
        }

        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(Error::SavedataVersionUnsupported);
        }

        bincode::deserialize(&bytes[6..]).map_err(|_| Error::SavedataCorrupt)
    }
}

impl std::fmt::Debug for Savedata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Savedata")
            .field("nospam", &hex::encode(self.nospam))
            .field("name", &self.name)
            .field("friends", &self.friends.len())
            .field("requests", &self.requests.len())
            .field("prekeys", &self.prekeys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Savedata {
        Savedata {
            secret_key: [7u8; 32],
            nospam: [1, 2, 3, 4],
            name: "alice".into(),
            status_message: "around".into(),
            friends: vec![
                SavedFriend {
                    public_key: [1u8; 32],
                    id: 1,
                    name: "bob".into(),
                    status_message: String::new(),
                },
                SavedFriend {
                    public_key: [2u8; 32],
                    id: 4,
                    name: String::new(),
                    status_message: "busy".into(),
                },
            ],
            requests: vec![SavedRequest {
                sender: [3u8; 32],
                message: "hello, please add me".into(),
                received_at: 1_700_000_000,
            }],
            prekeys: Vec::new(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let original = sample();
        let decoded = Savedata::decode(&original.encode().unwrap()).unwrap();

        assert_eq!(decoded.secret_key, original.secret_key);
        assert_eq!(decoded.nospam, original.nospam);
        assert_eq!(decoded.name, original.name);
        assert_eq!(decoded.status_message, original.status_message);
        assert_eq!(decoded.friends, original.friends);
        assert_eq!(decoded.requests, original.requests);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Savedata::decode(&bytes), Err(Error::SavedataCorrupt)));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[5] = 99;
        assert!(matches!(
            Savedata::decode(&bytes),
            Err(Error::SavedataVersionUnsupported)
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            Savedata::decode(&bytes[..bytes.len() / 2]),
            Err(Error::SavedataCorrupt)
        ));
        assert!(matches!(Savedata::decode(&[]), Err(Error::SavedataCorrupt)));
    }
}
