//! Friend registry and request inbox.
//!
//! Friend ids are local handles: allocated from 1, strictly increasing,
//! never reused within a run. Id 0 is the "not found" sentinel returned
//! by lookup functions and is never assigned.

use crate::PublicKey;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Local friend handle.
pub type FriendId = u32;

/// Sentinel id meaning "no such friend".
pub const NO_FRIEND: FriendId = 0;

/// Display name byte limit.
pub const MAX_NAME_SIZE: usize = 128;

/// Status message byte limit.
pub const MAX_STATUS_MESSAGE_SIZE: usize = 1007;

/// Message byte limit (also bounds friend request greetings).
pub const MAX_MESSAGE_SIZE: usize = 1372;

/// One friend's profile state.
#[derive(Debug, Clone)]
pub struct Friend {
    /// Local handle
    pub id: FriendId,
    /// The friend's long-term public key
    pub public_key: PublicKey,
    /// Last received display name
    pub name: String,
    /// Last received status message
    pub status_message: String,
    /// Whether the friend is currently typing
    pub typing: bool,
    /// UNIX seconds of last observed activity
    pub last_seen: u64,
}

/// A pending incoming friend request.
#[derive(Debug, Clone)]
pub struct FriendRequest {
    /// Sender's public key
    pub sender: PublicKey,
    /// Greeting message
    pub message: String,
    /// UNIX seconds of receipt
    pub received_at: u64,
}

/// The friend map and request inbox.
#[derive(Debug)]
pub struct FriendRegistry {
    friends: HashMap<FriendId, Friend>,
    by_key: HashMap<PublicKey, FriendId>,
    next_id: FriendId,
    requests: Vec<FriendRequest>,
}

impl Default for FriendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FriendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            friends: HashMap::new(),
            by_key: HashMap::new(),
            next_id: 1,
            requests: Vec::new(),
        }
    }

    /// Add a friend by public key, allocating the next id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendAlreadyExists`] for a known key.
    pub fn add(&mut self, public_key: PublicKey, now: u64) -> Result<FriendId> {
        if self.by_key.contains_key(&public_key) {
            return Err(Error::FriendAlreadyExists);
        }

        let id = self.next_id;
        self.next_id += 1;

        self.friends.insert(
            id,
            Friend {
                id,
                public_key,
                name: String::new(),
                status_message: String::new(),
                typing: false,
                last_seen: now,
            },
        );
        self.by_key.insert(public_key, id);
        Ok(id)
    }

    /// Re-insert a friend loaded from savedata under its original id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendAlreadyExists`] on id or key collision.
    pub fn restore(&mut self, friend: Friend) -> Result<()> {
        if friend.id == NO_FRIEND
            || self.friends.contains_key(&friend.id)
            || self.by_key.contains_key(&friend.public_key)
        {
            return Err(Error::FriendAlreadyExists);
        }
        self.next_id = self.next_id.max(friend.id + 1);
        self.by_key.insert(friend.public_key, friend.id);
        self.friends.insert(friend.id, friend);
        Ok(())
    }

    /// Remove a friend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] for an unknown id.
    pub fn remove(&mut self, id: FriendId) -> Result<()> {
        let friend = self.friends.remove(&id).ok_or(Error::FriendNotFound)?;
        self.by_key.remove(&friend.public_key);
        Ok(())
    }

    /// Look up a friend by id.
    #[must_use]
    pub fn get(&self, id: FriendId) -> Option<&Friend> {
        self.friends.get(&id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: FriendId) -> Option<&mut Friend> {
        self.friends.get_mut(&id)
    }

    /// Look up a friend id by public key; [`NO_FRIEND`] when absent.
    #[must_use]
    pub fn lookup_id(&self, public_key: &PublicKey) -> FriendId {
        self.by_key.get(public_key).copied().unwrap_or(NO_FRIEND)
    }

    /// Look up a friend by public key.
    #[must_use]
    pub fn get_by_key(&self, public_key: &PublicKey) -> Option<&Friend> {
        self.by_key.get(public_key).and_then(|id| self.friends.get(id))
    }

    /// Mutable lookup by public key.
    pub fn get_by_key_mut(&mut self, public_key: &PublicKey) -> Option<&mut Friend> {
        let id = *self.by_key.get(public_key)?;
        self.friends.get_mut(&id)
    }

    /// Number of friends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.friends.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }

    /// Iterate all friends.
    pub fn iter(&self) -> impl Iterator<Item = &Friend> {
        self.friends.values()
    }

    /// File an incoming request; a repeat sender collapses to the most
    /// recent message.
    pub fn push_request(&mut self, sender: PublicKey, message: String, now: u64) {
        if let Some(existing) = self.requests.iter_mut().find(|r| r.sender == sender) {
            existing.message = message;
            existing.received_at = now;
        } else {
            self.requests.push(FriendRequest {
                sender,
                message,
                received_at: now,
            });
        }
    }

    /// Remove and return the pending request from a sender.
    pub fn take_request(&mut self, sender: &PublicKey) -> Option<FriendRequest> {
        let index = self.requests.iter().position(|r| r.sender == *sender)?;
        Some(self.requests.remove(index))
    }

    /// The pending request inbox.
    #[must_use]
    pub fn requests(&self) -> &[FriendRequest] {
        &self.requests
    }
}
