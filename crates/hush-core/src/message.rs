//! Message validation and the pending-delivery queues.
//!
//! Direct sends that hit an unreachable transport enter a per-message
//! exponential backoff; friend requests queued against an offline peer
//! retry on their own schedule. Both queues are driven by the `iterate()`
//! loop against the injected clock.

use crate::error::{Error, Result};
use crate::friend::{FriendId, MAX_MESSAGE_SIZE};
use crate::toxid::ToxId;
use std::collections::HashMap;

/// How a message should be rendered by the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary chat message
    Normal,
    /// Emote / action message
    Action,
}

/// Validate an outbound message body.
///
/// Lengths are measured in bytes, not codepoints.
///
/// # Errors
///
/// Returns [`Error::EmptyMessage`] or [`Error::MessageTooLong`].
pub fn validate_message(message: &str) -> Result<()> {
    if message.is_empty() {
        return Err(Error::EmptyMessage);
    }
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLong);
    }
    Ok(())
}

/// Backoff schedule for direct messages, in seconds.
const MESSAGE_BACKOFF_SECS: &[u64] = &[1, 2, 4, 8, 16, 32, 60];

/// Backoff cap for direct messages.
const MESSAGE_BACKOFF_CAP_SECS: u64 = 60;

/// Retry budget for direct messages.
pub const MESSAGE_MAX_ATTEMPTS: u32 = 10;

/// Backoff schedule for queued friend requests, in seconds.
const REQUEST_BACKOFF_SECS: &[u64] = &[5, 10, 30, 60];

/// Backoff cap for queued friend requests.
const REQUEST_BACKOFF_CAP_SECS: u64 = 60;

/// Retry budget for queued friend requests.
pub const REQUEST_MAX_ATTEMPTS: u32 = 5;

fn backoff_delay(schedule: &[u64], cap: u64, attempt: u32) -> u64 {
    schedule
        .get(attempt as usize)
        .copied()
        .unwrap_or(cap)
        .min(cap)
}

/// One unacknowledged message awaiting retry.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Message body
    pub message: String,
    /// Message kind
    pub kind: MessageKind,
    /// Attempts made so far
    pub attempts: u32,
    /// Clock milliseconds of the next attempt
    pub next_attempt_ms: u64,
}

impl PendingMessage {
    /// Queue a message for its first retry.
    #[must_use]
    pub fn new(message: String, kind: MessageKind, now_ms: u64) -> Self {
        Self {
            message,
            kind,
            attempts: 0,
            next_attempt_ms: now_ms + backoff_delay(MESSAGE_BACKOFF_SECS, MESSAGE_BACKOFF_CAP_SECS, 0) * 1000,
        }
    }

    /// Whether this entry is due.
    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_attempt_ms
    }

    /// Record a failed attempt and reschedule.
    ///
    /// Returns `false` once the retry budget is exhausted; the caller
    /// surfaces [`Error::DeliveryFailed`].
    pub fn reschedule(&mut self, now_ms: u64) -> bool {
        self.attempts += 1;
        if self.attempts >= MESSAGE_MAX_ATTEMPTS {
            return false;
        }
        self.next_attempt_ms =
            now_ms + backoff_delay(MESSAGE_BACKOFF_SECS, MESSAGE_BACKOFF_CAP_SECS, self.attempts) * 1000;
        true
    }
}

/// Per-friend queues of unacknowledged messages.
#[derive(Debug, Default)]
pub struct PendingQueue {
    by_friend: HashMap<FriendId, Vec<PendingMessage>>,
}

impl PendingQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for a friend.
    pub fn push(&mut self, friend: FriendId, entry: PendingMessage) {
        self.by_friend.entry(friend).or_default().push(entry);
    }

    /// Remove every due entry across all friends.
    pub fn drain_due(&mut self, now_ms: u64) -> Vec<(FriendId, PendingMessage)> {
        let mut due = Vec::new();
        for (&friend, queue) in &mut self.by_friend {
            let mut index = 0;
            while index < queue.len() {
                if queue[index].is_due(now_ms) {
                    due.push((friend, queue.remove(index)));
                } else {
                    index += 1;
                }
            }
        }
        self.by_friend.retain(|_, queue| !queue.is_empty());
        due
    }

    /// Drop a friend's queue (friend removed, node killed).
    pub fn remove_friend(&mut self, friend: FriendId) {
        self.by_friend.remove(&friend);
    }

    /// Earliest scheduled attempt across all queues.
    #[must_use]
    pub fn next_due_ms(&self) -> Option<u64> {
        self.by_friend
            .values()
            .flatten()
            .map(|entry| entry.next_attempt_ms)
            .min()
    }

    /// Total queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_friend.values().map(Vec::len).sum()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_friend.is_empty()
    }
}

/// A friend request queued for an unreachable recipient.
#[derive(Debug, Clone)]
pub struct PendingFriendRequest {
    /// Full target address (nospam included, checked by the recipient)
    pub target: ToxId,
    /// Greeting message
    pub message: String,
    /// Clock milliseconds when queued
    pub queued_at_ms: u64,
    /// Clock milliseconds of the next attempt
    pub next_attempt_ms: u64,
    /// Attempts made so far
    pub attempts: u32,
}

impl PendingFriendRequest {
    /// Queue a request. The entry is due immediately; the retry after a
    /// failed first attempt lands one backoff step (5 s) later.
    #[must_use]
    pub fn new(target: ToxId, message: String, now_ms: u64) -> Self {
        Self {
            target,
            message,
            queued_at_ms: now_ms,
            next_attempt_ms: now_ms,
            attempts: 0,
        }
    }

    /// Whether this entry is due.
    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_attempt_ms
    }

    /// Record an attempt and reschedule; `false` when the budget is spent.
    pub fn reschedule(&mut self, now_ms: u64) -> bool {
        self.attempts += 1;
        if self.attempts >= REQUEST_MAX_ATTEMPTS {
            return false;
        }
        let delay = backoff_delay(
            REQUEST_BACKOFF_SECS,
            REQUEST_BACKOFF_CAP_SECS,
            self.attempts - 1,
        );
        self.next_attempt_ms = now_ms + delay * 1000;
        true
    }
}
