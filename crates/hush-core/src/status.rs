//! Connection-status tracking.
//!
//! Merges per-substrate reachability into one status per friend. Every
//! status change fires the status callback; only edges between offline
//! and any online state fire the boolean online-transition callback, so
//! a migration between UDP and the relay is invisible to presence logic.

use crate::friend::FriendId;
use std::collections::HashMap;

/// Merged reachability of a friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Not reachable
    #[default]
    None,
    /// Reachable over the datagram substrate
    Udp,
    /// Reachable only through a TCP relay
    TcpRelay,
}

/// Which substrate reported a reachability change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Substrate {
    /// UDP datagram transport
    Udp,
    /// TCP relay transport
    Relay,
}

/// The observable effects of one reachability update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// The merged status after the update
    pub status: ConnectionStatus,
    /// Set on offline↔online edges only
    pub online_transition: Option<bool>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Reachability {
    udp: bool,
    relay: bool,
}

impl Reachability {
    fn merged(self) -> ConnectionStatus {
        if self.udp {
            ConnectionStatus::Udp
        } else if self.relay {
            ConnectionStatus::TcpRelay
        } else {
            ConnectionStatus::None
        }
    }
}

/// Per-friend reachability state.
#[derive(Debug, Default)]
pub struct StatusTracker {
    reach: HashMap<FriendId, Reachability>,
}

impl StatusTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a substrate's reachability verdict for a friend.
    ///
    /// Returns the change to announce, or `None` when the merged status
    /// did not move.
    pub fn update(
        &mut self,
        friend: FriendId,
        substrate: Substrate,
        reachable: bool,
    ) -> Option<StatusChange> {
        let entry = self.reach.entry(friend).or_default();
        let before = entry.merged();

        match substrate {
            Substrate::Udp => entry.udp = reachable,
            Substrate::Relay => entry.relay = reachable,
        }

        Self::change_between(before, entry.merged())
    }

    /// Set both substrate flags in one step.
    ///
    /// A migration between UDP and the relay moves through here as a
    /// single update, so it can never surface a transient offline state
    /// or a spurious online/offline edge.
    pub fn set_reachability(
        &mut self,
        friend: FriendId,
        udp: bool,
        relay: bool,
    ) -> Option<StatusChange> {
        let entry = self.reach.entry(friend).or_default();
        let before = entry.merged();

        entry.udp = udp;
        entry.relay = relay;

        Self::change_between(before, entry.merged())
    }

    fn change_between(before: ConnectionStatus, after: ConnectionStatus) -> Option<StatusChange> {
        if before == after {
            return None;
        }

        let online_transition = match (before, after) {
            (ConnectionStatus::None, _) => Some(true),
            (_, ConnectionStatus::None) => Some(false),
            _ => None,
        };

        Some(StatusChange {
            status: after,
            online_transition,
        })
    }

    /// The merged status for a friend.
    #[must_use]
    pub fn get(&self, friend: FriendId) -> ConnectionStatus {
        self.reach
            .get(&friend)
            .map(|r| r.merged())
            .unwrap_or_default()
    }

    /// Whether the friend is reachable at all.
    #[must_use]
    pub fn is_online(&self, friend: FriendId) -> bool {
        self.get(friend) != ConnectionStatus::None
    }

    /// Forget a friend (removal or shutdown).
    pub fn remove(&mut self, friend: FriendId) {
        self.reach.remove(&friend);
    }
}
