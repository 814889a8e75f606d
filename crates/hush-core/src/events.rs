//! Event callbacks.
//!
//! One slot per event kind; setting a callback replaces the previous one.
//! Emission clones the callback handle out of the slot under the lock,
//! releases the lock, then invokes, so a callback may freely call back
//! into the node without deadlocking.

use crate::PublicKey;
use crate::friend::FriendId;
use crate::message::MessageKind;
use crate::status::ConnectionStatus;
use std::sync::{Arc, RwLock};

/// Callback fired on an incoming friend request.
pub type FriendRequestFn = dyn Fn(PublicKey, &str) + Send + Sync;
/// Callback fired on an incoming message (simple form).
pub type FriendMessageSimpleFn = dyn Fn(FriendId, &str) + Send + Sync;
/// Callback fired on an incoming message with its kind.
pub type FriendMessageDetailedFn = dyn Fn(FriendId, &str, MessageKind) + Send + Sync;
/// Callback fired on every connection-status change.
pub type FriendConnectionStatusFn = dyn Fn(FriendId, ConnectionStatus) + Send + Sync;
/// Callback fired only on offline↔online edges.
pub type FriendOnlineTransitionFn = dyn Fn(PublicKey, bool) + Send + Sync;
/// Callback fired on a friend's name update.
pub type FriendNameFn = dyn Fn(FriendId, &str) + Send + Sync;
/// Callback fired on a friend's status-message update.
pub type FriendStatusMessageFn = dyn Fn(FriendId, &str) + Send + Sync;
/// Callback fired on a friend's typing notification.
pub type FriendTypingFn = dyn Fn(FriendId, bool) + Send + Sync;

/// The node's callback slots.
#[derive(Default)]
pub struct Callbacks {
    friend_request: RwLock<Option<Arc<FriendRequestFn>>>,
    friend_message_simple: RwLock<Option<Arc<FriendMessageSimpleFn>>>,
    friend_message_detailed: RwLock<Option<Arc<FriendMessageDetailedFn>>>,
    friend_connection_status: RwLock<Option<Arc<FriendConnectionStatusFn>>>,
    friend_online_transition: RwLock<Option<Arc<FriendOnlineTransitionFn>>>,
    friend_name: RwLock<Option<Arc<FriendNameFn>>>,
    friend_status_message: RwLock<Option<Arc<FriendStatusMessageFn>>>,
    friend_typing: RwLock<Option<Arc<FriendTypingFn>>>,
}

macro_rules! slot_accessors {
    ($set:ident, $emit:ident, $slot:ident, $ty:ty, ($($arg:ident : $argty:ty),*)) => {
        /// Install a callback, replacing any previous one.
        pub fn $set(&self, callback: Arc<$ty>) {
            *self.$slot.write().expect("callback slot poisoned") = Some(callback);
        }

        /// Fire the callback if one is installed. The slot lock is
        /// released before invocation.
        pub fn $emit(&self, $($arg: $argty),*) {
            let callback = self
                .$slot
                .read()
                .expect("callback slot poisoned")
                .clone();
            if let Some(callback) = callback {
                callback($($arg),*);
            }
        }
    };
}

impl Callbacks {
    /// Create empty slots.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    slot_accessors!(
        set_friend_request,
        emit_friend_request,
        friend_request,
        FriendRequestFn,
        (public_key: PublicKey, message: &str)
    );

    slot_accessors!(
        set_friend_message_simple,
        emit_friend_message_simple,
        friend_message_simple,
        FriendMessageSimpleFn,
        (friend: FriendId, message: &str)
    );

    slot_accessors!(
        set_friend_message_detailed,
        emit_friend_message_detailed,
        friend_message_detailed,
        FriendMessageDetailedFn,
        (friend: FriendId, message: &str, kind: MessageKind)
    );

    slot_accessors!(
        set_friend_connection_status,
        emit_friend_connection_status,
        friend_connection_status,
        FriendConnectionStatusFn,
        (friend: FriendId, status: ConnectionStatus)
    );

    slot_accessors!(
        set_friend_online_transition,
        emit_friend_online_transition,
        friend_online_transition,
        FriendOnlineTransitionFn,
        (public_key: PublicKey, online: bool)
    );

    slot_accessors!(
        set_friend_name,
        emit_friend_name,
        friend_name,
        FriendNameFn,
        (friend: FriendId, name: &str)
    );

    slot_accessors!(
        set_friend_status_message,
        emit_friend_status_message,
        friend_status_message,
        FriendStatusMessageFn,
        (friend: FriendId, status_message: &str)
    );

    slot_accessors!(
        set_friend_typing,
        emit_friend_typing,
        friend_typing,
        FriendTypingFn,
        (friend: FriendId, typing: bool)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_without_callback_is_noop() {
        let callbacks = Callbacks::new();
        callbacks.emit_friend_message_simple(1, "hello");
    }

    #[test]
    fn test_set_and_emit() {
        let callbacks = Callbacks::new();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = Arc::clone(&count);
            callbacks.set_friend_message_simple(Arc::new(move |friend, message| {
                assert_eq!(friend, 3);
                assert_eq!(message, "hi");
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        callbacks.emit_friend_message_simple(3, "hi");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_replaces_previous() {
        let callbacks = Callbacks::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        {
            let first = Arc::clone(&first);
            callbacks.set_friend_typing(Arc::new(move |_, _| {
                first.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let second = Arc::clone(&second);
            callbacks.set_friend_typing(Arc::new(move |_, _| {
                second.fetch_add(1, Ordering::SeqCst);
            }));
        }

        callbacks.emit_friend_typing(1, true);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_reenter_slots() {
        // A callback that installs a new callback for its own kind must
        // not deadlock: the slot lock is released before invocation.
        let callbacks = Arc::new(Callbacks::new());
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let callbacks_inner = Arc::clone(&callbacks);
            let fired = Arc::clone(&fired);
            callbacks.set_friend_name(Arc::new(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
                callbacks_inner.set_friend_name(Arc::new(|_, _| {}));
            }));
        }

        callbacks.emit_friend_name(1, "alice");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
