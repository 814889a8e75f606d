//! Packet-type dispatch.
//!
//! Maps each packet type to a registered handler. Registering a handler
//! for a type replaces the previous one. AV packet types belong to an
//! external subsystem; without a registered handler they are dropped with
//! a trace log rather than treated as protocol errors.

use crate::packet::PacketType;
use crate::transport::InboundPacket;
use dashmap::DashMap;
use std::sync::Arc;

/// Handler callback for one packet type.
pub type PacketHandler = Arc<dyn Fn(InboundPacket) + Send + Sync>;

/// Packet-type → handler multiplexer.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<DashMap<u8, PacketHandler>>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a packet type, replacing any previous one.
    pub fn register_handler(&self, packet_type: PacketType, handler: PacketHandler) {
        self.handlers.insert(packet_type.as_byte(), handler);
    }

    /// Remove a handler.
    pub fn unregister(&self, packet_type: PacketType) {
        self.handlers.remove(&packet_type.as_byte());
    }

    /// Route one inbound packet to its handler.
    ///
    /// The handler reference is cloned out of the map before invocation,
    /// so a handler may re-enter the dispatcher freely.
    pub fn dispatch(&self, inbound: InboundPacket) {
        let packet_type = inbound.packet.packet_type;
        let handler = self
            .handlers
            .get(&packet_type.as_byte())
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => handler(inbound),
            None if packet_type.is_av() => {
                tracing::trace!(?packet_type, "AV packet with no external handler, dropped");
            }
            None => {
                tracing::debug!(?packet_type, "no handler registered, packet dropped");
            }
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
