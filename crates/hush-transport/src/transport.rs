//! Transport trait abstraction over the datagram and relay substrates.
//!
//! Both substrates deliver framed [`Packet`]s to a [`NetworkAddress`] and
//! push everything they receive into a bounded inbound channel owned by
//! the runtime's step loop.
//!
//! [`Packet`]: crate::packet::Packet
//! [`NetworkAddress`]: crate::address::NetworkAddress

use crate::address::NetworkAddress;
use crate::packet::Packet;
use async_trait::async_trait;
use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind: {0}")]
    BindFailed(String),

    /// Rejected or unusable address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Payload exceeds the framing bound
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Unparseable wire data
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Result of a send attempt that reached the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the wire
    Sent,
    /// The destination cannot be reached over this substrate
    Unreachable,
    /// The write queue is full; retry on the next step
    Backpressure,
}

/// A packet received from the wire.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Validated source address
    pub source: NetworkAddress,
    /// Decoded packet
    pub packet: Packet,
}

/// A substrate capable of moving packets to and from remote addresses.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Send a packet to a remote address.
    ///
    /// Reachability problems are data, not failures: they surface as
    /// [`SendOutcome::Unreachable`] or [`SendOutcome::Backpressure`] so the
    /// caller's retry machinery can react. Errors are reserved for a
    /// closed or broken transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after `close`.
    async fn send(&self, packet: &Packet, addr: &NetworkAddress)
    -> Result<SendOutcome, TransportError>;

    /// The local address this transport answers on.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be determined.
    fn local_address(&self) -> Result<NetworkAddress, TransportError>;

    /// Close the transport and stop its read pump.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the transport has been closed.
    fn is_closed(&self) -> bool;

    /// Transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_outcome_equality() {
        assert_eq!(SendOutcome::Sent, SendOutcome::Sent);
        assert_ne!(SendOutcome::Sent, SendOutcome::Backpressure);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "transport is closed");
        assert!(
            TransportError::PayloadTooLarge(9000)
                .to_string()
                .contains("9000")
        );
    }
}
