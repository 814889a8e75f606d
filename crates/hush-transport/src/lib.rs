//! # HUSH Transport
//!
//! Network transport layer for the HUSH runtime.
//!
//! This crate provides:
//! - Typed packet framing (1-byte type tag, stable numeric registry)
//! - A polymorphic address model over IPv4, IPv6, and opaque overlays
//! - Two coexisting substrates: a UDP datagram transport and a TCP relay
//! - An in-process simulator substrate for integration tests
//! - Packet-type dispatch to registered handlers
//! - Protocol version and cipher-suite negotiation
//!
//! Substrates share the [`PacketTransport`] trait and push inbound traffic
//! into a bounded channel drained by the runtime's cooperative step loop.
//!
//! [`PacketTransport`]: transport::PacketTransport

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod dispatch;
pub mod negotiate;
pub mod packet;
pub mod relay;
pub mod sim;
pub mod transport;
pub mod udp;

pub use address::NetworkAddress;
pub use dispatch::Dispatcher;
pub use negotiate::{CapabilitySet, CipherSuite, FLOOR_VERSION, Negotiated, PROTOCOL_VERSION, negotiate};
pub use packet::{MAX_PAYLOAD_SIZE, Packet, PacketType};
pub use transport::{InboundPacket, PacketTransport, SendOutcome, TransportError, TransportStats};
