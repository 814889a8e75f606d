//! Polymorphic network addresses.
//!
//! The transport operates over three address families: IPv4, IPv6, and
//! opaque overlay endpoints (peers reachable only through a relay,
//! identified by public key). Only the IP variants participate in DHT
//! routing; overlay addresses are carried through untouched.

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

/// A transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkAddress {
    /// IPv4 endpoint
    V4(SocketAddrV4),
    /// IPv6 endpoint
    V6(SocketAddrV6),
    /// Opaque overlay endpoint, keyed by the peer's public key
    Overlay {
        /// Overlay identifier (the peer's public key)
        id: [u8; 32],
        /// Logical port within the overlay
        port: u16,
    },
}

impl NetworkAddress {
    /// Validate and convert an ingress socket address.
    ///
    /// IPv6 link-local and multicast sources are rejected: they cannot be
    /// routed back to and have no business in the DHT.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] for rejected addresses.
    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self, TransportError> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::V4(v4)),
            SocketAddr::V6(v6) => {
                let ip = v6.ip();
                if ip.is_multicast() || is_unicast_link_local(ip) {
                    return Err(TransportError::InvalidAddress(addr.to_string()));
                }
                Ok(Self::V6(v6))
            }
        }
    }

    /// The IP socket address, if this is an IP variant.
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::V4(addr) => Some(SocketAddr::V4(*addr)),
            Self::V6(addr) => Some(SocketAddr::V6(*addr)),
            Self::Overlay { .. } => None,
        }
    }

    /// The port component.
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::V4(addr) => addr.port(),
            Self::V6(addr) => addr.port(),
            Self::Overlay { port, .. } => *port,
        }
    }

    /// Whether this address participates in DHT routing.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::V4(_) | Self::V6(_))
    }
}

/// fe80::/10 detection; `Ipv6Addr::is_unicast_link_local` is unstable.
fn is_unicast_link_local(ip: &std::net::Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(addr) => write!(f, "{addr}"),
            Self::V6(addr) => write!(f, "{addr}"),
            Self::Overlay { id, port } => write!(f, "overlay:{}:{port}", hex::encode(&id[..8])),
        }
    }
}

impl From<SocketAddrV4> for NetworkAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::V4(addr)
    }
}

impl From<SocketAddrV6> for NetworkAddress {
    fn from(addr: SocketAddrV6) -> Self {
        Self::V6(addr)
    }
}
