//! Legacy 50-byte DHT node entry codec.
//!
//! Older peers serialize a routing contact as
//! `public(32) ‖ address(16) ‖ port(2, big-endian)`. The 16-byte address
//! field carries IPv6 directly, or IPv4 in its trailing 4 bytes behind a
//! type tag. The tag layout is treated as a pair of opaque constants;
//! only IPv4 and IPv6 entries exist in this format.

use crate::PublicKey;
use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Serialized entry size.
pub const LEGACY_NODE_ENTRY_SIZE: usize = 50;

/// Opaque tag marking an IPv4 address in the 16-byte field.
const TAG_IPV4: u8 = 0x02;

/// Encode a contact in the legacy format.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] for non-IP addresses (overlay
/// endpoints have no legacy representation).
pub fn encode_node_entry(public_key: &PublicKey, addr: SocketAddr) -> Result<[u8; LEGACY_NODE_ENTRY_SIZE]> {
    let mut bytes = [0u8; LEGACY_NODE_ENTRY_SIZE];
    bytes[..32].copy_from_slice(public_key);

    match addr.ip() {
        IpAddr::V4(v4) => {
            bytes[32] = TAG_IPV4;
            bytes[44..48].copy_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            if octets[0] == TAG_IPV4 && octets[1..12].iter().all(|&b| b == 0) {
                // Would be indistinguishable from a tagged IPv4 entry
                return Err(Error::InvalidAddress);
            }
            bytes[32..48].copy_from_slice(&octets);
        }
    }

    bytes[48..].copy_from_slice(&addr.port().to_be_bytes());
    Ok(bytes)
}

/// Decode a legacy contact.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] for a zero port (legacy peers never
/// advertise one).
pub fn decode_node_entry(bytes: &[u8; LEGACY_NODE_ENTRY_SIZE]) -> Result<(PublicKey, SocketAddr)> {
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&bytes[..32]);

    let port = u16::from_be_bytes([bytes[48], bytes[49]]);
    if port == 0 {
        return Err(Error::InvalidAddress);
    }

    let addr_field = &bytes[32..48];
    let ip = if addr_field[0] == TAG_IPV4 && addr_field[1..12].iter().all(|&b| b == 0) {
        let v4 = Ipv4Addr::new(addr_field[12], addr_field[13], addr_field[14], addr_field[15]);
        IpAddr::V4(v4)
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(addr_field);
        IpAddr::V6(Ipv6Addr::from(octets))
    };

    Ok((public_key, SocketAddr::new(ip, port)))
}
