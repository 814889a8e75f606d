//! Typed packet framing.
//!
//! Every packet on the wire is a 1-byte type tag followed by a variable
//! payload. The numeric tags are stable protocol constants; renumbering
//! them is a wire break.

use crate::transport::TransportError;

/// Maximum payload size per packet.
///
/// Sized for the largest legitimate payload (a retrieval response
/// carrying top-bucket envelopes) while staying inside one UDP datagram.
pub const MAX_PAYLOAD_SIZE: usize = 65_000;

/// Stable packet type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Liveness probe carrying an 8-byte nonce
    PingRequest = 0x00,
    /// Nonce echo
    PingResponse = 0x01,
    /// FIND_NODE request: 32-byte target
    FindNodeRequest = 0x02,
    /// FIND_NODE response: closest node list
    FindNodeResponse = 0x04,
    /// LAN discovery announcement: the sender's bare public key
    LanAnnounce = 0x08,
    /// Noise-IK handshake message 1
    Handshake1 = 0x10,
    /// Noise-IK handshake message 2
    Handshake2 = 0x11,
    /// In-session rekey message
    Rekey = 0x12,
    /// Capability advertisement for version negotiation
    Capabilities = 0x13,
    /// Friend request with greeting message
    FriendRequest = 0x18,
    /// Pre-key refresh request
    PreKeyRefreshRequest = 0x19,
    /// Signed pre-key refresh response
    PreKeyRefreshResponse = 0x1a,
    /// Store an obfuscated message on a relay
    AsyncPut = 0x20,
    /// Relay acknowledgment of a store
    AsyncPutAck = 0x21,
    /// Retrieve obfuscated messages by pseudonym
    AsyncGet = 0x22,
    /// Retrieval response
    AsyncGetResponse = 0x23,
    /// AV call request (external subsystem)
    AvCallRequest = 0x30,
    /// AV call response (external subsystem)
    AvCallResponse = 0x31,
    /// AV call control (external subsystem)
    AvCallControl = 0x32,
    /// AV bitrate control (external subsystem)
    AvBitrateControl = 0x35,
    /// Friend message session record
    FriendMessage = 0x40,
    /// Friend name update session record
    FriendName = 0x41,
    /// Friend status-message update session record
    FriendStatusMessage = 0x42,
    /// Friend typing notification session record
    FriendTyping = 0x43,
}

impl PacketType {
    /// Parse a wire tag.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::PingRequest),
            0x01 => Some(Self::PingResponse),
            0x02 => Some(Self::FindNodeRequest),
            0x04 => Some(Self::FindNodeResponse),
            0x08 => Some(Self::LanAnnounce),
            0x10 => Some(Self::Handshake1),
            0x11 => Some(Self::Handshake2),
            0x12 => Some(Self::Rekey),
            0x13 => Some(Self::Capabilities),
            0x18 => Some(Self::FriendRequest),
            0x19 => Some(Self::PreKeyRefreshRequest),
            0x1a => Some(Self::PreKeyRefreshResponse),
            0x20 => Some(Self::AsyncPut),
            0x21 => Some(Self::AsyncPutAck),
            0x22 => Some(Self::AsyncGet),
            0x23 => Some(Self::AsyncGetResponse),
            0x30 => Some(Self::AvCallRequest),
            0x31 => Some(Self::AvCallResponse),
            0x32 => Some(Self::AvCallControl),
            0x35 => Some(Self::AvBitrateControl),
            0x40 => Some(Self::FriendMessage),
            0x41 => Some(Self::FriendName),
            0x42 => Some(Self::FriendStatusMessage),
            0x43 => Some(Self::FriendTyping),
            _ => None,
        }
    }

    /// The wire tag.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this type belongs to the external AV subsystem.
    #[must_use]
    pub fn is_av(self) -> bool {
        matches!(
            self,
            Self::AvCallRequest | Self::AvCallResponse | Self::AvCallControl | Self::AvBitrateControl
        )
    }
}

/// A framed packet: type tag plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type
    pub packet_type: PacketType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, enforcing the payload bound.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PayloadTooLarge`] past [`MAX_PAYLOAD_SIZE`].
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Result<Self, TransportError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            packet_type,
            payload,
        })
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.payload.len());
        bytes.push(self.packet_type.as_byte());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MalformedPacket`] for empty input or an
    /// unknown type tag.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| TransportError::MalformedPacket("empty datagram".into()))?;

        let packet_type = PacketType::from_byte(tag)
            .ok_or_else(|| TransportError::MalformedPacket(format!("unknown type 0x{tag:02x}")))?;

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }

        Ok(Self {
            packet_type,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_wire_tags() {
        assert_eq!(PacketType::PingRequest.as_byte(), 0x00);
        assert_eq!(PacketType::PingResponse.as_byte(), 0x01);
        assert_eq!(PacketType::FindNodeRequest.as_byte(), 0x02);
        assert_eq!(PacketType::FindNodeResponse.as_byte(), 0x04);
        assert_eq!(PacketType::FriendRequest.as_byte(), 0x18);
        assert_eq!(PacketType::AvCallRequest.as_byte(), 0x30);
        assert_eq!(PacketType::AvCallResponse.as_byte(), 0x31);
        assert_eq!(PacketType::AvCallControl.as_byte(), 0x32);
        assert_eq!(PacketType::AvBitrateControl.as_byte(), 0x35);
        assert_eq!(PacketType::FriendMessage.as_byte(), 0x40);
        assert_eq!(PacketType::FriendName.as_byte(), 0x41);
        assert_eq!(PacketType::FriendStatusMessage.as_byte(), 0x42);
        assert_eq!(PacketType::FriendTyping.as_byte(), 0x43);
    }

    #[test]
    fn test_from_byte_roundtrip() {
        for tag in 0..=0xffu8 {
            if let Some(packet_type) = PacketType::from_byte(tag) {
                assert_eq!(packet_type.as_byte(), tag);
            }
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let packet = Packet::new(PacketType::FriendMessage, vec![1, 2, 3]).unwrap();
        let bytes = packet.encode();
        assert_eq!(bytes[0], 0x40);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_decode_empty_rejected() {
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_unknown_tag_rejected() {
        assert!(Packet::decode(&[0xee, 1, 2]).is_err());
    }

    #[test]
    fn test_payload_bound() {
        assert!(Packet::new(PacketType::FriendMessage, vec![0; MAX_PAYLOAD_SIZE]).is_ok());
        assert!(Packet::new(PacketType::FriendMessage, vec![0; MAX_PAYLOAD_SIZE + 1]).is_err());
    }

    #[test]
    fn test_av_range() {
        assert!(PacketType::AvCallRequest.is_av());
        assert!(PacketType::AvBitrateControl.is_av());
        assert!(!PacketType::FriendMessage.is_av());
    }
}
