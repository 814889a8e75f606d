//! The 38-byte node address and its 76-hex text form.
//!
//! An address is `public_key(32) ‖ nospam(4) ‖ checksum(2)`. The checksum
//! is the XOR fold of the first 36 bytes read as eighteen 2-byte lanes, so
//! any single-bit corruption in key or nospam is caught. Rotating the
//! nospam changes the advertised address without changing the keypair.

use crate::error::Error;
use crate::PublicKey;
use std::fmt;

/// Total address size in bytes.
pub const TOX_ID_SIZE: usize = 38;

/// Hex string length.
pub const TOX_ID_HEX_LEN: usize = TOX_ID_SIZE * 2;

/// A parsed node address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToxId {
    /// Long-term public key
    pub public_key: PublicKey,
    /// Address rotation salt
    pub nospam: [u8; 4],
}

impl ToxId {
    /// Build an address from its components.
    #[must_use]
    pub fn new(public_key: PublicKey, nospam: [u8; 4]) -> Self {
        Self { public_key, nospam }
    }

    /// The 2-byte checksum over key and nospam.
    #[must_use]
    pub fn checksum(&self) -> [u8; 2] {
        let mut lanes = [0u8; 2];
        for (i, byte) in self
            .public_key
            .iter()
            .chain(self.nospam.iter())
            .enumerate()
        {
            lanes[i % 2] ^= byte;
        }
        lanes
    }

    /// Serialize to the 38-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TOX_ID_SIZE] {
        let mut bytes = [0u8; TOX_ID_SIZE];
        bytes[..32].copy_from_slice(&self.public_key);
        bytes[32..36].copy_from_slice(&self.nospam);
        bytes[36..].copy_from_slice(&self.checksum());
        bytes
    }

    /// Parse and verify a 38-byte address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToxId`] on a checksum mismatch.
    pub fn from_bytes(bytes: &[u8; TOX_ID_SIZE]) -> Result<Self, Error> {
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[..32]);
        let mut nospam = [0u8; 4];
        nospam.copy_from_slice(&bytes[32..36]);

        let id = Self { public_key, nospam };
        if id.checksum() != [bytes[36], bytes[37]] {
            return Err(Error::InvalidToxId);
        }
        Ok(id)
    }

    /// The 76-character uppercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.to_bytes())
    }

    /// Parse the hex form (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToxId`] on wrong length, non-hex input, or
    /// checksum mismatch.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != TOX_ID_HEX_LEN {
            return Err(Error::InvalidToxId);
        }
        let decoded = hex::decode(s).map_err(|_| Error::InvalidToxId)?;
        let bytes: [u8; TOX_ID_SIZE] = decoded.try_into().map_err(|_| Error::InvalidToxId)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for ToxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ToxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ToxId({}…)", &self.to_hex()[..16])
    }
}
