//! # HUSH Crypto
//!
//! Cryptographic layer for the HUSH messaging runtime.
//!
//! This crate provides:
//! - Noise-IK handshake with nonce/timestamp replay protection
//! - `ChaCha20-Poly1305` AEAD record layer with a sliding receive window
//! - One-time pre-key pool for offline forward secrecy
//! - X25519 key agreement and Ed25519 signatures
//! - BLAKE3 hashing and HKDF key derivation
//! - Constant-time comparison and secure random generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | Handshake | `Noise_IK_25519_ChaChaPoly_SHA256` |
//! | AEAD | ChaCha20-Poly1305 |
//! | Hash | BLAKE3 |
//! | KDF | HKDF-BLAKE3 |
//! | Signatures | Ed25519 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod noise;
pub mod prekey;
pub mod random;
pub mod replay;
pub mod session;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const AEAD_NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size
pub const AEAD_TAG_SIZE: usize = 16;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Handshake message 1 payload nonce size
pub const HANDSHAKE_NONCE_SIZE: usize = 16;

/// Directional session keys derived from a completed handshake.
///
/// Both sides derive the same two keys from the handshake hash and assign
/// send/recv by role, so the initiator's `send_key` equals the responder's
/// `recv_key` and vice versa.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for sealing outbound records
    pub send_key: [u8; 32],
    /// Key for opening inbound records
    pub recv_key: [u8; 32],
    /// Handshake hash binding subsequent records to this handshake
    pub handshake_hash: [u8; 32],
}
