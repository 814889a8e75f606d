//! # HUSH Async
//!
//! Store-and-forward delivery for offline recipients.
//!
//! A sender who cannot reach a friend entrusts an encrypted, size-padded,
//! pseudonymous copy of the message to relay storage nodes. The recipient
//! derives the same per-epoch pseudonym on reconnection and drains the
//! relays, with no relay ever learning sender or recipient identity.
//!
//! This crate provides:
//! - Coarse wall-clock epochs and the ±3 epoch acceptance window
//! - HKDF pseudonym derivation per (recipient, epoch)
//! - Standard-bucket padding against length analysis
//! - Pre-key sealed envelopes (one-time DH per message)
//! - The relay-side obfuscated store with epoch rotation
//! - The delivery/retrieval client and the pre-key refresh sub-protocol

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod envelope;
pub mod epoch;
pub mod error;
pub mod padding;
pub mod pseudonym;
pub mod store;

pub use client::{PutRequest, RelayApi, RetrievalState, deliver, prepare_offline_message, retrieve};
pub use envelope::{Envelope, open_offline_message};
pub use epoch::{EPOCH_SECS, EPOCH_WINDOW, epoch_from_unix, validate_epoch};
pub use error::AsyncError;
pub use pseudonym::Pseudonym;
pub use store::{ObfuscatedStore, StoredEnvelope};
