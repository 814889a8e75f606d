//! # HUSH Core
//!
//! Core runtime for the HUSH peer-to-peer secure messaging protocol.
//!
//! This crate provides:
//! - **Node API**: the high-level orchestration layer and `iterate()` loop
//! - **Identity**: long-lived keypair, nospam, and the 76-hex address codec
//! - **Sessions**: Noise-IK handshake lifecycle, rekeying, record layer
//! - **Friends**: registry, request inbox, event callbacks
//! - **Message manager**: validated direct sends with retry and async handoff
//! - **Savedata**: versioned persistence surviving restarts
//!
//! ## Quick Start
//!
//! ```no_run
//! use hush_core::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::default()).await?;
//!     println!("my address: {}", node.address()?);
//!
//!     loop {
//!         let wait = node.iterate().await?;
//!         tokio::time::sleep(wait).await;
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Node (orchestration)                 │
//! │   friends · sessions · message manager · status tracker  │
//! ├──────────────────────────────────────────────────────────┤
//! │  hush-discovery   │  hush-async      │  hush-crypto      │
//! │  (DHT, lookup)    │  (offline store) │  (Noise-IK, AEAD) │
//! ├──────────────────────────────────────────────────────────┤
//! │                  hush-transport (UDP, TCP relay)         │
//! └──────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dht_rpc;
pub mod error;
pub mod events;
pub mod friend;
pub mod identity;
pub mod legacy;
pub mod message;
pub mod node;
pub mod savedata;
pub mod session;
pub mod status;
pub mod time;
pub mod toxid;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use events::Callbacks;
pub use friend::{FriendId, FriendRegistry, MAX_MESSAGE_SIZE, MAX_NAME_SIZE, MAX_STATUS_MESSAGE_SIZE};
pub use message::MessageKind;
pub use node::Node;
pub use status::ConnectionStatus;
pub use time::{Clock, MockClock, SystemClock};
pub use toxid::ToxId;

/// A peer's 32-byte static public key.
pub type PublicKey = [u8; 32];
