//! # HUSH Discovery
//!
//! Kademlia-style peer discovery for the HUSH runtime.
//!
//! This crate provides:
//! - 256-bit node identifiers (the peer's public key) with XOR distance
//! - K-bucket routing table (k=8) with replacement caches
//! - Iterative FIND_NODE lookup with alpha parallelism (α=3)
//! - Cryptographically verified bootstrap
//! - Friend address resolution
//!
//! The lookup engine is transport-agnostic: it drives a [`LookupClient`]
//! implementation, so the same algorithm runs over the real UDP path and
//! over deterministic in-process simulations in tests.
//!
//! [`LookupClient`]: lookup::LookupClient

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod error;
pub mod lookup;
pub mod messages;
pub mod node_id;
pub mod resolver;
pub mod routing;

pub use bootstrap::{BootstrapConfig, BootstrapEntry};
pub use error::DiscoveryError;
pub use lookup::{ALPHA, LookupClient, MAX_ROUNDS, iterative_find_node};
pub use messages::{DhtMessage, NodeInfo};
pub use node_id::NodeId;
pub use routing::{DhtNode, InsertOutcome, K, KBucket, NUM_BUCKETS, RoutingTable};
