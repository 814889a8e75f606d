//! Node configuration.
//!
//! Out-of-range values do not fail construction: they fall back to their
//! defaults with a logged warning, so a bad knob never strands a node.
//! The only hard configuration error lives in the bootstrap list, where a
//! malformed public key is rejected at parse time.

use crate::time::Clock;
use hush_discovery::bootstrap::BootstrapEntry;
use hush_transport::sim::SimNetwork;
use hush_transport::{FLOOR_VERSION, NetworkAddress, PROTOCOL_VERSION};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Which substrate carries the node's packets.
#[derive(Clone)]
pub enum TransportMode {
    /// Real UDP sockets
    Udp,
    /// In-process simulator, for integration tests
    Simulated {
        /// Shared simulated network
        network: SimNetwork,
        /// This node's address on it
        address: NetworkAddress,
    },
}

/// Runtime configuration.
#[derive(Clone)]
pub struct NodeConfig {
    /// Bind a datagram transport on the port range
    pub udp_enabled: bool,
    /// Datagram bind address
    pub udp_bind_ip: IpAddr,
    /// First port to try
    pub udp_port_start: u16,
    /// Last port to try
    pub udp_port_end: u16,
    /// Bind a stream transport for relaying when > 0
    pub tcp_relay_port: u16,
    /// Relay to connect to as a client, when behind a hard NAT
    pub relay_client: Option<SocketAddr>,
    /// Enable LAN peer discovery
    pub local_discovery: bool,
    /// Seed DHT contacts
    pub bootstrap: Vec<BootstrapEntry>,
    /// Minimum protocol version accepted
    pub protocol_floor_version: u32,
    /// Accept the floor version when version windows do not intersect
    pub legacy_fallback: bool,
    /// Serve relay storage for offline messages
    pub storage_node: bool,
    /// Deterministic time provider for tests; `None` means the real clock
    pub clock: Option<Arc<dyn Clock>>,
    /// Substrate selection
    pub transport: TransportMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            udp_enabled: true,
            udp_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port_start: 33445,
            udp_port_end: 33545,
            tcp_relay_port: 0,
            relay_client: None,
            local_discovery: true,
            bootstrap: Vec::new(),
            protocol_floor_version: FLOOR_VERSION,
            legacy_fallback: true,
            storage_node: true,
            clock: None,
            transport: TransportMode::Udp,
        }
    }
}

impl NodeConfig {
    /// Configuration for an integration test on a simulated network.
    #[must_use]
    pub fn simulated(network: SimNetwork, address: NetworkAddress, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport: TransportMode::Simulated { network, address },
            udp_enabled: true,
            clock: Some(clock),
            ..Self::default()
        }
    }

    /// Clamp invalid values back to defaults, warning about each one.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.udp_port_start > self.udp_port_end {
            tracing::warn!(
                start = self.udp_port_start,
                end = self.udp_port_end,
                "udp port range inverted, using defaults"
            );
            self.udp_port_start = 33445;
            self.udp_port_end = 33545;
        }

        if self.protocol_floor_version < FLOOR_VERSION || self.protocol_floor_version > PROTOCOL_VERSION
        {
            tracing::warn!(
                floor = self.protocol_floor_version,
                "protocol floor out of range, using {}",
                FLOOR_VERSION
            );
            self.protocol_floor_version = FLOOR_VERSION;
        }

        self
    }
}
