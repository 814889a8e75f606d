//! In-process simulator substrate.
//!
//! Integration tests swap the real substrates for a [`SimNetwork`]: an
//! in-memory registry of endpoints with switchable reachability. Packets
//! move between attached transports without sockets, timers, or loss,
//! which keeps multi-node scenarios deterministic.

use crate::address::NetworkAddress;
use crate::packet::Packet;
use crate::transport::{InboundPacket, PacketTransport, SendOutcome, TransportError, TransportStats};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Queue depth per simulated endpoint.
const SIM_QUEUE_DEPTH: usize = 256;

/// A simulated network shared by every attached transport.
#[derive(Clone, Default)]
pub struct SimNetwork {
    endpoints: Arc<DashMap<NetworkAddress, mpsc::Sender<InboundPacket>>>,
    offline: Arc<DashSet<NetworkAddress>>,
}

impl SimNetwork {
    /// Create an empty simulated network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at the given address.
    ///
    /// Inbound packets for the address flow into `inbound`, exactly as the
    /// real substrates deliver into the runtime's channel.
    #[must_use]
    pub fn attach(&self, addr: NetworkAddress, inbound: mpsc::Sender<InboundPacket>) -> SimTransport {
        self.endpoints.insert(addr, inbound);
        SimTransport {
            network: self.clone(),
            local: addr,
            closed: Arc::new(AtomicBool::new(false)),
            packets_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Detach an endpoint entirely.
    pub fn detach(&self, addr: &NetworkAddress) {
        self.endpoints.remove(addr);
    }

    /// Toggle an endpoint's reachability without detaching it.
    pub fn set_offline(&self, addr: NetworkAddress, offline: bool) {
        if offline {
            self.offline.insert(addr);
        } else {
            self.offline.remove(&addr);
        }
    }

    /// Whether an endpoint is currently marked offline.
    #[must_use]
    pub fn is_offline(&self, addr: &NetworkAddress) -> bool {
        self.offline.contains(addr)
    }

    fn deliver(&self, from: NetworkAddress, to: &NetworkAddress, packet: Packet) -> SendOutcome {
        if self.offline.contains(to) || self.offline.contains(&from) {
            return SendOutcome::Unreachable;
        }

        let Some(endpoint) = self.endpoints.get(to) else {
            return SendOutcome::Unreachable;
        };

        match endpoint.try_send(InboundPacket {
            source: from,
            packet,
        }) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Backpressure,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Unreachable,
        }
    }
}

/// One endpoint's transport handle on a [`SimNetwork`].
pub struct SimTransport {
    network: SimNetwork,
    local: NetworkAddress,
    closed: Arc<AtomicBool>,
    packets_sent: Arc<AtomicU64>,
}

impl SimTransport {
    /// Default queue depth used when building inbound channels for tests.
    #[must_use]
    pub fn queue_depth() -> usize {
        SIM_QUEUE_DEPTH
    }
}

#[async_trait]
impl PacketTransport for SimTransport {
    async fn send(
        &self,
        packet: &Packet,
        addr: &NetworkAddress,
    ) -> Result<SendOutcome, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let outcome = self.network.deliver(self.local, addr, packet.clone());
        if outcome == SendOutcome::Sent {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    fn local_address(&self) -> Result<NetworkAddress, TransportError> {
        Ok(self.local)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Relaxed);
        self.network.detach(&self.local);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            ..TransportStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn addr(port: u16) -> NetworkAddress {
        NetworkAddress::from_socket_addr(format!("10.0.0.1:{port}").parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_sim_roundtrip() {
        let net = SimNetwork::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);

        let a = net.attach(addr(1), tx_a);
        let _b = net.attach(addr(2), tx_b);

        let packet = Packet::new(PacketType::FriendMessage, vec![1]).unwrap();
        assert_eq!(a.send(&packet, &addr(2)).await.unwrap(), SendOutcome::Sent);

        let inbound = rx_b.recv().await.unwrap();
        assert_eq!(inbound.source, addr(1));
        assert_eq!(inbound.packet, packet);
    }

    #[tokio::test]
    async fn test_unattached_unreachable() {
        let net = SimNetwork::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let a = net.attach(addr(1), tx_a);

        let packet = Packet::new(PacketType::PingRequest, vec![0; 8]).unwrap();
        assert_eq!(
            a.send(&packet, &addr(9)).await.unwrap(),
            SendOutcome::Unreachable
        );
    }

    #[tokio::test]
    async fn test_offline_toggle() {
        let net = SimNetwork::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = net.attach(addr(1), tx_a);
        let _b = net.attach(addr(2), tx_b);

        net.set_offline(addr(2), true);
        let packet = Packet::new(PacketType::FriendMessage, vec![1]).unwrap();
        assert_eq!(
            a.send(&packet, &addr(2)).await.unwrap(),
            SendOutcome::Unreachable
        );

        net.set_offline(addr(2), false);
        assert_eq!(a.send(&packet, &addr(2)).await.unwrap(), SendOutcome::Sent);
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_backpressure() {
        let net = SimNetwork::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(1);
        let a = net.attach(addr(1), tx_a);
        let _b = net.attach(addr(2), tx_b);

        let packet = Packet::new(PacketType::FriendMessage, vec![1]).unwrap();
        assert_eq!(a.send(&packet, &addr(2)).await.unwrap(), SendOutcome::Sent);
        assert_eq!(
            a.send(&packet, &addr(2)).await.unwrap(),
            SendOutcome::Backpressure
        );
    }

    #[tokio::test]
    async fn test_close_detaches() {
        let net = SimNetwork::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        let a = net.attach(addr(1), tx_a);
        let b = net.attach(addr(2), tx_b);

        b.close().await.unwrap();
        let packet = Packet::new(PacketType::FriendMessage, vec![1]).unwrap();
        assert_eq!(
            a.send(&packet, &addr(2)).await.unwrap(),
            SendOutcome::Unreachable
        );
    }
}
