//! UDP datagram transport.
//!
//! Binds the first free port in a configured range, configures generous
//! socket buffers, and runs a read pump task that decodes datagrams and
//! feeds the runtime's bounded inbound channel. A full channel sheds the
//! newest packet rather than blocking the pump; UDP callers already
//! tolerate loss.

use crate::address::NetworkAddress;
use crate::packet::Packet;
use crate::transport::{InboundPacket, PacketTransport, SendOutcome, TransportError, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Socket buffer size for send and receive.
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Receive buffer per datagram.
const RECV_BUFFER_SIZE: usize = 65_536;

/// UDP transport with an internal read pump.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
    recv_errors: Arc<AtomicU64>,
    pump: tokio::task::JoinHandle<()>,
}

impl UdpTransport {
    /// Bind within `[start_port, end_port]` and start the read pump.
    ///
    /// Port 0 in both positions requests an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] when no port in the range is
    /// available.
    pub async fn bind(
        bind_ip: std::net::IpAddr,
        start_port: u16,
        end_port: u16,
        inbound: mpsc::Sender<InboundPacket>,
    ) -> Result<Self, TransportError> {
        let mut last_error = None;

        for port in start_port..=end_port.max(start_port) {
            let addr = SocketAddr::new(bind_ip, port);
            match Self::bind_one(addr).await {
                Ok(socket) => return Ok(Self::start(socket, inbound)),
                Err(e) => last_error = Some(e),
            }
        }

        Err(TransportError::BindFailed(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "empty port range".into()),
        ))
    }

    async fn bind_one(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2
            .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        // LAN discovery announces to the broadcast address
        socket2
            .set_broadcast(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket2.into();
        UdpSocket::from_std(std_socket).map_err(|e| TransportError::BindFailed(e.to_string()))
    }

    fn start(socket: UdpSocket, inbound: mpsc::Sender<InboundPacket>) -> Self {
        let socket = Arc::new(socket);
        let closed = Arc::new(AtomicBool::new(false));
        let bytes_received = Arc::new(AtomicU64::new(0));
        let packets_received = Arc::new(AtomicU64::new(0));
        let recv_errors = Arc::new(AtomicU64::new(0));

        let pump = {
            let socket = Arc::clone(&socket);
            let closed = Arc::clone(&closed);
            let bytes_received = Arc::clone(&bytes_received);
            let packets_received = Arc::clone(&packets_received);
            let recv_errors = Arc::clone(&recv_errors);

            tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    if closed.load(Ordering::Relaxed) {
                        break;
                    }

                    let (size, from) = match socket.recv_from(&mut buf).await {
                        Ok(recv) => recv,
                        Err(e) => {
                            recv_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(error = %e, "udp recv failed");
                            continue;
                        }
                    };

                    let source = match NetworkAddress::from_socket_addr(from) {
                        Ok(addr) => addr,
                        Err(e) => {
                            tracing::debug!(error = %e, "rejected ingress address");
                            continue;
                        }
                    };

                    let packet = match Packet::decode(&buf[..size]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            recv_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(error = %e, from = %source, "malformed datagram");
                            continue;
                        }
                    };

                    bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                    packets_received.fetch_add(1, Ordering::Relaxed);

                    if inbound
                        .try_send(InboundPacket { source, packet })
                        .is_err()
                    {
                        tracing::warn!("inbound queue full, dropping datagram");
                    }
                }
            })
        };

        Self {
            socket,
            closed,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received,
            packets_sent: Arc::new(AtomicU64::new(0)),
            packets_received,
            send_errors: Arc::new(AtomicU64::new(0)),
            recv_errors,
            pump,
        }
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn send(
        &self,
        packet: &Packet,
        addr: &NetworkAddress,
    ) -> Result<SendOutcome, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let Some(socket_addr) = addr.to_socket_addr() else {
            // Overlay addresses never route over raw datagrams
            return Ok(SendOutcome::Unreachable);
        };

        let bytes = packet.encode();
        match self.socket.send_to(&bytes, socket_addr).await {
            Ok(sent) => {
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(SendOutcome::Sent)
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                match e.kind() {
                    std::io::ErrorKind::WouldBlock => Ok(SendOutcome::Backpressure),
                    std::io::ErrorKind::HostUnreachable
                    | std::io::ErrorKind::NetworkUnreachable
                    | std::io::ErrorKind::AddrNotAvailable => Ok(SendOutcome::Unreachable),
                    _ => Err(TransportError::Io(e)),
                }
            }
        }
    }

    fn local_address(&self) -> Result<NetworkAddress, TransportError> {
        let addr = self.socket.local_addr().map_err(TransportError::Io)?;
        NetworkAddress::from_socket_addr(addr)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Relaxed);
        self.pump.abort();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::timeout;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn bind_ephemeral() -> (UdpTransport, mpsc::Receiver<InboundPacket>) {
        let (tx, rx) = mpsc::channel(64);
        let transport = UdpTransport::bind(LOCALHOST, 0, 0, tx).await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let (transport, _rx) = bind_ephemeral().await;
        let addr = transport.local_address().unwrap();
        assert!(addr.is_routable());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (server, mut server_rx) = bind_ephemeral().await;
        let (client, _client_rx) = bind_ephemeral().await;

        let packet = Packet::new(PacketType::PingRequest, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let outcome = client
            .send(&packet, &server.local_address().unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);

        let inbound = timeout(Duration::from_secs(1), server_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(inbound.packet, packet);
        assert_eq!(inbound.source, client.local_address().unwrap());
    }

    #[tokio::test]
    async fn test_overlay_address_unreachable() {
        let (transport, _rx) = bind_ephemeral().await;
        let packet = Packet::new(PacketType::PingRequest, vec![0; 8]).unwrap();

        let outcome = transport
            .send(
                &packet,
                &NetworkAddress::Overlay {
                    id: [1u8; 32],
                    port: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Unreachable);
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (transport, _rx) = bind_ephemeral().await;
        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let packet = Packet::new(PacketType::PingRequest, vec![0; 8]).unwrap();
        let target = "127.0.0.1:1".parse().unwrap();
        let result = transport
            .send(&packet, &NetworkAddress::from_socket_addr(target).unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_port_range_bind() {
        // Occupy one port, then ask for a range starting at it
        let (first, _rx1) = bind_ephemeral().await;
        let first_port = first.local_address().unwrap().port();

        let (tx, _rx2) = mpsc::channel(16);
        let second = UdpTransport::bind(LOCALHOST, first_port, first_port.saturating_add(8), tx)
            .await
            .unwrap();
        let second_port = second.local_address().unwrap().port();
        assert_ne!(second_port, first_port);
        assert!(second_port > first_port && second_port <= first_port + 8);
    }

    #[tokio::test]
    async fn test_malformed_datagram_not_delivered() {
        let (server, mut server_rx) = bind_ephemeral().await;
        let server_addr = server.local_address().unwrap().to_socket_addr().unwrap();

        let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0xee, 1, 2, 3], server_addr).await.unwrap();

        let result = timeout(Duration::from_millis(300), server_rx.recv()).await;
        assert!(result.is_err(), "malformed datagram must be dropped");
    }

    #[tokio::test]
    async fn test_stats_track_traffic() {
        let (server, mut server_rx) = bind_ephemeral().await;
        let (client, _client_rx) = bind_ephemeral().await;

        let packet = Packet::new(PacketType::PingRequest, vec![0; 8]).unwrap();
        client
            .send(&packet, &server.local_address().unwrap())
            .await
            .unwrap();
        timeout(Duration::from_secs(1), server_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(server.stats().packets_received, 1);
    }
}
