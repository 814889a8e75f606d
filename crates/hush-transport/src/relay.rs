//! TCP relay substrate.
//!
//! When two peers cannot reach each other over UDP, both keep a TCP
//! connection to a relay and exchange packets through it. On the wire a
//! relay connection carries length-prefixed frames:
//!
//! ```text
//! client → relay  (first frame):  own overlay id (32 bytes)
//! client → relay  (afterwards):   dest id (32) ‖ packet bytes
//! relay  → client:                source id (32) ‖ packet bytes
//! ```
//!
//! The relay forwards by overlay id and never inspects packet contents,
//! which stay end-to-end encrypted by the session layer.

use crate::address::NetworkAddress;
use crate::packet::Packet;
use crate::transport::{InboundPacket, PacketTransport, SendOutcome, TransportError, TransportStats};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};

/// Overlay id size carried in every relay frame.
const RELAY_ID_SIZE: usize = 32;

/// Largest accepted relay frame.
const MAX_FRAME_SIZE: usize = RELAY_ID_SIZE + crate::packet::MAX_PAYLOAD_SIZE + 1;

/// Per-client forwarding queue depth on the server.
const SERVER_QUEUE_DEPTH: usize = 64;

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(frame.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = usize::from(u16::from_be_bytes(len_bytes));
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized relay frame",
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Client side of a relay connection.
///
/// Implements [`PacketTransport`] over overlay addresses: the destination
/// of a send must be `NetworkAddress::Overlay`.
pub struct RelayClient {
    local_id: [u8; 32],
    writer: Arc<Mutex<OwnedWriteHalf>>,
    closed: Arc<AtomicBool>,
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    pump: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Connect to a relay, register, and start the read pump.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] on connection failure.
    pub async fn connect(
        relay_addr: SocketAddr,
        local_id: [u8; 32],
        inbound: mpsc::Sender<InboundPacket>,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(relay_addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, &local_id).await?;

        let closed = Arc::new(AtomicBool::new(false));
        let packets_received = Arc::new(AtomicU64::new(0));

        let pump = {
            let closed = Arc::clone(&closed);
            let packets_received = Arc::clone(&packets_received);

            tokio::spawn(async move {
                loop {
                    if closed.load(Ordering::Relaxed) {
                        break;
                    }

                    let frame = match read_frame(&mut reader).await {
                        Ok(frame) => frame,
                        Err(e) => {
                            if !closed.load(Ordering::Relaxed) {
                                tracing::debug!(error = %e, "relay connection lost");
                            }
                            break;
                        }
                    };

                    if frame.len() <= RELAY_ID_SIZE {
                        tracing::debug!("short relay frame dropped");
                        continue;
                    }

                    let mut source_id = [0u8; RELAY_ID_SIZE];
                    source_id.copy_from_slice(&frame[..RELAY_ID_SIZE]);

                    let packet = match Packet::decode(&frame[RELAY_ID_SIZE..]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::debug!(error = %e, "malformed relayed packet");
                            continue;
                        }
                    };

                    packets_received.fetch_add(1, Ordering::Relaxed);

                    let source = NetworkAddress::Overlay {
                        id: source_id,
                        port: 0,
                    };
                    if inbound.try_send(InboundPacket { source, packet }).is_err() {
                        tracing::warn!("inbound queue full, dropping relayed packet");
                    }
                }
            })
        };

        Ok(Self {
            local_id,
            writer: Arc::new(Mutex::new(writer)),
            closed,
            packets_sent: Arc::new(AtomicU64::new(0)),
            packets_received,
            pump,
        })
    }
}

#[async_trait]
impl PacketTransport for RelayClient {
    async fn send(
        &self,
        packet: &Packet,
        addr: &NetworkAddress,
    ) -> Result<SendOutcome, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let NetworkAddress::Overlay { id, .. } = addr else {
            // IP destinations belong to the datagram substrate
            return Ok(SendOutcome::Unreachable);
        };

        let encoded = packet.encode();
        let mut frame = Vec::with_capacity(RELAY_ID_SIZE + encoded.len());
        frame.extend_from_slice(id);
        frame.extend_from_slice(&encoded);

        let mut writer = self.writer.lock().await;
        match write_frame(&mut writer, &frame).await {
            Ok(()) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(SendOutcome::Sent)
            }
            Err(e) => {
                tracing::debug!(error = %e, "relay write failed");
                Ok(SendOutcome::Unreachable)
            }
        }
    }

    fn local_address(&self) -> Result<NetworkAddress, TransportError> {
        Ok(NetworkAddress::Overlay {
            id: self.local_id,
            port: 0,
        })
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
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            ..TransportStats::default()
        }
    }
}

/// Relay server: accepts client registrations and forwards frames between
/// them by overlay id.
pub struct RelayServer {
    local_addr: SocketAddr,
    clients: Arc<DashMap<[u8; 32], mpsc::Sender<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RelayServer {
    /// Bind and start accepting relay clients.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the listener cannot bind.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let clients: Arc<DashMap<[u8; 32], mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let accept_task = {
            let clients = Arc::clone(&clients);
            let closed = Arc::clone(&closed);

            tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = listener.accept().await else {
                        break;
                    };
                    if closed.load(Ordering::Relaxed) {
                        break;
                    }
                    tracing::debug!(peer = %peer, "relay client connected");
                    let clients = Arc::clone(&clients);
                    tokio::spawn(Self::serve_client(stream, clients));
                }
            })
        };

        Ok(Self {
            local_addr,
            clients,
            closed,
            accept_task,
        })
    }

    async fn serve_client(stream: TcpStream, clients: Arc<DashMap<[u8; 32], mpsc::Sender<Vec<u8>>>>) {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        // First frame is the registration: the client's overlay id
        let registration = match read_frame(&mut reader).await {
            Ok(frame) if frame.len() == RELAY_ID_SIZE => frame,
            _ => {
                tracing::debug!("invalid relay registration");
                return;
            }
        };
        let mut client_id = [0u8; RELAY_ID_SIZE];
        client_id.copy_from_slice(&registration);

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SERVER_QUEUE_DEPTH);
        clients.insert(client_id, tx);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(_) => break,
            };

            if frame.len() <= RELAY_ID_SIZE {
                continue;
            }

            let mut dest_id = [0u8; RELAY_ID_SIZE];
            dest_id.copy_from_slice(&frame[..RELAY_ID_SIZE]);

            // Rewrite the leading id from destination to source
            let mut forwarded = Vec::with_capacity(frame.len());
            forwarded.extend_from_slice(&client_id);
            forwarded.extend_from_slice(&frame[RELAY_ID_SIZE..]);

            match clients.get(&dest_id) {
                Some(dest) => {
                    if dest.try_send(forwarded).is_err() {
                        tracing::debug!("relay queue full, frame dropped");
                    }
                }
                None => {
                    tracing::debug!(dest = %hex::encode(&dest_id[..8]), "relay destination unknown");
                }
            }
        }

        clients.remove(&client_id);
        writer_task.abort();
        tracing::debug!(id = %hex::encode(&client_id[..8]), "relay client disconnected");
    }

    /// The listener's address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Stop accepting and drop client registrations.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.accept_task.abort();
        self.clients.clear();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
