//! The node: orchestration of identity, discovery, sessions, messaging,
//! and the offline store.
//!
//! All mutable state lives behind per-map synchronization (friend map,
//! session map, routing table each under one `RwLock`); no operation
//! holds more than one of these at a time, no lock is held across I/O,
//! and callbacks always run with every lock released.
//!
//! The runtime is driven by a cooperative [`Node::iterate`] step: it
//! drains inbound packets, services handshake and retry timers, runs DHT
//! and store maintenance, and reports how long the caller may sleep.

use crate::PublicKey;
use crate::config::{NodeConfig, TransportMode};
use crate::dht_rpc::{DhtRpc, GetResponseWire, GetWire};
use crate::error::{Error, Result};
use crate::events::Callbacks;
use crate::friend::{
    FriendId, FriendRegistry, MAX_NAME_SIZE, MAX_STATUS_MESSAGE_SIZE, NO_FRIEND,
};
use crate::identity::Identity;
use crate::message::{
    MessageKind, PendingFriendRequest, PendingMessage, PendingQueue, validate_message,
};
use crate::savedata::{SavedFriend, SavedRequest, Savedata};
use crate::session::Session;
use crate::status::{ConnectionStatus, StatusTracker, Substrate};
use crate::time::{Clock, SystemClock};
use crate::toxid::ToxId;
use dashmap::DashMap;
use hush_async::client as async_client;
use hush_async::{
    AsyncError, Envelope, ObfuscatedStore, PutRequest, RetrievalState, epoch_from_unix,
};
use hush_crypto::noise::HandshakeReplayCache;
use hush_crypto::prekey::{PreKeyPool, RemotePreKeys};
use hush_crypto::x25519::PrivateKey;
use hush_discovery::bootstrap::run_bootstrap;
use hush_discovery::messages::{self, NodeInfo};
use hush_discovery::routing::K;
use hush_discovery::{NodeId, RoutingTable, iterative_find_node};
use hush_transport::relay::{RelayClient, RelayServer};
use hush_transport::udp::UdpTransport;
use hush_transport::{
    CapabilitySet, Dispatcher, InboundPacket, NetworkAddress, Packet, PacketTransport, PacketType,
    SendOutcome, negotiate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Inbound queue depth between the transport pumps and the step loop.
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Packets drained per `iterate` step.
const DRAIN_BUDGET: usize = 256;

/// Maintenance cadence in clock milliseconds.
const MAINTENANCE_INTERVAL_MS: u64 = 60_000;

/// Bucket refresh interval in seconds.
const BUCKET_REFRESH_SECS: u64 = 300;

/// Pre-keys minted per refill or refresh batch.
const PREKEY_BATCH: u16 = 20;

/// Friend request wire body, sealed pairwise like DHT traffic.
#[derive(Serialize, Deserialize)]
struct FriendRequestWire {
    target_nospam: [u8; 4],
    message: String,
}

/// Offline message body inside an envelope.
#[derive(Serialize, Deserialize)]
struct OfflineMessage {
    sender: [u8; 32],
    kind: u8,
    message: String,
}

/// Capability advertisement: flag byte distinguishes offer from answer.
const CAPS_OFFER: u8 = 0;
const CAPS_ANSWER: u8 = 1;

#[derive(Default)]
struct Metrics {
    bad_mac: AtomicU64,
    replays: AtomicU64,
    stale_timestamps: AtomicU64,
    out_of_window: AtomicU64,
    rejected_nospam: AtomicU64,
}

/// The HUSH node.
pub struct Node {
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    identity: RwLock<Option<Identity>>,
    self_name: RwLock<String>,
    self_status_message: RwLock<String>,
    friends: RwLock<FriendRegistry>,
    sessions: RwLock<HashMap<PublicKey, Session>>,
    routing: RwLock<RoutingTable>,
    replay_cache: Mutex<HandshakeReplayCache>,
    callbacks: Callbacks,
    status: Mutex<StatusTracker>,
    pending_messages: Mutex<PendingQueue>,
    pending_requests: Mutex<Vec<PendingFriendRequest>>,
    prekey_pool: Mutex<PreKeyPool>,
    remote_prekeys: Mutex<HashMap<PublicKey, RemotePreKeys>>,
    retrieval: Mutex<RetrievalState>,
    store: Mutex<ObfuscatedStore>,
    addresses: DashMap<PublicKey, NetworkAddress>,
    peers_by_addr: DashMap<NetworkAddress, PublicKey>,
    negotiated: DashMap<PublicKey, negotiate::Negotiated>,
    transport: Option<Arc<dyn PacketTransport>>,
    relay_client: Option<Arc<dyn PacketTransport>>,
    relay_server: Option<RelayServer>,
    rpc: Option<DhtRpc>,
    dispatcher: Dispatcher,
    inbound: tokio::sync::Mutex<mpsc::Receiver<InboundPacket>>,
    killed: AtomicBool,
    last_maintenance_ms: AtomicU64,
    metrics: Metrics,
}

impl Node {
    /// Create a node with a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns transport errors if a configured substrate fails to bind
    /// and crypto errors if identity generation fails.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let identity = Identity::generate()?;
        Self::build(config, identity, None).await
    }

    /// Restore a node from savedata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SavedataCorrupt`] or
    /// [`Error::SavedataVersionUnsupported`] for bad savedata, plus any
    /// construction error.
    pub async fn from_savedata(config: NodeConfig, savedata: &[u8]) -> Result<Self> {
        let saved = Savedata::decode(savedata)?;
        let identity = Identity::from_secret(saved.secret_key, saved.nospam)?;
        Self::build(config, identity, Some(saved)).await
    }

    async fn build(config: NodeConfig, identity: Identity, saved: Option<Savedata>) -> Result<Self> {
        let config = config.validated();
        let clock: Arc<dyn Clock> = config
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        // Transports bind leaves-first, before anything that uses them
        let mut transport: Option<Arc<dyn PacketTransport>> = None;
        if config.udp_enabled {
            match &config.transport {
                TransportMode::Udp => {
                    let udp = UdpTransport::bind(
                        config.udp_bind_ip,
                        config.udp_port_start,
                        config.udp_port_end,
                        inbound_tx.clone(),
                    )
                    .await?;
                    transport = Some(Arc::new(udp));
                }
                TransportMode::Simulated { network, address } => {
                    transport = Some(Arc::new(network.attach(*address, inbound_tx.clone())));
                }
            }
        }

        let relay_server = if config.tcp_relay_port > 0 {
            let addr = std::net::SocketAddr::new(config.udp_bind_ip, config.tcp_relay_port);
            Some(RelayServer::bind(addr).await?)
        } else {
            None
        };

        let relay_client: Option<Arc<dyn PacketTransport>> = match config.relay_client {
            Some(relay_addr) => {
                let client =
                    RelayClient::connect(relay_addr, identity.public_key(), inbound_tx).await?;
                Some(Arc::new(client))
            }
            None => None,
        };

        let rpc = transport.as_ref().map(|t| {
            DhtRpc::new(Arc::clone(t), identity.public_key(), identity.secret_key())
        });

        let self_id = NodeId::from_public_key(identity.public_key());

        let mut friends = FriendRegistry::new();
        let mut self_name = String::new();
        let mut self_status_message = String::new();
        let mut prekey_pool = PreKeyPool::new();

        if let Some(saved) = saved {
            self_name = saved.name;
            self_status_message = saved.status_message;
            let now = clock.now_unix();
            for friend in saved.friends {
                friends.restore(crate::friend::Friend {
                    id: friend.id,
                    public_key: friend.public_key,
                    name: friend.name,
                    status_message: friend.status_message,
                    typing: false,
                    last_seen: now,
                })?;
            }
            for request in saved.requests {
                friends.push_request(request.sender, request.message, request.received_at);
            }
            prekey_pool = PreKeyPool::restore(saved.prekeys);
        }

        let node = Self {
            config,
            clock,
            identity: RwLock::new(Some(identity)),
            self_name: RwLock::new(self_name),
            self_status_message: RwLock::new(self_status_message),
            friends: RwLock::new(friends),
            sessions: RwLock::new(HashMap::new()),
            routing: RwLock::new(RoutingTable::new(self_id)),
            replay_cache: Mutex::new(HandshakeReplayCache::new()),
            callbacks: Callbacks::new(),
            status: Mutex::new(StatusTracker::new()),
            pending_messages: Mutex::new(PendingQueue::new()),
            pending_requests: Mutex::new(Vec::new()),
            prekey_pool: Mutex::new(prekey_pool),
            remote_prekeys: Mutex::new(HashMap::new()),
            retrieval: Mutex::new(RetrievalState::new()),
            store: Mutex::new(ObfuscatedStore::new()),
            addresses: DashMap::new(),
            peers_by_addr: DashMap::new(),
            negotiated: DashMap::new(),
            transport,
            relay_client,
            relay_server,
            rpc,
            dispatcher: Dispatcher::new(),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            killed: AtomicBool::new(false),
            last_maintenance_ms: AtomicU64::new(0),
            metrics: Metrics::default(),
        };

        node.refill_prekeys();
        Ok(node)
    }

    fn check_running(&self) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        Ok(())
    }

    fn with_identity<T>(&self, f: impl FnOnce(&Identity) -> T) -> Result<T> {
        let guard = self.identity.read().expect("identity lock");
        guard.as_ref().map(f).ok_or(Error::NotRunning)
    }

    // ================= identity and profile =================

    /// The node's long-term public key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn public_key(&self) -> Result<PublicKey> {
        self.check_running()?;
        self.with_identity(Identity::public_key)
    }

    /// The node's current 76-hex address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn address(&self) -> Result<String> {
        self.check_running()?;
        self.with_identity(|id| id.tox_id().to_hex())
    }

    /// Current nospam.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn nospam(&self) -> Result<[u8; 4]> {
        self.check_running()?;
        self.with_identity(Identity::nospam)
    }

    /// Rotate the nospam, changing the advertised address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn set_nospam(&self, nospam: [u8; 4]) -> Result<()> {
        self.check_running()?;
        let mut guard = self.identity.write().expect("identity lock");
        guard
            .as_mut()
            .map(|id| id.set_nospam(nospam))
            .ok_or(Error::NotRunning)
    }

    /// Set the node's display name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NameTooLong`] past 128 bytes.
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.check_running()?;
        if name.len() > MAX_NAME_SIZE {
            return Err(Error::NameTooLong);
        }
        *self.self_name.write().expect("name lock") = name.to_string();
        Ok(())
    }

    /// The node's display name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn name(&self) -> Result<String> {
        self.check_running()?;
        Ok(self.self_name.read().expect("name lock").clone())
    }

    /// Set the node's status message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StatusMessageTooLong`] past 1007 bytes.
    pub fn set_status_message(&self, status_message: &str) -> Result<()> {
        self.check_running()?;
        if status_message.len() > MAX_STATUS_MESSAGE_SIZE {
            return Err(Error::StatusMessageTooLong);
        }
        *self
            .self_status_message
            .write()
            .expect("status message lock") = status_message.to_string();
        Ok(())
    }

    /// The node's status message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn status_message(&self) -> Result<String> {
        self.check_running()?;
        Ok(self
            .self_status_message
            .read()
            .expect("status message lock")
            .clone())
    }

    // ================= savedata =================

    /// Serialize the node's persistent state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn savedata(&self) -> Result<Vec<u8>> {
        self.check_running()?;

        let (secret_key, nospam) = self.with_identity(|id| (id.secret_key(), id.nospam()))?;
        let name = self.self_name.read().expect("name lock").clone();
        let status_message = self
            .self_status_message
            .read()
            .expect("status message lock")
            .clone();

        let (friends, requests) = {
            let registry = self.friends.read().expect("friend lock");
            let friends = registry
                .iter()
                .map(|f| SavedFriend {
                    public_key: f.public_key,
                    id: f.id,
                    name: f.name.clone(),
                    status_message: f.status_message.clone(),
                })
                .collect();
            let requests = registry
                .requests()
                .iter()
                .map(|r| SavedRequest {
                    sender: r.sender,
                    message: r.message.clone(),
                    received_at: r.received_at,
                })
                .collect();
            (friends, requests)
        };

        let prekeys = self.prekey_pool.lock().expect("prekey lock").export();

        Savedata {
            secret_key,
            nospam,
            name,
            status_message,
            friends,
            requests,
            prekeys,
        }
        .encode()
    }

    // ================= friends =================

    /// Add a friend by address and queue a friend request.
    ///
    /// # Errors
    ///
    /// Validation errors for the message or address,
    /// [`Error::FriendAlreadyExists`] for a known key.
    pub fn add_friend(&self, address: &str, message: &str) -> Result<FriendId> {
        self.check_running()?;
        validate_message(message)?;
        let target = ToxId::from_hex(address)?;

        if target.public_key == self.public_key()? {
            return Err(Error::InvalidToxId);
        }

        let now = self.clock.now_unix();
        let id = self
            .friends
            .write()
            .expect("friend lock")
            .add(target.public_key, now)?;

        self.queue_pending_friend_request(target, message.to_string())?;
        Ok(id)
    }

    /// Add a friend by bare public key without sending a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendAlreadyExists`] for a known key.
    pub fn add_friend_norequest(&self, public_key: PublicKey) -> Result<FriendId> {
        self.check_running()?;
        let now = self.clock.now_unix();
        self.friends
            .write()
            .expect("friend lock")
            .add(public_key, now)
    }

    /// Accept a pending friend request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] when no request from that key is
    /// pending.
    pub fn accept_friend_request(&self, sender: &PublicKey) -> Result<FriendId> {
        self.check_running()?;
        let now = self.clock.now_unix();

        let friend = {
            let mut registry = self.friends.write().expect("friend lock");
            registry
                .take_request(sender)
                .ok_or(Error::FriendNotFound)?;
            registry.add(*sender, now)?
        };

        // A session may already exist from the requester's handshake; if
        // so the new friend is online right away
        let established = self
            .sessions
            .read()
            .expect("session lock")
            .get(sender)
            .is_some_and(Session::is_established);
        if established {
            if let Some(addr) = self.addresses.get(sender).map(|a| *a.value()) {
                let substrate = match addr {
                    NetworkAddress::Overlay { .. } => Substrate::Relay,
                    _ => Substrate::Udp,
                };
                self.apply_reachability(friend, *sender, substrate, true);
            }
        }

        Ok(friend)
    }

    /// Remove a friend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] for an unknown id.
    pub fn remove_friend(&self, friend: FriendId) -> Result<()> {
        self.check_running()?;

        let public_key = {
            let mut registry = self.friends.write().expect("friend lock");
            let key = registry.get(friend).ok_or(Error::FriendNotFound)?.public_key;
            registry.remove(friend)?;
            key
        };

        if let Some(mut session) = self
            .sessions
            .write()
            .expect("session lock")
            .remove(&public_key)
        {
            session.close();
        }
        self.status.lock().expect("status lock").remove(friend);
        self.pending_messages
            .lock()
            .expect("pending lock")
            .remove_friend(friend);
        Ok(())
    }

    /// Friend id for a public key; [`NO_FRIEND`] when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn friend_id(&self, public_key: &PublicKey) -> Result<FriendId> {
        self.check_running()?;
        Ok(self.friends.read().expect("friend lock").lookup_id(public_key))
    }

    /// Public key for a friend id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] for an unknown id.
    pub fn friend_public_key(&self, friend: FriendId) -> Result<PublicKey> {
        self.check_running()?;
        self.friends
            .read()
            .expect("friend lock")
            .get(friend)
            .map(|f| f.public_key)
            .ok_or(Error::FriendNotFound)
    }

    /// Pending friend request senders.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`.
    pub fn friend_requests(&self) -> Result<Vec<PublicKey>> {
        self.check_running()?;
        Ok(self
            .friends
            .read()
            .expect("friend lock")
            .requests()
            .iter()
            .map(|r| r.sender)
            .collect())
    }

    /// Queue a friend request for delivery with retry.
    ///
    /// The entry is stamped with the current clock; its first retry is
    /// scheduled one backoff step later.
    ///
    /// # Errors
    ///
    /// Validation errors for the message.
    pub fn queue_pending_friend_request(&self, target: ToxId, message: String) -> Result<()> {
        self.check_running()?;
        validate_message(&message)?;

        let now_ms = self.clock.now_millis();
        self.pending_requests
            .lock()
            .expect("request lock")
            .push(PendingFriendRequest::new(target, message, now_ms));
        Ok(())
    }

    // ================= connection status =================

    /// The merged connection status of a friend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] for an unknown id.
    pub fn get_friend_connection_status(&self, friend: FriendId) -> Result<ConnectionStatus> {
        self.check_running()?;
        if self.friends.read().expect("friend lock").get(friend).is_none() {
            return Err(Error::FriendNotFound);
        }
        Ok(self.status.lock().expect("status lock").get(friend))
    }

    /// Force a friend's substrate reachability (integration hook).
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] for an unknown id.
    pub fn set_friend_connection_status(&self, friend: FriendId, status: ConnectionStatus) -> Result<()> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;

        let (udp, relay) = match status {
            ConnectionStatus::None => (false, false),
            ConnectionStatus::Udp => (true, false),
            ConnectionStatus::TcpRelay => (false, true),
        };

        // Both substrate flags move as one update, so a UDP↔relay
        // migration never surfaces a transient offline state
        let change = {
            let mut tracker = self.status.lock().expect("status lock");
            tracker.set_reachability(friend, udp, relay)
        };
        self.emit_status_change(friend, public_key, change);
        Ok(())
    }

    /// Apply one substrate verdict and fire callbacks outside the lock.
    fn apply_reachability(
        &self,
        friend: FriendId,
        public_key: PublicKey,
        substrate: Substrate,
        reachable: bool,
    ) {
        let change = {
            let mut tracker = self.status.lock().expect("status lock");
            tracker.update(friend, substrate, reachable)
        };
        self.emit_status_change(friend, public_key, change);
    }

    fn emit_status_change(
        &self,
        friend: FriendId,
        public_key: PublicKey,
        change: Option<crate::status::StatusChange>,
    ) {
        let Some(change) = change else { return };

        self.callbacks
            .emit_friend_connection_status(friend, change.status);
        if let Some(online) = change.online_transition {
            self.callbacks.emit_friend_online_transition(public_key, online);
        }
    }

    // ================= direct messaging =================

    /// Send a message to a friend.
    ///
    /// Online friends get a session record over the transport; offline
    /// friends get store-and-forward delivery, which fails loudly when
    /// the async layer cannot take the message.
    ///
    /// # Errors
    ///
    /// Validation errors, [`Error::FriendNotFound`], and async-layer
    /// errors ([`Error::NoPreKeys`], [`Error::NoStorageNodes`],
    /// [`Error::AsyncUnavailable`]) for the offline path.
    pub async fn send_friend_message(&self, friend: FriendId, message: &str) -> Result<()> {
        self.send_friend_message_kind(friend, message, MessageKind::Normal)
            .await
    }

    /// Send a message with an explicit kind.
    ///
    /// # Errors
    ///
    /// See [`Node::send_friend_message`].
    pub async fn send_friend_message_kind(
        &self,
        friend: FriendId,
        message: &str,
        kind: MessageKind,
    ) -> Result<()> {
        self.check_running()?;
        validate_message(message)?;
        let public_key = self.friend_public_key(friend)?;

        if self.status.lock().expect("status lock").is_online(friend) {
            self.send_online(friend, &public_key, message, kind).await
        } else {
            self.send_offline(&public_key, message, kind).await
        }
    }

    async fn send_online(
        &self,
        friend: FriendId,
        public_key: &PublicKey,
        message: &str,
        kind: MessageKind,
    ) -> Result<()> {
        let mut plaintext = Vec::with_capacity(1 + message.len());
        plaintext.push(match kind {
            MessageKind::Normal => 0,
            MessageKind::Action => 1,
        });
        plaintext.extend_from_slice(message.as_bytes());

        let record = {
            let now_ms = self.clock.now_millis();
            let mut sessions = self.sessions.write().expect("session lock");
            let session = sessions.get_mut(public_key).ok_or(Error::FriendOffline)?;
            session.encrypt(&plaintext, now_ms)?
        };

        match self.send_record(public_key, PacketType::FriendMessage, record).await {
            Ok(SendOutcome::Sent) => Ok(()),
            Ok(SendOutcome::Backpressure) => {
                // Retried next iterate tick
                self.queue_retry(friend, message, kind);
                Ok(())
            }
            Ok(SendOutcome::Unreachable) | Err(_) => {
                self.queue_retry(friend, message, kind);
                // Hand off to the async layer too when pre-keys allow
                if self.send_offline(public_key, message, kind).await.is_err() {
                    tracing::debug!(friend, "async handoff unavailable, message queued for retry");
                }
                Ok(())
            }
        }
    }

    fn queue_retry(&self, friend: FriendId, message: &str, kind: MessageKind) {
        let now_ms = self.clock.now_millis();
        self.pending_messages
            .lock()
            .expect("pending lock")
            .push(friend, PendingMessage::new(message.to_string(), kind, now_ms));
    }

    async fn send_offline(&self, public_key: &PublicKey, message: &str, kind: MessageKind) -> Result<()> {
        let Some(rpc) = self.rpc.as_ref() else {
            return Err(Error::AsyncUnavailable);
        };

        let body = bincode::serialize(&OfflineMessage {
            sender: self.public_key()?,
            kind: match kind {
                MessageKind::Normal => 0,
                MessageKind::Action => 1,
            },
            message: message.to_string(),
        })
        .map_err(|_| Error::SendFailed)?;

        let current_epoch = epoch_from_unix(self.clock.now_unix());

        let request = {
            let mut stocks = self.remote_prekeys.lock().expect("remote prekey lock");
            let stock = stocks.entry(*public_key).or_default();
            async_client::prepare_offline_message(public_key, stock, &body, current_epoch)
                .map_err(Error::from)?
        };

        let relays = self.storage_relays(&request);
        async_client::deliver(rpc, &relays, request)
            .await
            .map_err(Error::from)
    }

    /// The live nodes closest to a request's pseudonym.
    fn storage_relays(&self, request: &PutRequest) -> Vec<NodeInfo> {
        let target = NodeId::from_bytes(*request.pseudonym.as_bytes());
        let now = self.clock.now_unix();
        let routing = self.routing.read().expect("routing lock");
        routing
            .find_closest(&target, K)
            .into_iter()
            .filter(|n| n.is_live(now))
            .map(|n| NodeInfo { id: n.id, addr: n.addr })
            .collect()
    }

    /// Send a typing notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] when no session exists.
    pub async fn set_typing(&self, friend: FriendId, typing: bool) -> Result<()> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;
        let record = self.seal_record(&public_key, &[u8::from(typing)])?;
        self.expect_sent(self.send_record(&public_key, PacketType::FriendTyping, record).await?)
    }

    /// Broadcast the node's name to a friend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] when no session exists.
    pub async fn send_name_update(&self, friend: FriendId) -> Result<()> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;
        let name = self.self_name.read().expect("name lock").clone();
        let record = self.seal_record(&public_key, name.as_bytes())?;
        self.expect_sent(self.send_record(&public_key, PacketType::FriendName, record).await?)
    }

    /// Broadcast the node's status message to a friend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] when no session exists.
    pub async fn send_status_message_update(&self, friend: FriendId) -> Result<()> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;
        let status = self.self_status_message.read().expect("status message lock").clone();
        let record = self.seal_record(&public_key, status.as_bytes())?;
        self.expect_sent(
            self.send_record(&public_key, PacketType::FriendStatusMessage, record)
                .await?,
        )
    }

    fn expect_sent(&self, outcome: SendOutcome) -> Result<()> {
        match outcome {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Backpressure => Err(Error::Backpressure),
            SendOutcome::Unreachable => Err(Error::SendFailed),
        }
    }

    fn seal_record(&self, public_key: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let now_ms = self.clock.now_millis();
        let mut sessions = self.sessions.write().expect("session lock");
        let session = sessions.get_mut(public_key).ok_or(Error::FriendOffline)?;
        session.encrypt(plaintext, now_ms)
    }

    async fn send_record(
        &self,
        public_key: &PublicKey,
        packet_type: PacketType,
        record: Vec<u8>,
    ) -> Result<SendOutcome> {
        let Some(addr) = self.addresses.get(public_key).map(|a| *a.value()) else {
            return Ok(SendOutcome::Unreachable);
        };
        self.send_to_addr(packet_type, record, &addr).await
    }

    async fn send_to_addr(
        &self,
        packet_type: PacketType,
        payload: Vec<u8>,
        addr: &NetworkAddress,
    ) -> Result<SendOutcome> {
        let transport = match addr {
            NetworkAddress::Overlay { .. } => self.relay_client.as_ref(),
            _ => self.transport.as_ref(),
        };
        let Some(transport) = transport else {
            return Err(Error::TransportUnavailable);
        };

        let packet = Packet::new(packet_type, payload)?;
        transport.send(&packet, addr).await.map_err(Error::from)
    }

    // ================= sessions =================

    /// Start a handshake towards a friend at a known address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionBusy`] over an established session and
    /// transport errors for the send.
    pub async fn connect_friend(&self, friend: FriendId, addr: NetworkAddress) -> Result<()> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;
        self.addresses.insert(public_key, addr);
        self.peers_by_addr.insert(addr, public_key);

        let msg1 = {
            let now_ms = self.clock.now_millis();
            let now_unix = self.clock.now_unix();
            let mut sessions = self.sessions.write().expect("session lock");
            let session = sessions
                .entry(public_key)
                .or_insert_with(|| Session::new(public_key));
            self.with_identity(|id| session.start_handshake(id.static_keys(), now_ms, now_unix))??
        };

        self.expect_sent(self.send_to_addr(PacketType::Handshake1, msg1, &addr).await?)?;

        // Capability advertisement rides alongside the handshake
        let ours = CapabilitySet::current(
            self.config.protocol_floor_version,
            self.config.legacy_fallback,
        );
        let mut caps = vec![CAPS_OFFER];
        caps.extend_from_slice(&ours.encode().map_err(Error::from)?);
        let _ = self.send_to_addr(PacketType::Capabilities, caps, &addr).await;
        Ok(())
    }

    /// The negotiated protocol parameters for a friend, once known.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] for an unknown id.
    pub fn negotiated_with(&self, friend: FriendId) -> Result<Option<negotiate::Negotiated>> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;
        Ok(self.negotiated.get(&public_key).map(|n| *n.value()))
    }

    // ================= bootstrap and lookup =================

    /// Contact the configured bootstrap set and populate the routing
    /// table via a self-lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DhtBootstrapFailed`] when no contact was
    /// reachable and [`Error::AsyncUnavailable`]-style transport absence
    /// as [`Error::TransportUnavailable`].
    pub async fn bootstrap(&self) -> Result<()> {
        self.check_running()?;
        let Some(rpc) = self.rpc.as_ref() else {
            return Err(Error::TransportUnavailable);
        };

        let config = hush_discovery::BootstrapConfig {
            entries: self.config.bootstrap.clone(),
        };
        let found = run_bootstrap(&config, rpc, rpc.self_id()).await?;

        let now = self.clock.now_unix();
        let mut routing = self.routing.write().expect("routing lock");
        for node in found {
            routing.insert(node.id, node.addr, now);
        }
        Ok(())
    }

    /// Probe a known contact, inserting it into the routing table on a
    /// successful authenticated echo.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeUnreachable`] when the contact does not
    /// answer under the given key.
    pub async fn ping_peer(&self, public_key: PublicKey, addr: std::net::SocketAddr) -> Result<()> {
        self.check_running()?;
        let Some(rpc) = self.rpc.as_ref() else {
            return Err(Error::TransportUnavailable);
        };
        rpc.ping(&NodeInfo {
            id: NodeId::from_public_key(public_key),
            addr,
        })
        .await
    }

    /// Resolve a friend's current address through the DHT.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeUnreachable`] when the friend's id is not
    /// among the closest nodes found.
    pub async fn resolve_friend(&self, friend: FriendId) -> Result<NetworkAddress> {
        self.check_running()?;
        let Some(rpc) = self.rpc.as_ref() else {
            return Err(Error::TransportUnavailable);
        };
        let public_key = self.friend_public_key(friend)?;
        let target = NodeId::from_public_key(public_key);

        let seeds = {
            let routing = self.routing.read().expect("routing lock");
            routing
                .find_closest(&target, K)
                .into_iter()
                .map(|n| NodeInfo { id: n.id, addr: n.addr })
                .collect::<Vec<_>>()
        };

        let addr =
            hush_discovery::resolver::resolve_friend_address(seeds, rpc, target).await?;
        let net_addr = NetworkAddress::from_socket_addr(addr)?;
        self.addresses.insert(public_key, net_addr);
        self.peers_by_addr.insert(net_addr, public_key);
        Ok(net_addr)
    }

    // ================= async inbox =================

    /// Drain waiting offline messages from the relay set.
    ///
    /// Runs automatically during maintenance; exposed for deterministic
    /// tests and instant catch-up after reconnect. Returns the number of
    /// messages delivered to callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AsyncUnavailable`] without a transport.
    pub async fn check_async_inbox(&self) -> Result<usize> {
        self.check_running()?;
        let Some(rpc) = self.rpc.as_ref() else {
            return Err(Error::AsyncUnavailable);
        };

        let public_key = self.public_key()?;
        let current_epoch = epoch_from_unix(self.clock.now_unix());

        let relays = {
            let target = NodeId::from_public_key(public_key);
            let routing = self.routing.read().expect("routing lock");
            routing
                .find_closest(&target, K)
                .into_iter()
                .map(|n| NodeInfo { id: n.id, addr: n.addr })
                .collect::<Vec<_>>()
        };

        let envelopes = {
            // RetrievalState is only touched here and in maintenance,
            // both on the step loop; the lock is never held across the
            // await inside retrieve, so we drain into it afterwards.
            let mut state = RetrievalState::new();
            let fetched =
                async_client::retrieve(rpc, &relays, &public_key, current_epoch, &mut state).await;
            let mut global = self.retrieval.lock().expect("retrieval lock");
            fetched
                .into_iter()
                .filter(|e| global.mark_new(e.message_id))
                .collect::<Vec<_>>()
        };

        let mut delivered = 0usize;
        for stored in envelopes {
            let Ok(envelope) = Envelope::decode(&stored.payload) else {
                continue;
            };

            let body = {
                let mut pool = self.prekey_pool.lock().expect("prekey lock");
                hush_async::open_offline_message(&mut pool, &envelope)
            };
            let body = match body {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(error = %e, "offline envelope failed to open");
                    continue;
                }
            };

            let Ok(message) = bincode::deserialize::<OfflineMessage>(&body) else {
                continue;
            };
            let text = message.message;
            if text.is_empty() {
                continue;
            }

            let friend = self
                .friends
                .read()
                .expect("friend lock")
                .lookup_id(&message.sender);
            if friend == NO_FRIEND {
                tracing::debug!("offline message from non-friend dropped");
                continue;
            }

            let kind = if message.kind == 1 {
                MessageKind::Action
            } else {
                MessageKind::Normal
            };
            self.callbacks.emit_friend_message_simple(friend, &text);
            self.callbacks.emit_friend_message_detailed(friend, &text, kind);
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Request fresh pre-keys from a friend over the live session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] when no session exists.
    pub async fn request_prekeys(&self, friend: FriendId) -> Result<()> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;

        let request = async_client::PreKeyRefreshRequest { count: PREKEY_BATCH };
        let body = request.encode().map_err(Error::from)?;
        let record = self.seal_record(&public_key, &body)?;
        self.expect_sent(
            self.send_record(&public_key, PacketType::PreKeyRefreshRequest, record)
                .await?,
        )
    }

    /// How many of a friend's pre-keys are in stock for offline sends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendNotFound`] for an unknown id.
    pub fn remote_prekey_count(&self, friend: FriendId) -> Result<usize> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;
        Ok(self
            .remote_prekeys
            .lock()
            .expect("remote prekey lock")
            .get(&public_key)
            .map(RemotePreKeys::available)
            .unwrap_or(0))
    }

    fn refill_prekeys(&self) {
        let epoch = epoch_from_unix(self.clock.now_unix());
        let mut pool = self.prekey_pool.lock().expect("prekey lock");
        if pool.needs_refill() {
            let minted = pool.mint(&mut rand_core::OsRng, usize::from(PREKEY_BATCH), epoch);
            tracing::debug!(count = minted.len(), "minted pre-keys");
        }
    }

    // ================= callbacks =================

    /// The callback registry.
    #[must_use]
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Register an external handler for an AV packet type.
    pub fn register_av_handler(
        &self,
        packet_type: PacketType,
        handler: hush_transport::dispatch::PacketHandler,
    ) {
        self.dispatcher.register_handler(packet_type, handler);
    }

    // ================= the step loop =================

    /// One cooperative step: drain inbound traffic, service timers, run
    /// maintenance. Returns how long the caller may sleep before the
    /// next step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] after `kill`; the call is otherwise
    /// side-effect free in that state.
    pub async fn iterate(&self) -> Result<Duration> {
        self.check_running()?;

        self.drain_inbound().await;
        self.service_handshake_timers().await;
        self.service_rekeys().await;
        self.service_pending_requests().await;
        self.service_pending_messages().await;
        self.run_maintenance().await;

        Ok(self.next_wakeup())
    }

    fn next_wakeup(&self) -> Duration {
        let now_ms = self.clock.now_millis();
        let mut next = now_ms + 500;

        if let Some(due) = self.pending_messages.lock().expect("pending lock").next_due_ms() {
            next = next.min(due);
        }
        if let Some(due) = self
            .pending_requests
            .lock()
            .expect("request lock")
            .iter()
            .map(|r| r.next_attempt_ms)
            .min()
        {
            next = next.min(due);
        }

        Duration::from_millis(next.saturating_sub(now_ms).clamp(10, 1000))
    }

    async fn drain_inbound(&self) {
        for _ in 0..DRAIN_BUDGET {
            let inbound = {
                let mut rx = self.inbound.lock().await;
                match rx.try_recv() {
                    Ok(inbound) => inbound,
                    Err(_) => break,
                }
            };
            self.handle_packet(inbound).await;
        }
    }

    async fn handle_packet(&self, inbound: InboundPacket) {
        let source = inbound.source;
        let packet_type = inbound.packet.packet_type;

        if packet_type.is_av() {
            self.dispatcher.dispatch(inbound);
            return;
        }

        let payload = inbound.packet.payload;
        let result = match packet_type {
            PacketType::PingRequest => self.on_ping_request(&payload, source).await,
            PacketType::PingResponse => self.on_ping_response(&payload, source),
            PacketType::FindNodeRequest => self.on_find_node_request(&payload, source).await,
            PacketType::FindNodeResponse => self.on_find_node_response(&payload, source),
            PacketType::LanAnnounce => self.on_lan_announce(&payload, source),
            PacketType::Handshake1 => self.on_handshake1(&payload, source).await,
            PacketType::Handshake2 => self.on_handshake2(&payload, source),
            PacketType::Rekey => self.on_rekey(&payload, source),
            PacketType::Capabilities => self.on_capabilities(&payload, source).await,
            PacketType::FriendRequest => self.on_friend_request(&payload),
            PacketType::FriendMessage => self.on_friend_message(&payload, source),
            PacketType::FriendName => self.on_friend_name(&payload, source),
            PacketType::FriendStatusMessage => self.on_friend_status_message(&payload, source),
            PacketType::FriendTyping => self.on_friend_typing(&payload, source),
            PacketType::PreKeyRefreshRequest => self.on_prekey_request(&payload, source).await,
            PacketType::PreKeyRefreshResponse => self.on_prekey_response(&payload, source),
            PacketType::AsyncPut => self.on_async_put(&payload, source).await,
            PacketType::AsyncPutAck => self.on_async_put_ack(&payload),
            PacketType::AsyncGet => self.on_async_get(&payload, source).await,
            PacketType::AsyncGetResponse => self.on_async_get_response(&payload),
            PacketType::AvCallRequest
            | PacketType::AvCallResponse
            | PacketType::AvCallControl
            | PacketType::AvBitrateControl => Ok(()),
        };

        // Crypto failures are dropped without a wire response; they only
        // move counters and logs.
        if let Err(e) = result {
            match e {
                Error::BadMac => {
                    self.metrics.bad_mac.fetch_add(1, Ordering::Relaxed);
                }
                Error::ReplayDetected => {
                    self.metrics.replays.fetch_add(1, Ordering::Relaxed);
                }
                Error::StaleTimestamp => {
                    self.metrics.stale_timestamps.fetch_add(1, Ordering::Relaxed);
                }
                Error::OutOfWindow => {
                    self.metrics.out_of_window.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
            tracing::debug!(?packet_type, from = %source, error = %e, "inbound packet dropped");
        }
    }

    // ================= DHT packet handlers =================

    fn note_contact(&self, sender: PublicKey, source: NetworkAddress) {
        if let Some(addr) = source.to_socket_addr() {
            let now = self.clock.now_unix();
            let mut routing = self.routing.write().expect("routing lock");
            routing.insert(NodeId::from_public_key(sender), addr, now);
        }
    }

    async fn on_ping_request(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(Error::TransportUnavailable)?;
        let (sender, plaintext) = rpc.open_from(payload)?;
        let nonce = messages::decode_ping(&plaintext)?;

        self.note_contact(sender, source);

        let reply = rpc.seal_to(&sender, &messages::encode_ping(nonce))?;
        self.send_to_addr(PacketType::PingResponse, reply, &source).await?;
        Ok(())
    }

    fn on_ping_response(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(Error::TransportUnavailable)?;
        let (sender, plaintext) = rpc.open_from(payload)?;
        let nonce = messages::decode_ping(&plaintext)?;

        rpc.resolve_ping(nonce, NodeId::from_public_key(sender));
        self.note_contact(sender, source);
        Ok(())
    }

    async fn on_find_node_request(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(Error::TransportUnavailable)?;
        let (sender, plaintext) = rpc.open_from(payload)?;
        let target = messages::decode_find_node_request(&plaintext)?;

        self.note_contact(sender, source);

        let closest = {
            let routing = self.routing.read().expect("routing lock");
            routing
                .find_closest(&target, K)
                .into_iter()
                .map(|n| NodeInfo { id: n.id, addr: n.addr })
                .collect::<Vec<_>>()
        };

        let body = messages::encode_find_node_response(&closest)?;
        let reply = rpc.seal_to(&sender, &body)?;
        self.send_to_addr(PacketType::FindNodeResponse, reply, &source).await?;
        Ok(())
    }

    fn on_find_node_response(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(Error::TransportUnavailable)?;
        let (sender, plaintext) = rpc.open_from(payload)?;
        let nodes = messages::decode_find_node_response(&plaintext)?;

        self.note_contact(sender, source);
        rpc.resolve_find_response(NodeId::from_public_key(sender), nodes);
        Ok(())
    }

    /// A LAN announcement is unauthenticated, so the routing table does
    /// not learn from it directly: the announced contact gets an
    /// authenticated ping, and only the verified echo inserts it.
    fn on_lan_announce(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let announced: [u8; 32] = payload.try_into().map_err(|_| Error::InvalidPublicKey)?;
        if announced == self.public_key()? {
            return Ok(());
        }

        if let (Some(rpc), Some(addr)) = (self.rpc.clone(), source.to_socket_addr()) {
            tokio::spawn(async move {
                let contact = NodeInfo {
                    id: NodeId::from_public_key(announced),
                    addr,
                };
                if let Err(e) = rpc.ping(&contact).await {
                    tracing::debug!(error = %e, "LAN-announced contact failed verification");
                }
            });
        }
        Ok(())
    }

    // ================= session packet handlers =================

    async fn on_handshake1(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let now_ms = self.clock.now_millis();
        let now_unix = self.clock.now_unix();

        let (msg2, initiator) = {
            let mut replay_cache = self.replay_cache.lock().expect("replay lock");
            let mut session = Session::new([0u8; 32]);
            let result = self.with_identity(|id| {
                session.accept_handshake(id.static_keys(), payload, now_ms, now_unix, &mut replay_cache)
            })??;
            drop(replay_cache);

            // The newer handshake wins so a restarted peer can come back
            let mut sessions = self.sessions.write().expect("session lock");
            sessions.insert(result.1, session);
            result
        };

        self.addresses.insert(initiator, source);
        self.peers_by_addr.insert(source, initiator);

        self.send_to_addr(PacketType::Handshake2, msg2, &source).await?;
        self.mark_peer_online(initiator, source);
        Ok(())
    }

    fn on_handshake2(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let peer = self
            .peers_by_addr
            .get(&source)
            .map(|p| *p.value())
            .ok_or(Error::BadMac)?;

        let now_ms = self.clock.now_millis();
        {
            let mut sessions = self.sessions.write().expect("session lock");
            let session = sessions.get_mut(&peer).ok_or(Error::BadMac)?;
            session.finish_handshake(payload, now_ms)?;
        }

        self.mark_peer_online(peer, source);
        Ok(())
    }

    fn mark_peer_online(&self, peer: PublicKey, source: NetworkAddress) {
        let friend = self.friends.read().expect("friend lock").lookup_id(&peer);
        if friend == NO_FRIEND {
            return;
        }
        let substrate = match source {
            NetworkAddress::Overlay { .. } => Substrate::Relay,
            _ => Substrate::Udp,
        };
        self.apply_reachability(friend, peer, substrate, true);
    }

    fn on_rekey(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let peer = self
            .peers_by_addr
            .get(&source)
            .map(|p| *p.value())
            .ok_or(Error::BadMac)?;
        let secret = self.with_identity(Identity::secret_key)?;
        let local_secret = PrivateKey::from_bytes(secret);

        let now_ms = self.clock.now_millis();
        let mut sessions = self.sessions.write().expect("session lock");
        let session = sessions.get_mut(&peer).ok_or(Error::BadMac)?;
        session.handle_rekey(payload, &local_secret, now_ms)
    }

    async fn on_capabilities(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let (&flag, body) = payload.split_first().ok_or(Error::ProtocolIncompatible)?;
        let theirs = CapabilitySet::decode(body)?;

        let ours = CapabilitySet::current(self.config.protocol_floor_version, self.config.legacy_fallback);

        let peer = self.peers_by_addr.get(&source).map(|p| *p.value());

        match negotiate::negotiate(&theirs, &ours) {
            Ok(agreed) => {
                if let Some(peer) = peer {
                    self.negotiated.insert(peer, agreed);
                }
            }
            Err(e) => {
                // Incompatible peers get their session torn down
                if let Some(peer) = peer {
                    if let Some(session) =
                        self.sessions.write().expect("session lock").get_mut(&peer)
                    {
                        session.close();
                    }
                }
                return Err(e.into());
            }
        }

        if flag == CAPS_OFFER {
            let mut reply = vec![CAPS_ANSWER];
            reply.extend_from_slice(&ours.encode().map_err(Error::from)?);
            self.send_to_addr(PacketType::Capabilities, reply, &source).await?;
        }
        Ok(())
    }

    // ================= friend packet handlers =================

    fn on_friend_request(&self, payload: &[u8]) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(Error::TransportUnavailable)?;
        let (sender, plaintext) = rpc.open_from(payload)?;

        let wire: FriendRequestWire =
            bincode::deserialize(&plaintext).map_err(|_| Error::BadMac)?;
        validate_message(&wire.message)?;

        // The inbox filters on the current nospam: requests addressed to
        // a rotated-away address are rejected
        let nospam = self.with_identity(Identity::nospam)?;
        if wire.target_nospam != nospam {
            self.metrics.rejected_nospam.fetch_add(1, Ordering::Relaxed);
            return Err(Error::InvalidToxId);
        }

        let already_friend = self
            .friends
            .read()
            .expect("friend lock")
            .lookup_id(&sender)
            != NO_FRIEND;
        if already_friend {
            return Ok(());
        }

        let now = self.clock.now_unix();
        self.friends
            .write()
            .expect("friend lock")
            .push_request(sender, wire.message.clone(), now);

        self.callbacks.emit_friend_request(sender, &wire.message);
        Ok(())
    }

    fn open_record_from(&self, payload: &[u8], source: NetworkAddress) -> Result<(FriendId, Vec<u8>)> {
        let peer = self
            .peers_by_addr
            .get(&source)
            .map(|p| *p.value())
            .ok_or(Error::BadMac)?;

        let now_ms = self.clock.now_millis();
        let plaintext = {
            let mut sessions = self.sessions.write().expect("session lock");
            let session = sessions.get_mut(&peer).ok_or(Error::BadMac)?;
            session.decrypt(payload, now_ms)?
        };

        let friend = self.friends.read().expect("friend lock").lookup_id(&peer);
        if friend == NO_FRIEND {
            return Err(Error::FriendNotFound);
        }

        let now = self.clock.now_unix();
        if let Some(entry) = self.friends.write().expect("friend lock").get_mut(friend) {
            entry.last_seen = now;
        }

        Ok((friend, plaintext))
    }

    fn on_friend_message(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let (friend, plaintext) = self.open_record_from(payload, source)?;

        let Some((&kind_byte, body)) = plaintext.split_first() else {
            // Empty record: silently dropped, mirroring the send-side
            // empty-message rejection
            return Ok(());
        };
        let text = std::str::from_utf8(body).map_err(|_| Error::BadMac)?;
        if text.is_empty() {
            return Ok(());
        }

        let kind = if kind_byte == 1 {
            MessageKind::Action
        } else {
            MessageKind::Normal
        };

        self.callbacks.emit_friend_message_simple(friend, text);
        self.callbacks.emit_friend_message_detailed(friend, text, kind);
        Ok(())
    }

    fn on_friend_name(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let (friend, plaintext) = self.open_record_from(payload, source)?;
        let name = std::str::from_utf8(&plaintext).map_err(|_| Error::BadMac)?;
        if name.len() > MAX_NAME_SIZE {
            return Err(Error::NameTooLong);
        }

        if let Some(entry) = self.friends.write().expect("friend lock").get_mut(friend) {
            entry.name = name.to_string();
        }
        self.callbacks.emit_friend_name(friend, name);
        Ok(())
    }

    fn on_friend_status_message(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let (friend, plaintext) = self.open_record_from(payload, source)?;
        let status = std::str::from_utf8(&plaintext).map_err(|_| Error::BadMac)?;
        if status.len() > MAX_STATUS_MESSAGE_SIZE {
            return Err(Error::StatusMessageTooLong);
        }

        if let Some(entry) = self.friends.write().expect("friend lock").get_mut(friend) {
            entry.status_message = status.to_string();
        }
        self.callbacks.emit_friend_status_message(friend, status);
        Ok(())
    }

    fn on_friend_typing(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let (friend, plaintext) = self.open_record_from(payload, source)?;
        let typing = plaintext.first().copied().unwrap_or(0) != 0;

        if let Some(entry) = self.friends.write().expect("friend lock").get_mut(friend) {
            entry.typing = typing;
        }
        self.callbacks.emit_friend_typing(friend, typing);
        Ok(())
    }

    // ================= pre-key exchange handlers =================

    async fn on_prekey_request(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let (friend, plaintext) = self.open_record_from(payload, source)?;
        let request = async_client::PreKeyRefreshRequest::decode(&plaintext).map_err(Error::from)?;

        let epoch = epoch_from_unix(self.clock.now_unix());
        let (response, verifying_key) = {
            let mut pool = self.prekey_pool.lock().expect("prekey lock");
            self.with_identity(|id| {
                let response = async_client::PreKeyRefreshResponse::mint_signed(
                    &mut pool,
                    id.signing_key(),
                    request.count.min(PREKEY_BATCH),
                    epoch,
                );
                (response, id.signing_key().verifying_key().to_bytes())
            })?
        };
        let response = response.map_err(Error::from)?;

        let mut body = verifying_key.to_vec();
        body.extend_from_slice(&response.encode().map_err(Error::from)?);

        let public_key = self.friend_public_key(friend)?;
        let record = self.seal_record(&public_key, &body)?;
        self.expect_sent(
            self.send_record(&public_key, PacketType::PreKeyRefreshResponse, record)
                .await?,
        )
    }

    fn on_prekey_response(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        let (friend, plaintext) = self.open_record_from(payload, source)?;
        if plaintext.len() < 32 {
            return Err(Error::BadMac);
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&plaintext[..32]);
        let verifying_key = hush_crypto::signatures::VerifyingKey::from_bytes(&key_bytes)
            .map_err(Error::from)?;

        let response =
            async_client::PreKeyRefreshResponse::decode(&plaintext[32..]).map_err(Error::from)?;
        let batch = response.verify(&verifying_key).map_err(Error::from)?;

        let public_key = self.friend_public_key(friend)?;
        self.remote_prekeys
            .lock()
            .expect("remote prekey lock")
            .entry(public_key)
            .or_default()
            .replenish(batch);
        Ok(())
    }

    // ================= relay store handlers =================

    async fn on_async_put(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        if !self.config.storage_node {
            return Ok(());
        }
        let request = PutRequest::decode(payload).map_err(Error::from)?;
        let current_epoch = epoch_from_unix(self.clock.now_unix());

        let accepted = {
            let mut store = self.store.lock().expect("store lock");
            store.put(
                request.pseudonym,
                request.epoch,
                request.message_id,
                request.payload,
                current_epoch,
            )
        };

        match accepted {
            Ok(()) => {
                self.send_to_addr(
                    PacketType::AsyncPutAck,
                    request.message_id.to_vec(),
                    &source,
                )
                .await?;
                Ok(())
            }
            Err(AsyncError::StaleEpoch) => Err(Error::StaleEpoch),
            Err(e) => {
                tracing::debug!(error = %e, "store rejected put");
                Ok(())
            }
        }
    }

    fn on_async_put_ack(&self, payload: &[u8]) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(Error::TransportUnavailable)?;
        let message_id: [u8; 32] = payload.try_into().map_err(|_| Error::SendFailed)?;
        rpc.resolve_put_ack(message_id);
        Ok(())
    }

    async fn on_async_get(&self, payload: &[u8], source: NetworkAddress) -> Result<()> {
        if !self.config.storage_node {
            return Ok(());
        }
        let wire: GetWire = bincode::deserialize(payload).map_err(|_| Error::SendFailed)?;

        let envelopes = {
            let store = self.store.lock().expect("store lock");
            store.get(&wire.pseudonym, wire.epoch)
        };

        // Bound the response to one packet; leftovers stay in the store
        // and come out on the retriever's next call
        let mut budget = hush_transport::MAX_PAYLOAD_SIZE.saturating_sub(1024);
        let envelopes: Vec<_> = envelopes
            .into_iter()
            .take_while(|e| {
                let cost = e.payload.len() + 64;
                if cost <= budget {
                    budget -= cost;
                    true
                } else {
                    false
                }
            })
            .collect();

        let response = GetResponseWire {
            pseudonym: wire.pseudonym,
            epoch: wire.epoch,
            envelopes,
        };
        let body = bincode::serialize(&response).map_err(|_| Error::SendFailed)?;
        self.send_to_addr(PacketType::AsyncGetResponse, body, &source).await?;
        Ok(())
    }

    fn on_async_get_response(&self, payload: &[u8]) -> Result<()> {
        let rpc = self.rpc.as_ref().ok_or(Error::TransportUnavailable)?;
        let wire: GetResponseWire = bincode::deserialize(payload).map_err(|_| Error::SendFailed)?;
        rpc.resolve_get_response(wire);
        Ok(())
    }

    // ================= timers =================

    async fn service_handshake_timers(&self) {
        let now_ms = self.clock.now_millis();
        let now_unix = self.clock.now_unix();

        // Collect work under the lock, act after releasing it
        let mut restarts: Vec<(PublicKey, Vec<u8>)> = Vec::new();
        {
            let mut sessions = self.sessions.write().expect("session lock");
            let mut expired: Vec<PublicKey> = Vec::new();
            for (peer, session) in sessions.iter() {
                if session.handshake_expired(now_ms) {
                    expired.push(*peer);
                }
            }
            for peer in expired {
                if let Some(session) = sessions.get_mut(&peer) {
                    match session.note_handshake_timeout(now_ms) {
                        Some(retry_at) => {
                            tracing::debug!(peer = %hex::encode(&peer[..8]), retry_at, "handshake timed out, retry scheduled");
                        }
                        None => {
                            tracing::warn!(peer = %hex::encode(&peer[..8]), "handshake retries exhausted");
                            session.close();
                        }
                    }
                }
            }

            let retry_peers: Vec<PublicKey> = sessions
                .iter()
                .filter(|(_, s)| s.retry_due(now_ms))
                .map(|(p, _)| *p)
                .collect();
            for peer in retry_peers {
                if let Some(session) = sessions.get_mut(&peer) {
                    let msg1 = self.with_identity(|id| {
                        session.start_handshake(id.static_keys(), now_ms, now_unix)
                    });
                    if let Ok(Ok(msg1)) = msg1 {
                        restarts.push((peer, msg1));
                    }
                }
            }
        }

        for (peer, msg1) in restarts {
            if let Some(addr) = self.addresses.get(&peer).map(|a| *a.value()) {
                let _ = self.send_to_addr(PacketType::Handshake1, msg1, &addr).await;
            }
        }
    }

    /// Roll sessions whose counters entered the rekey margin.
    async fn service_rekeys(&self) {
        let now_ms = self.clock.now_millis();

        let mut rekeys: Vec<(PublicKey, Vec<u8>)> = Vec::new();
        {
            let mut sessions = self.sessions.write().expect("session lock");
            let due: Vec<PublicKey> = sessions
                .iter()
                .filter(|(_, s)| s.needs_rekey())
                .map(|(p, _)| *p)
                .collect();
            for peer in due {
                if let Some(session) = sessions.get_mut(&peer) {
                    match session.begin_rekey(now_ms) {
                        Ok(record) => rekeys.push((peer, record)),
                        Err(e) => {
                            tracing::warn!(peer = %hex::encode(&peer[..8]), error = %e, "rekey failed");
                        }
                    }
                }
            }
        }

        for (peer, record) in rekeys {
            let _ = self.send_record(&peer, PacketType::Rekey, record).await;
        }
    }

    async fn service_pending_requests(&self) {
        let now_ms = self.clock.now_millis();

        let due: Vec<PendingFriendRequest> = {
            let mut queue = self.pending_requests.lock().expect("request lock");
            let mut due = Vec::new();
            let mut index = 0;
            while index < queue.len() {
                if queue[index].is_due(now_ms) {
                    due.push(queue.remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };

        for mut entry in due {
            let sent = self.try_send_friend_request(&entry).await;
            if sent {
                tracing::debug!(target = ?entry.target, "friend request delivered");
                continue;
            }

            if entry.reschedule(now_ms) {
                self.pending_requests.lock().expect("request lock").push(entry);
            } else {
                tracing::warn!(target = ?entry.target, "friend request retries exhausted");
            }
        }
    }

    async fn try_send_friend_request(&self, entry: &PendingFriendRequest) -> bool {
        let Some(rpc) = self.rpc.as_ref() else {
            return false;
        };

        let target_key = entry.target.public_key;
        let addr = match self.addresses.get(&target_key).map(|a| *a.value()) {
            Some(addr) => Some(addr),
            None => {
                let now = self.clock.now_unix();
                let routing = self.routing.read().expect("routing lock");
                routing
                    .get(&NodeId::from_public_key(target_key))
                    .filter(|n| n.is_live(now))
                    .and_then(|n| NetworkAddress::from_socket_addr(n.addr).ok())
            }
        };
        let Some(addr) = addr else {
            return false;
        };

        let wire = FriendRequestWire {
            target_nospam: entry.target.nospam,
            message: entry.message.clone(),
        };
        let Ok(body) = bincode::serialize(&wire) else {
            return false;
        };
        let Ok(sealed) = rpc.seal_to(&target_key, &body) else {
            return false;
        };

        matches!(
            self.send_to_addr(PacketType::FriendRequest, sealed, &addr).await,
            Ok(SendOutcome::Sent)
        )
    }

    async fn service_pending_messages(&self) {
        let now_ms = self.clock.now_millis();
        let due = self
            .pending_messages
            .lock()
            .expect("pending lock")
            .drain_due(now_ms);

        for (friend, mut entry) in due {
            let Ok(public_key) = self.friend_public_key(friend) else {
                continue;
            };

            let sent = 'attempt: {
                let mut plaintext = Vec::with_capacity(1 + entry.message.len());
                plaintext.push(match entry.kind {
                    MessageKind::Normal => 0,
                    MessageKind::Action => 1,
                });
                plaintext.extend_from_slice(entry.message.as_bytes());

                let Ok(record) = self.seal_record(&public_key, &plaintext) else {
                    break 'attempt false;
                };
                matches!(
                    self.send_record(&public_key, PacketType::FriendMessage, record).await,
                    Ok(SendOutcome::Sent)
                )
            };

            if sent {
                continue;
            }

            if entry.reschedule(now_ms) {
                self.pending_messages
                    .lock()
                    .expect("pending lock")
                    .push(friend, entry);
            } else {
                tracing::warn!(friend, "message delivery failed after retries");
            }
        }
    }

    async fn run_maintenance(&self) {
        let now_ms = self.clock.now_millis();
        let last = self.last_maintenance_ms.load(Ordering::Relaxed);
        if last != 0 && now_ms.saturating_sub(last) < MAINTENANCE_INTERVAL_MS {
            return;
        }
        self.last_maintenance_ms.store(now_ms, Ordering::Relaxed);

        let now_unix = self.clock.now_unix();

        self.replay_cache.lock().expect("replay lock").gc(now_unix);
        self.store
            .lock()
            .expect("store lock")
            .cleanup_old_epochs(epoch_from_unix(now_unix));
        self.refill_prekeys();

        // Bucket refresh: look up a random id in each stale bucket
        if let Some(rpc) = self.rpc.clone() {
            let refresh_targets: Vec<NodeId> = {
                let routing = self.routing.read().expect("routing lock");
                routing
                    .stale_buckets(now_unix, BUCKET_REFRESH_SECS)
                    .into_iter()
                    .take(4)
                    .filter_map(|index| routing.random_id_in_bucket(index).ok())
                    .collect()
            };

            for target in refresh_targets {
                let seeds: Vec<NodeInfo> = {
                    let routing = self.routing.read().expect("routing lock");
                    routing
                        .find_closest(&target, K)
                        .into_iter()
                        .map(|n| NodeInfo { id: n.id, addr: n.addr })
                        .collect()
                };
                let found = iterative_find_node(seeds, &rpc, target).await;
                let mut routing = self.routing.write().expect("routing lock");
                for node in found {
                    routing.insert(node.id, node.addr, now_unix);
                }
            }

            // Drain the offline inbox on the maintenance cadence
            if let Err(e) = self.check_async_inbox().await {
                tracing::debug!(error = %e, "async inbox check failed");
            }
        }

        self.lan_announce().await;
    }

    /// Announce our presence on the local segment.
    async fn lan_announce(&self) {
        if !self.config.local_discovery {
            return;
        }
        // Broadcast only exists on the real datagram substrate
        if !matches!(self.config.transport, TransportMode::Udp) {
            return;
        }
        let Ok(public_key) = self.public_key() else {
            return;
        };

        let broadcast = std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::BROADCAST,
            self.config.udp_port_start,
        );
        let _ = self
            .send_to_addr(
                PacketType::LanAnnounce,
                public_key.to_vec(),
                &NetworkAddress::V4(broadcast),
            )
            .await;
    }

    // ================= shutdown =================

    /// Shut the node down: zeroize identity material, close transports,
    /// drop all state. Idempotent; every later operation returns
    /// [`Error::NotRunning`] and no further callback fires.
    pub async fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(transport) = self.transport.as_ref() {
            let _ = transport.close().await;
        }
        if let Some(relay) = self.relay_client.as_ref() {
            let _ = relay.close().await;
        }
        if let Some(server) = self.relay_server.as_ref() {
            server.shutdown();
        }

        // StaticKeypair and SessionCrypto zeroize on drop
        *self.identity.write().expect("identity lock") = None;
        self.sessions.write().expect("session lock").clear();
        *self.friends.write().expect("friend lock") = FriendRegistry::new();
        self.pending_messages.lock().expect("pending lock").drain_due(u64::MAX);
        self.pending_requests.lock().expect("request lock").clear();
        self.addresses.clear();
        self.peers_by_addr.clear();

        tracing::info!("node killed");
    }

    /// Seal and send an arbitrary message record, bypassing send-side
    /// validation. Exists to exercise receive-side edge cases (empty
    /// records, invalid UTF-8) from integration tests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FriendOffline`] when no session exists.
    #[cfg(feature = "testing")]
    pub async fn send_raw_record(&self, friend: FriendId, plaintext: &[u8]) -> Result<()> {
        self.check_running()?;
        let public_key = self.friend_public_key(friend)?;
        let record = self.seal_record(&public_key, plaintext)?;
        self.expect_sent(
            self.send_record(&public_key, PacketType::FriendMessage, record)
                .await?,
        )
    }

    /// Dropped-packet counters for crypto failures.
    #[must_use]
    pub fn crypto_drop_counts(&self) -> (u64, u64, u64, u64) {
        (
            self.metrics.bad_mac.load(Ordering::Relaxed),
            self.metrics.replays.load(Ordering::Relaxed),
            self.metrics.stale_timestamps.load(Ordering::Relaxed),
            self.metrics.out_of_window.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MockClock;
    use hush_transport::sim::SimNetwork;

    fn sim_addr(tag: u8) -> NetworkAddress {
        NetworkAddress::from_socket_addr(format!("10.0.0.{tag}:33445").parse().unwrap()).unwrap()
    }

    async fn sim_node(net: &SimNetwork, tag: u8, clock: Arc<MockClock>) -> Node {
        Node::new(NodeConfig::simulated(net.clone(), sim_addr(tag), clock))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_address_roundtrip() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, clock).await;

        let address = node.address().unwrap();
        assert_eq!(address.len(), 76);

        let parsed = ToxId::from_hex(&address).unwrap();
        assert_eq!(parsed.public_key, node.public_key().unwrap());
        assert_eq!(parsed.nospam, node.nospam().unwrap());
    }

    #[tokio::test]
    async fn test_savedata_roundtrip_preserves_state() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, Arc::clone(&clock)).await;

        node.set_name("alice").unwrap();
        node.set_status_message("around").unwrap();
        let friend_a = node.add_friend_norequest([0x11; 32]).unwrap();
        let friend_b = node.add_friend_norequest([0x22; 32]).unwrap();

        let savedata = node.savedata().unwrap();

        let net2 = SimNetwork::new();
        let restored = Node::from_savedata(
            NodeConfig::simulated(net2, sim_addr(2), clock),
            &savedata,
        )
        .await
        .unwrap();

        assert_eq!(restored.public_key().unwrap(), node.public_key().unwrap());
        assert_eq!(restored.nospam().unwrap(), node.nospam().unwrap());
        assert_eq!(restored.name().unwrap(), "alice");
        assert_eq!(restored.status_message().unwrap(), "around");
        assert_eq!(restored.friend_id(&[0x11; 32]).unwrap(), friend_a);
        assert_eq!(restored.friend_id(&[0x22; 32]).unwrap(), friend_b);
    }

    #[tokio::test]
    async fn test_friend_id_allocation() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, clock).await;

        let mut previous = 0;
        for tag in 1..=5u8 {
            let id = node.add_friend_norequest([tag; 32]).unwrap();
            assert!(id > previous);
            previous = id;
        }
        assert_eq!(node.friend_id(&[99; 32]).unwrap(), NO_FRIEND);
    }

    #[tokio::test]
    async fn test_message_validation() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, clock).await;
        let friend = node.add_friend_norequest([0x11; 32]).unwrap();

        assert_eq!(
            node.send_friend_message(friend, "").await,
            Err(Error::EmptyMessage)
        );
        assert_eq!(
            node.send_friend_message(friend, &"x".repeat(1373)).await,
            Err(Error::MessageTooLong)
        );
    }

    #[tokio::test]
    async fn test_offline_send_without_prekeys() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, clock).await;
        let friend = node.add_friend_norequest([0x11; 32]).unwrap();

        // Friend is offline and we hold none of their pre-keys
        assert_eq!(
            node.send_friend_message(friend, "hello").await,
            Err(Error::NoPreKeys)
        );
    }

    #[tokio::test]
    async fn test_post_kill_not_running() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, clock).await;
        let friend = node.add_friend_norequest([0x11; 32]).unwrap();

        node.kill().await;
        node.kill().await; // idempotent

        assert_eq!(node.address(), Err(Error::NotRunning));
        assert_eq!(node.public_key(), Err(Error::NotRunning));
        assert_eq!(node.savedata(), Err(Error::NotRunning));
        assert_eq!(node.add_friend_norequest([0x22; 32]), Err(Error::NotRunning));
        assert_eq!(
            node.send_friend_message(friend, "x").await,
            Err(Error::NotRunning)
        );
        assert!(matches!(node.iterate().await, Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn test_set_nospam_changes_address() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, clock).await;

        let before = node.address().unwrap();
        node.set_nospam([0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
        let after = node.address().unwrap();

        assert_ne!(before, after);
        // Old address still parses
        assert!(ToxId::from_hex(&before).is_ok());
        // New checksum matches the new nospam
        let parsed = ToxId::from_hex(&after).unwrap();
        assert_eq!(parsed.nospam, [0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[tokio::test]
    async fn test_connection_status_hook() {
        let net = SimNetwork::new();
        let clock = MockClock::at_unix(1_700_000_000);
        let node = sim_node(&net, 1, clock).await;
        let friend = node.add_friend_norequest([0x11; 32]).unwrap();

        assert_eq!(
            node.get_friend_connection_status(friend).unwrap(),
            ConnectionStatus::None
        );

        node.set_friend_connection_status(friend, ConnectionStatus::Udp)
            .unwrap();
        assert_eq!(
            node.get_friend_connection_status(friend).unwrap(),
            ConnectionStatus::Udp
        );

        assert_eq!(
            node.get_friend_connection_status(9999),
            Err(Error::FriendNotFound)
        );
    }
}
