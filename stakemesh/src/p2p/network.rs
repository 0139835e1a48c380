//! Network event loop
//!
//! `PeerNetwork::start` binds both listeners and spawns a single loop that
//! owns the peer table. Dials run on their own tasks and report back into
//! the loop; every connection has one reader and one writer task.

use super::message::{Heartbeat, MessageKind, NetworkMessage, PeerDiscovery, SyncRequest, SyncResponse};
use super::peer::{ConnectionDirection, PeerConnection, PeerId, PeerInfo, TransportKind};
use super::transport::{spawn_connection, Frame};
use super::{
    NetworkConfig, NetworkError, NetworkEvent, NetworkResult, CAPABILITY_BLOCK, CAPABILITY_TRANSACTION,
};
use crate::types::{now_millis, Block, Transaction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use stakemesh_crypto::{Ed25519Keypair, Ed25519Verifier, Signer, Verifier};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Signing and verification capabilities of the local node
#[derive(Clone)]
pub struct NetworkIdentity {
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
}

impl NetworkIdentity {
    /// Build from explicit capabilities
    pub fn new(signer: Arc<dyn Signer>, verifier: Arc<dyn Verifier>) -> Self {
        Self { signer, verifier }
    }

    /// Ed25519 identity
    pub fn ed25519(keypair: Ed25519Keypair) -> Self {
        Self::new(Arc::new(keypair), Arc::new(Ed25519Verifier))
    }

    /// Hex public key used as the envelope `sender`
    pub fn node_id(&self) -> String {
        self.signer.public_key().to_hex()
    }
}

/// Events from connection and dial tasks to the loop
pub(crate) enum InternalEvent {
    Dialed {
        target: DialTarget,
        outcome: Result<(TcpStream, SocketAddr), String>,
        reply: oneshot::Sender<bool>,
    },
    Message {
        peer: PeerId,
        raw: Vec<u8>,
    },
    Closed {
        peer: PeerId,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DialTarget {
    host: String,
    port: u16,
    transport: TransportKind,
}

enum Command {
    Connect {
        target: DialTarget,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        kind: MessageKind,
        capability: &'static str,
        data: serde_json::Value,
        reply: oneshot::Sender<usize>,
    },
    Send {
        peer: PeerId,
        kind: MessageKind,
        data: serde_json::Value,
        reply: oneshot::Sender<NetworkResult<()>>,
    },
    GetPeers(oneshot::Sender<Vec<PeerInfo>>),
    PeerCount(oneshot::Sender<usize>),
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Handle for the application to interact with the network loop
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::Sender<Command>,
    node_id: Arc<str>,
}

impl NetworkHandle {
    /// Hex public key of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> NetworkResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)
    }

    /// Dial a peer
    ///
    /// `Ok(false)` on timeout, dial failure, duplicate address or when the
    /// peer limit is reached.
    pub async fn connect_to_peer(&self, host: &str, port: u16, transport: TransportKind) -> NetworkResult<bool> {
        let target = DialTarget {
            host: host.to_string(),
            port,
            transport,
        };
        self.request(|reply| Command::Connect { target, reply }).await
    }

    /// Gossip a block to peers advertising `block`; returns peers reached
    pub async fn broadcast_block(&self, block: &Block) -> NetworkResult<usize> {
        self.broadcast(MessageKind::Block, CAPABILITY_BLOCK, block).await
    }

    /// Gossip a transaction to peers advertising `transaction`
    pub async fn broadcast_transaction(&self, transaction: &Transaction) -> NetworkResult<usize> {
        self.broadcast(MessageKind::Transaction, CAPABILITY_TRANSACTION, transaction)
            .await
    }

    async fn broadcast<T: Serialize>(
        &self,
        kind: MessageKind,
        capability: &'static str,
        payload: &T,
    ) -> NetworkResult<usize> {
        let data = serde_json::to_value(payload)?;
        self.request(|reply| Command::Broadcast {
            kind,
            capability,
            data,
            reply,
        })
        .await
    }

    async fn send<T: Serialize>(&self, peer: PeerId, kind: MessageKind, payload: &T) -> NetworkResult<()> {
        let data = serde_json::to_value(payload)?;
        self.request(|reply| Command::Send {
            peer,
            kind,
            data,
            reply,
        })
        .await?
    }

    /// Ask `peer` for blocks `from..=to`
    pub async fn request_sync(&self, peer: PeerId, from: u64, to: u64) -> NetworkResult<()> {
        self.send(peer, MessageKind::SyncRequest, &SyncRequest { from, to })
            .await
    }

    /// Answer a sync request
    pub async fn send_sync_response(
        &self,
        peer: PeerId,
        blocks: Vec<Block>,
        transactions: Vec<Transaction>,
    ) -> NetworkResult<()> {
        self.send(peer, MessageKind::SyncResponse, &SyncResponse { blocks, transactions })
            .await
    }

    /// Snapshot of all connected peers
    pub async fn get_peers(&self) -> NetworkResult<Vec<PeerInfo>> {
        self.request(Command::GetPeers).await
    }

    /// Number of connected peers
    pub async fn get_connected_peers_count(&self) -> NetworkResult<usize> {
        self.request(Command::PeerCount).await
    }

    /// Close a connection; `false` if it was not open
    pub async fn disconnect(&self, peer: PeerId) -> NetworkResult<bool> {
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    /// Stop the loop and close every connection
    pub async fn shutdown(&self) -> NetworkResult<()> {
        self.command_tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| NetworkError::Shutdown)
    }
}

/// Result of starting the network
pub struct StartedNetwork {
    pub handle: NetworkHandle,
    pub events: mpsc::Receiver<NetworkEvent>,
    /// Bound stream transport address (useful when listening on port 0)
    pub stream_addr: SocketAddr,
    /// Bound framed transport address
    pub framed_addr: SocketAddr,
}

/// Dual-transport peer network
pub struct PeerNetwork;

impl PeerNetwork {
    /// Bind both listeners and spawn the event loop
    pub async fn start(config: NetworkConfig, identity: NetworkIdentity) -> NetworkResult<StartedNetwork> {
        let stream_listener = bind(&config.host, config.stream_port, TransportKind::Stream).await?;
        let framed_listener = bind(&config.host, config.framed_port, TransportKind::Framed).await?;
        let stream_addr = stream_listener.local_addr()?;
        let framed_addr = framed_listener.local_addr()?;

        let (command_tx, command_rx) = mpsc::channel::<Command>(256);
        let (event_tx, event_rx) = mpsc::channel::<NetworkEvent>(config.event_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::channel::<InternalEvent>(1024);

        let node_id = identity.node_id();
        info!(
            node = %node_id,
            stream = %stream_addr,
            framed = %framed_addr,
            "Network listening"
        );

        let network = NetworkLoop {
            node_id: node_id.clone(),
            identity,
            peers: HashMap::new(),
            pending_dials: HashSet::new(),
            next_peer_id: 1,
            internal_tx,
            event_tx,
            stream_port: stream_addr.port(),
            framed_port: framed_addr.port(),
            rng: StdRng::from_entropy(),
            config,
        };
        tokio::spawn(network.run(stream_listener, framed_listener, command_rx, internal_rx));

        Ok(StartedNetwork {
            handle: NetworkHandle {
                command_tx,
                node_id: node_id.into(),
            },
            events: event_rx,
            stream_addr,
            framed_addr,
        })
    }
}

async fn bind(host: &str, port: u16, transport: TransportKind) -> NetworkResult<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| NetworkError::Bind {
            transport,
            addr,
            source,
        })
}

struct NetworkLoop {
    config: NetworkConfig,
    identity: NetworkIdentity,
    node_id: String,
    peers: HashMap<PeerId, PeerConnection>,
    pending_dials: HashSet<DialTarget>,
    next_peer_id: u64,
    internal_tx: mpsc::Sender<InternalEvent>,
    event_tx: mpsc::Sender<NetworkEvent>,
    stream_port: u16,
    framed_port: u16,
    rng: StdRng,
}

impl NetworkLoop {
    async fn run(
        mut self,
        stream_listener: TcpListener,
        framed_listener: TcpListener,
        mut command_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::Receiver<InternalEvent>,
    ) {
        let start = tokio::time::Instant::now();
        let mut heartbeat =
            tokio::time::interval_at(start + self.config.heartbeat_interval, self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = tokio::time::interval_at(
            start + self.config.housekeeping_interval,
            self.config.housekeeping_interval,
        );
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = stream_listener.accept() => {
                    self.on_accept(result, TransportKind::Stream);
                }

                result = framed_listener.accept() => {
                    self.on_accept(result, TransportKind::Framed);
                }

                cmd = command_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.on_command(cmd),
                    }
                }

                Some(event) = internal_rx.recv() => {
                    self.on_internal(event);
                }

                _ = heartbeat.tick() => {
                    self.send_heartbeats();
                }

                _ = housekeeping.tick() => {
                    self.disconnect_idle();
                }
            }
        }

        let count = self.peers.len();
        self.peers.clear();
        info!(peers = count, "Network stopped");
    }

    // ── Connections ──

    fn capacity_left(&self) -> bool {
        self.peers.len() + self.pending_dials.len() < self.config.max_peers
    }

    fn on_accept(&mut self, result: std::io::Result<(TcpStream, SocketAddr)>, transport: TransportKind) {
        match result {
            Ok((stream, addr)) => {
                if !self.capacity_left() {
                    debug!(addr = %addr, transport = %transport, "Rejected inbound connection, peer limit reached");
                    return;
                }
                self.register(stream, addr, transport, ConnectionDirection::Inbound);
            }
            Err(e) => warn!(transport = %transport, error = %e, "Accept failed"),
        }
    }

    fn start_dial(&mut self, target: DialTarget, reply: oneshot::Sender<bool>) {
        if self.pending_dials.contains(&target) {
            debug!(host = %target.host, port = target.port, "Dial already in progress");
            let _ = reply.send(false);
            return;
        }
        if !self.capacity_left() {
            debug!(host = %target.host, port = target.port, "Peer limit reached, not dialing");
            let _ = reply.send(false);
            return;
        }

        self.pending_dials.insert(target.clone());
        let internal_tx = self.internal_tx.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let addr = format!("{}:{}", target.host, target.port);
            let outcome = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => match stream.peer_addr() {
                    Ok(peer_addr) => Ok((stream, peer_addr)),
                    Err(e) => Err(e.to_string()),
                },
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("connect timed out".to_string()),
            };
            let _ = internal_tx
                .send(InternalEvent::Dialed {
                    target,
                    outcome,
                    reply,
                })
                .await;
        });
    }

    fn on_dialed(
        &mut self,
        target: DialTarget,
        outcome: Result<(TcpStream, SocketAddr), String>,
        reply: oneshot::Sender<bool>,
    ) {
        self.pending_dials.remove(&target);

        let (stream, addr) = match outcome {
            Ok(connected) => connected,
            Err(reason) => {
                debug!(host = %target.host, port = target.port, reason = %reason, "Dial failed");
                let _ = reply.send(false);
                return;
            }
        };

        if self.peers.values().any(|p| p.info.addr == addr) {
            debug!(addr = %addr, "Already connected to address");
            let _ = reply.send(false);
            return;
        }
        if !self.capacity_left() {
            debug!(addr = %addr, "Peer limit reached after dial");
            let _ = reply.send(false);
            return;
        }

        self.register(stream, addr, target.transport, ConnectionDirection::Outbound);
        let _ = reply.send(true);
    }

    fn register(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        transport: TransportKind,
        direction: ConnectionDirection,
    ) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (sender, reader) = spawn_connection(stream, id, transport, self.internal_tx.clone(), self.config.peer_buffer);
        self.peers
            .insert(id, PeerConnection::new(id, addr, transport, direction, sender, reader));

        info!(peer = %id, addr = %addr, transport = %transport, ?direction, "Peer connected");
        self.send_discovery(id);
        self.emit(NetworkEvent::PeerConnected {
            peer: id,
            addr,
            transport,
            direction,
        });
        id
    }

    fn drop_peer(&mut self, id: PeerId, reason: &str) -> bool {
        match self.peers.remove(&id) {
            Some(peer) => {
                info!(peer = %id, addr = %peer.info.addr, reason, "Peer disconnected");
                drop(peer);
                self.emit(NetworkEvent::PeerDisconnected {
                    peer: id,
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    // ── Outbound ──

    fn envelope<T: Serialize>(&self, kind: MessageKind, payload: &T) -> NetworkResult<Frame> {
        let data = serde_json::to_value(payload)?;
        self.envelope_value(kind, data)
    }

    fn envelope_value(&self, kind: MessageKind, data: serde_json::Value) -> NetworkResult<Frame> {
        let mut message = NetworkMessage {
            kind,
            data,
            timestamp: now_millis(),
            sender: self.node_id.clone(),
            signature: None,
        };
        if self.config.sign_messages {
            message = message.sign(self.identity.signer.as_ref());
        }
        Ok(Frame::from(message.encode()?))
    }

    fn send_frame(&self, id: PeerId, frame: Frame) -> NetworkResult<()> {
        let peer = self.peers.get(&id).ok_or(NetworkError::PeerNotFound(id))?;
        peer.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::PeerBusy(id),
            mpsc::error::TrySendError::Closed(_) => NetworkError::PeerNotFound(id),
        })
    }

    fn send_discovery(&mut self, id: PeerId) {
        let discovery = PeerDiscovery {
            node_id: self.node_id.clone(),
            capabilities: self.config.capabilities.clone(),
            stream_port: Some(self.stream_port),
            framed_port: Some(self.framed_port),
            known_peers: self
                .peers
                .values()
                .filter(|p| p.info.id != id)
                .filter_map(|p| p.info.dial_address())
                .collect(),
        };
        let sent = self
            .envelope(MessageKind::PeerDiscovery, &discovery)
            .and_then(|frame| self.send_frame(id, frame));
        if let Err(e) = sent {
            warn!(peer = %id, error = %e, "Failed to send peer discovery");
            self.drop_peer(id, "discovery send failed");
        }
    }

    fn broadcast(&mut self, kind: MessageKind, capability: &str, data: serde_json::Value) -> usize {
        let frame = match self.envelope_value(kind, data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let targets: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.info.has_capability(capability))
            .map(|p| p.info.id)
            .collect();

        let mut reached = 0;
        for id in targets {
            match self.send_frame(id, frame.clone()) {
                Ok(()) => reached += 1,
                Err(e) => {
                    warn!(peer = %id, kind = %kind, error = %e, "Broadcast to peer failed");
                    self.drop_peer(id, "broadcast failed");
                }
            }
        }
        debug!(kind = %kind, reached, "Broadcast");
        reached
    }

    fn send_heartbeats(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            let nonce: u64 = self.rng.gen();
            let sent = self
                .envelope(MessageKind::Ping, &Heartbeat { nonce })
                .and_then(|frame| self.send_frame(id, frame));
            match sent {
                Ok(()) => {
                    if let Some(peer) = self.peers.get_mut(&id) {
                        peer.pending_ping = Some((nonce, Instant::now()));
                    }
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "Heartbeat failed");
                    self.drop_peer(id, "heartbeat failed");
                }
            }
        }
    }

    fn disconnect_idle(&mut self) {
        let idle_timeout = self.config.idle_timeout;
        let idle: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.info.last_seen.elapsed() > idle_timeout)
            .map(|p| p.info.id)
            .collect();
        for id in idle {
            self.drop_peer(id, "idle timeout");
        }
    }

    fn emit(&self, event: NetworkEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Network event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // ── Inbound ──

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { target, reply } => self.start_dial(target, reply),
            Command::Broadcast {
                kind,
                capability,
                data,
                reply,
            } => {
                let reached = self.broadcast(kind, capability, data);
                let _ = reply.send(reached);
            }
            Command::Send {
                peer,
                kind,
                data,
                reply,
            } => {
                let result = self
                    .envelope_value(kind, data)
                    .and_then(|frame| self.send_frame(peer, frame));
                let _ = reply.send(result);
            }
            Command::GetPeers(reply) => {
                let peers = self.peers.values().map(|p| p.info.clone()).collect();
                let _ = reply.send(peers);
            }
            Command::PeerCount(reply) => {
                let _ = reply.send(self.peers.len());
            }
            Command::Disconnect { peer, reply } => {
                let _ = reply.send(self.drop_peer(peer, "requested"));
            }
            Command::Shutdown => {}
        }
    }

    fn on_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Dialed {
                target,
                outcome,
                reply,
            } => self.on_dialed(target, outcome, reply),
            InternalEvent::Message { peer, raw } => self.handle_message(peer, &raw),
            InternalEvent::Closed { peer, reason } => {
                self.drop_peer(peer, &reason);
            }
        }
    }

    fn handle_message(&mut self, peer: PeerId, raw: &[u8]) {
        if !self.peers.contains_key(&peer) {
            return;
        }

        let message = match NetworkMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping malformed message");
                return;
            }
        };

        let age_ms = message.age_ms(now_millis());
        if u128::from(age_ms) > self.config.message_staleness.as_millis() {
            warn!(peer = %peer, kind = %message.kind, age_ms, "Dropping stale message");
            return;
        }

        if message.is_signed() {
            if let Err(e) = message.verify(self.identity.verifier.as_ref()) {
                warn!(peer = %peer, kind = %message.kind, error = %e, "Dropping message with bad signature");
                return;
            }
        }

        if let Some(conn) = self.peers.get_mut(&peer) {
            conn.info.last_seen = Instant::now();
        }
        debug!(peer = %peer, kind = %message.kind, "Message received");

        match message.kind {
            MessageKind::PeerDiscovery => {
                if let Some(discovery) = decode::<PeerDiscovery>(peer, &message) {
                    self.on_discovery(peer, discovery);
                }
            }
            MessageKind::Block => {
                if let Some(block) = decode::<Block>(peer, &message) {
                    self.emit(NetworkEvent::BlockReceived {
                        peer,
                        block: Box::new(block),
                    });
                }
            }
            MessageKind::Transaction => {
                if let Some(transaction) = decode::<Transaction>(peer, &message) {
                    self.emit(NetworkEvent::TransactionReceived {
                        peer,
                        transaction: Box::new(transaction),
                    });
                }
            }
            MessageKind::SyncRequest => {
                if let Some(SyncRequest { from, to }) = decode(peer, &message) {
                    self.emit(NetworkEvent::SyncRequested { peer, from, to });
                }
            }
            MessageKind::SyncResponse => {
                if let Some(SyncResponse { blocks, transactions }) = decode(peer, &message) {
                    self.emit(NetworkEvent::SyncResponse {
                        peer,
                        blocks,
                        transactions,
                    });
                }
            }
            MessageKind::Ping => {
                if let Some(Heartbeat { nonce }) = decode(peer, &message) {
                    let sent = self
                        .envelope(MessageKind::Pong, &Heartbeat { nonce })
                        .and_then(|frame| self.send_frame(peer, frame));
                    if let Err(e) = sent {
                        debug!(peer = %peer, error = %e, "Failed to answer ping");
                    }
                }
            }
            MessageKind::Pong => {
                if let Some(Heartbeat { nonce }) = decode(peer, &message) {
                    if let Some(conn) = self.peers.get_mut(&peer) {
                        if let Some(latency) = conn.record_pong(nonce) {
                            debug!(peer = %peer, latency_ms = latency.as_millis() as u64, "Pong");
                        }
                    }
                }
            }
        }
    }

    fn on_discovery(&mut self, peer: PeerId, discovery: PeerDiscovery) {
        if discovery.node_id == self.node_id {
            debug!(peer = %peer, "Dropping self-connection");
            self.drop_peer(peer, "self-connection");
            return;
        }

        let Some(conn) = self.peers.get_mut(&peer) else {
            return;
        };
        conn.info.node_id = Some(discovery.node_id.clone());
        conn.info.capabilities = discovery.capabilities.iter().cloned().collect();
        conn.info.stream_port = discovery.stream_port;
        conn.info.framed_port = discovery.framed_port;

        info!(
            peer = %peer,
            node = %discovery.node_id,
            capabilities = ?discovery.capabilities,
            known_peers = discovery.known_peers.len(),
            "Peer discovered"
        );
        self.emit(NetworkEvent::PeerDiscovered {
            peer,
            node_id: discovery.node_id,
            capabilities: discovery.capabilities,
            known_peers: discovery.known_peers,
        });
    }
}

fn decode<T: DeserializeOwned>(peer: PeerId, message: &NetworkMessage) -> Option<T> {
    match message.payload() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(peer = %peer, kind = %message.kind, error = %e, "Dropping message with invalid payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::NetworkConfig;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn identity(seed: u8) -> NetworkIdentity {
        NetworkIdentity::ed25519(Ed25519Keypair::from_seed(&[seed; 32]))
    }

    async fn next_event(events: &mut mpsc::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_start_binds_both_listeners() {
        let started = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        assert_ne!(started.stream_addr.port(), 0);
        assert_ne!(started.framed_addr.port(), 0);
        assert_ne!(started.stream_addr.port(), started.framed_addr.port());
        assert_eq!(started.handle.get_connected_peers_count().await.unwrap(), 0);
        started.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        let config = NetworkConfig {
            stream_port: first.stream_addr.port(),
            ..NetworkConfig::local()
        };
        let second = PeerNetwork::start(config, identity(2)).await;
        assert!(matches!(second, Err(NetworkError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_discovery_exchanged_on_connect() {
        let a = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        let mut b = PeerNetwork::start(NetworkConfig::local(), identity(2)).await.unwrap();

        let connected = b
            .handle
            .connect_to_peer("127.0.0.1", a.framed_addr.port(), TransportKind::Framed)
            .await
            .unwrap();
        assert!(connected);

        let mut discovered = None;
        while discovered.is_none() {
            if let NetworkEvent::PeerDiscovered { node_id, capabilities, .. } = next_event(&mut b.events).await {
                discovered = Some((node_id, capabilities));
            }
        }
        let (node_id, capabilities) = discovered.unwrap();
        assert_eq!(node_id, a.handle.node_id());
        assert_eq!(capabilities.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_dial_rejected() {
        let a = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        let b = PeerNetwork::start(NetworkConfig::local(), identity(2)).await.unwrap();
        let port = a.stream_addr.port();

        assert!(b.handle.connect_to_peer("127.0.0.1", port, TransportKind::Stream).await.unwrap());
        assert!(!b.handle.connect_to_peer("127.0.0.1", port, TransportKind::Stream).await.unwrap());
        assert_eq!(b.handle.get_connected_peers_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refused_dial_returns_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let net = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        assert!(!net.handle.connect_to_peer("127.0.0.1", port, TransportKind::Framed).await.unwrap());
        assert_eq!(net.handle.get_connected_peers_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ping_answered_over_raw_stream() {
        let net = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        let socket = TcpStream::connect(net.stream_addr).await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // First line is the node's own discovery
        let first: NetworkMessage = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.kind, MessageKind::PeerDiscovery);
        assert!(first.verify(&Ed25519Verifier).is_ok());

        let ping = NetworkMessage::new(MessageKind::Ping, &Heartbeat { nonce: 77 }, "remote", now_millis()).unwrap();
        let mut line = ping.encode().unwrap();
        line.push(b'\n');
        write_half.write_all(&line).await.unwrap();

        let pong: NetworkMessage = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(pong.kind, MessageKind::Pong);
        assert_eq!(pong.payload::<Heartbeat>().unwrap().nonce, 77);
    }

    #[tokio::test]
    async fn test_stale_and_malformed_messages_dropped() {
        let net = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        let socket = TcpStream::connect(net.stream_addr).await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        lines.next_line().await.unwrap();

        let stale = NetworkMessage::new(
            MessageKind::Ping,
            &Heartbeat { nonce: 1 },
            "remote",
            now_millis() - 40_000,
        )
        .unwrap();
        let fresh = NetworkMessage::new(MessageKind::Ping, &Heartbeat { nonce: 2 }, "remote", now_millis()).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"not json\n");
        bytes.extend_from_slice(&stale.encode().unwrap());
        bytes.push(b'\n');
        bytes.extend_from_slice(&fresh.encode().unwrap());
        bytes.push(b'\n');
        write_half.write_all(&bytes).await.unwrap();

        // Only the fresh ping is answered
        let pong: NetworkMessage = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(pong.payload::<Heartbeat>().unwrap().nonce, 2);
        assert_eq!(net.handle.get_connected_peers_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inbound_rejected_at_capacity() {
        let config = NetworkConfig {
            max_peers: 1,
            ..NetworkConfig::local()
        };
        let mut net = PeerNetwork::start(config, identity(1)).await.unwrap();

        let _first = TcpStream::connect(net.stream_addr).await.unwrap();
        assert!(matches!(next_event(&mut net.events).await, NetworkEvent::PeerConnected { .. }));

        let mut second = TcpStream::connect(net.framed_addr).await.unwrap();
        // Rejected socket is closed without a discovery frame
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), tokio::io::AsyncReadExt::read(&mut second, &mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(net.handle.get_connected_peers_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown() {
        let a = PeerNetwork::start(NetworkConfig::local(), identity(1)).await.unwrap();
        let mut b = PeerNetwork::start(NetworkConfig::local(), identity(2)).await.unwrap();
        assert!(b
            .handle
            .connect_to_peer("127.0.0.1", a.stream_addr.port(), TransportKind::Stream)
            .await
            .unwrap());

        let peer = match next_event(&mut b.events).await {
            NetworkEvent::PeerConnected { peer, .. } => peer,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(b.handle.disconnect(peer).await.unwrap());
        assert!(!b.handle.disconnect(peer).await.unwrap());
        assert!(matches!(
            b.handle.request_sync(peer, 1, 2).await,
            Err(NetworkError::PeerNotFound(_))
        ));

        b.handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            b.handle.get_connected_peers_count().await,
            Err(NetworkError::Shutdown)
        ));
    }
}
