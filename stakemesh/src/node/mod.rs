//! StakeMesh Node Implementation
//!
//! Full node that ties together:
//! - Consensus (stake-weighted proof of stake)
//! - P2P networking (dual-transport gossip)
//! - State storage (`StateStore`)
//! - Transaction pool (mempool)
//! - Block production and chain import

pub mod chain;
pub mod config;
pub mod mempool;
pub mod producer;

pub use chain::{BlockOrigin, BlockStatus, Chain, ChainError, ExecutionError, Finalized, ImportSource};
pub use config::{BootstrapPeer, ConfigError, GenesisConfig, GenesisValidator, Network, NodeConfig, ProducerConfig};
pub use mempool::{Mempool, MempoolConfig, MempoolError, MempoolStats};
pub use producer::{BlockProducer, CycleOutcome};

use crate::consensus::{ConsensusEngine, ConsensusError, ConsensusState, ValidationError};
use crate::p2p::{
    NetworkError, NetworkEvent, NetworkHandle, NetworkIdentity, PeerId, PeerNetwork, StartedNetwork,
    MAX_BLOCKS_PER_MESSAGE,
};
use crate::storage::{load_block_range, CacheConfig, CachedStateStore, MemoryStateStore, StateError, StateStore};
use crate::types::{Address, Block, BlockHash, Transaction, TxHash};
use parking_lot::RwLock;
use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Ed25519Verifier, SignatureError, Signer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Node status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Node is starting up
    Starting,
    /// Node is producing and importing blocks
    Running,
    /// Node is shutting down
    Stopping,
    /// Node has stopped
    Stopped,
}

/// Node events broadcast to subscribers
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Block added to the chain
    BlockFinalized {
        number: u64,
        hash: BlockHash,
        proposer: Address,
        transactions: usize,
        origin: BlockOrigin,
    },
    /// Epoch rotated
    EpochStarted { epoch: u64, validators: Vec<Address> },
    /// New transaction in mempool
    TransactionAccepted(TxHash),
    /// Peer connected
    PeerConnected { peer: PeerId, addr: SocketAddr },
    /// Peer disconnected
    PeerDisconnected { peer: PeerId, reason: String },
    /// Node status changed
    StatusChanged(NodeStatus),
}

/// StakeMesh full node
pub struct Node {
    config: NodeConfig,
    status: Arc<RwLock<NodeStatus>>,
    chain: Arc<Chain>,
    producer: Arc<BlockProducer>,
    network: NetworkHandle,
    stream_addr: SocketAddr,
    framed_addr: SocketAddr,
    address: Address,
    event_tx: broadcast::Sender<NodeEvent>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build every service from `config` and start networking and production
    ///
    /// Only startup failures are returned: config validation, genesis state,
    /// validator registration and listener binding.
    pub async fn start(config: NodeConfig, token: CancellationToken) -> NodeResult<Self> {
        config.validate()?;

        info!("Initializing StakeMesh node...");
        info!("  Network: {}", config.network);
        info!("  Data dir: {}", config.data_dir.display());

        let keypair = match config.identity_seed_bytes() {
            Some(seed) => Ed25519Keypair::from_seed(&seed),
            None => Ed25519Keypair::generate()?,
        };
        let address = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);

        // Genesis state
        let genesis = Block::genesis(
            config.genesis.timestamp,
            config.consensus.block_gas_limit,
            config.genesis.difficulty,
            &Blake3Hasher,
        );
        let memory = MemoryStateStore::new(config.genesis.gas_price);
        for (account, amount) in &config.genesis.balances {
            memory.credit(account, *amount)?;
            debug!(account = %account, amount = %amount, "Genesis allocation");
        }
        memory.add_block(&genesis)?;
        let state: Arc<dyn StateStore> = Arc::new(CachedStateStore::new(memory, CacheConfig::default()));
        info!("Genesis block hash: {}", genesis.hash());

        let mut engine = ConsensusEngine::new(
            config.consensus.clone(),
            &genesis,
            Arc::new(Blake3Hasher),
            Arc::new(Ed25519Verifier),
        );
        for validator in &config.genesis.validators {
            engine.add_validator(validator.address, validator.stake)?;
        }
        let first_epoch = engine.start_epoch();
        info!(
            epoch = first_epoch.epoch,
            validators = first_epoch.validators.len(),
            "First epoch selected"
        );

        let (event_tx, _) = broadcast::channel(1024);
        let mempool = Arc::new(Mempool::new(config.mempool.clone()));
        let chain = Arc::new(Chain::new(
            Arc::new(RwLock::new(engine)),
            state,
            mempool,
            event_tx.clone(),
        ));

        let StartedNetwork {
            handle,
            events,
            stream_addr,
            framed_addr,
        } = PeerNetwork::start(config.network_config(), NetworkIdentity::ed25519(keypair)).await?;

        let finalize_lock = Arc::new(Mutex::new(()));
        let producer = Arc::new(BlockProducer::new(
            chain.clone(),
            Some(handle.clone()),
            config.producer_validator(address),
            config.producer.clone(),
            finalize_lock.clone(),
        ));

        let mut tasks = Vec::new();
        {
            let producer = producer.clone();
            let token = token.child_token();
            tasks.push(tokio::spawn(async move { producer.run(token).await }));
        }
        {
            let handler = NetworkEventHandler {
                chain: chain.clone(),
                network: handle.clone(),
                finalize_lock,
                event_tx: event_tx.clone(),
            };
            let token = token.child_token();
            tasks.push(tokio::spawn(handler.run(events, token)));
        }

        for peer in &config.bootstrap_peers {
            match handle.connect_to_peer(&peer.host, peer.port, peer.transport).await {
                Ok(true) => info!(peer = %peer, "Connected to bootstrap peer"),
                Ok(false) => warn!(peer = %peer, "Bootstrap peer unreachable"),
                Err(e) => warn!(peer = %peer, error = %e, "Bootstrap dial failed"),
            }
        }

        let node = Self {
            config,
            status: Arc::new(RwLock::new(NodeStatus::Starting)),
            chain,
            producer,
            network: handle,
            stream_addr,
            framed_addr,
            address,
            event_tx,
            token,
            tasks,
        };
        node.set_status(NodeStatus::Running);

        info!("Node started successfully");
        info!("  Node id: {}", node.node_id());
        info!("  Stream transport: {}", node.stream_addr);
        info!("  Framed transport: {}", node.framed_addr);
        match node.config.producer_validator(address) {
            Some(validator) => info!("  Validator: {}", validator),
            None => info!("  Validator: any slot owner"),
        }

        Ok(node)
    }

    /// Stop the node gracefully
    pub async fn stop(mut self) -> NodeResult<()> {
        info!("Stopping StakeMesh node...");
        self.set_status(NodeStatus::Stopping);

        self.token.cancel();
        if let Err(e) = self.network.shutdown().await {
            debug!(error = %e, "Network already stopped");
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Node task ended abnormally");
            }
        }

        self.set_status(NodeStatus::Stopped);
        info!("Node stopped");
        Ok(())
    }

    /// Set node status and broadcast event
    fn set_status(&self, new_status: NodeStatus) {
        *self.status.write() = new_status;
        let _ = self.event_tx.send(NodeEvent::StatusChanged(new_status));
    }

    /// Get current node status
    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    /// Chain reference
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Block producer
    pub fn producer(&self) -> &Arc<BlockProducer> {
        &self.producer
    }

    /// Network handle
    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    /// Bound stream transport address
    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    /// Bound framed transport address
    pub fn framed_addr(&self) -> SocketAddr {
        self.framed_addr
    }

    /// Hex public key announced to peers
    pub fn node_id(&self) -> &str {
        self.network.node_id()
    }

    /// Account address of the node key
    pub fn address(&self) -> Address {
        self.address
    }

    /// Snapshot of consensus
    pub fn consensus_state(&self) -> ConsensusState {
        self.chain.engine().read().consensus_state()
    }

    /// Get current chain height
    pub fn height(&self) -> u64 {
        self.chain.height()
    }

    /// Get node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Validate a transaction, add it to the mempool and gossip it
    ///
    /// Returns `Ok(false)` when it was already pending.
    pub async fn submit_transaction(&self, tx: Transaction) -> NodeResult<bool> {
        let hash = tx.hash;
        if !accept_transaction(&self.chain, &self.event_tx, tx.clone())? {
            return Ok(false);
        }
        let peers = self.network.broadcast_transaction(&tx).await?;
        debug!(hash = %hash, peers, "Transaction submitted");
        Ok(true)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("status", &self.status())
            .field("height", &self.chain.height())
            .field("mempool_size", &self.chain.mempool().len())
            .finish()
    }
}

/// Check a transaction against consensus rules and the gas price floor,
/// then add it to the pool
fn accept_transaction(
    chain: &Chain,
    event_tx: &broadcast::Sender<NodeEvent>,
    tx: Transaction,
) -> NodeResult<bool> {
    chain.engine().read().validate_transaction(&tx)?;
    let min = chain.state().get_gas_price()?;
    if tx.gas_price < min {
        return Err(NodeError::GasPriceTooLow { price: tx.gas_price, min });
    }

    let hash = tx.hash;
    let added = chain.mempool().add(tx)?;
    if added {
        let _ = event_tx.send(NodeEvent::TransactionAccepted(hash));
    }
    Ok(added)
}

/// Applies network events to the chain
struct NetworkEventHandler {
    chain: Arc<Chain>,
    network: NetworkHandle,
    finalize_lock: Arc<Mutex<()>>,
    event_tx: broadcast::Sender<NodeEvent>,
}

impl NetworkEventHandler {
    async fn run(self, mut events: mpsc::Receiver<NetworkEvent>, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        debug!("Network event handler stopped");
    }

    async fn handle(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected { peer, addr, .. } => {
                let _ = self.event_tx.send(NodeEvent::PeerConnected { peer, addr });
            }
            NetworkEvent::PeerDisconnected { peer, reason } => {
                let _ = self.event_tx.send(NodeEvent::PeerDisconnected { peer, reason });
            }
            NetworkEvent::PeerDiscovered {
                peer,
                node_id,
                known_peers,
                ..
            } => {
                debug!(peer = %peer, node = %node_id, known = known_peers.len(), "Peer identified");
                // Catch up on anything produced before the link existed
                let head = self.chain.height();
                self.request_range(peer, head + 1, head + MAX_BLOCKS_PER_MESSAGE as u64).await;
            }
            NetworkEvent::BlockReceived { peer, block } => self.on_block(peer, *block).await,
            NetworkEvent::TransactionReceived { peer, transaction } => {
                self.on_transaction(peer, *transaction).await
            }
            NetworkEvent::SyncRequested { peer, from, to } => self.on_sync_request(peer, from, to).await,
            NetworkEvent::SyncResponse { peer, blocks, .. } => self.on_sync_response(peer, blocks).await,
        }
    }

    async fn on_block(&self, peer: PeerId, block: Block) {
        let _finalize = self.finalize_lock.lock().await;
        let relay = block.clone();
        match self.chain.import_block(block, ImportSource::Gossip) {
            Ok(BlockStatus::Imported { count }) => {
                debug!(peer = %peer, count, "Imported gossiped block");
                if let Err(e) = self.network.broadcast_block(&relay).await {
                    debug!(error = %e, "Block relay failed");
                }
            }
            Ok(BlockStatus::Orphan { from, to }) => self.request_range(peer, from, to).await,
            Ok(BlockStatus::Known) => {}
            Ok(BlockStatus::Invalid(reason)) => {
                warn!(peer = %peer, number = relay.number(), reason = %reason, "Invalid block from peer");
            }
            Err(e) => warn!(peer = %peer, number = relay.number(), error = %e, "Block import failed"),
        }
    }

    async fn on_transaction(&self, peer: PeerId, tx: Transaction) {
        let hash = tx.hash;
        match accept_transaction(&self.chain, &self.event_tx, tx.clone()) {
            Ok(true) => {
                debug!(peer = %peer, hash = %hash, "Accepted gossiped transaction");
                if let Err(e) = self.network.broadcast_transaction(&tx).await {
                    debug!(error = %e, "Transaction relay failed");
                }
            }
            Ok(false) => {}
            Err(e) => debug!(peer = %peer, hash = %hash, error = %e, "Rejected gossiped transaction"),
        }
    }

    async fn on_sync_request(&self, peer: PeerId, from: u64, to: u64) {
        if from > to {
            debug!(peer = %peer, from, to, "Ignoring empty sync range");
            return;
        }
        let blocks = match load_block_range(self.chain.state().as_ref(), from, to, MAX_BLOCKS_PER_MESSAGE) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to load sync range");
                return;
            }
        };
        debug!(peer = %peer, from, to, blocks = blocks.len(), "Answering sync request");
        if let Err(e) = self.network.send_sync_response(peer, blocks, Vec::new()).await {
            debug!(peer = %peer, error = %e, "Sync response not sent");
        }
    }

    async fn on_sync_response(&self, peer: PeerId, mut blocks: Vec<Block>) {
        if blocks.is_empty() {
            debug!(peer = %peer, "Peer had no blocks to send");
            return;
        }
        blocks.sort_by_key(|b| b.number());
        let received = blocks.len();

        let _finalize = self.finalize_lock.lock().await;
        let mut imported = 0;
        for block in blocks {
            let number = block.number();
            match self.chain.import_block(block, ImportSource::Sync) {
                Ok(BlockStatus::Imported { count }) => imported += count,
                Ok(BlockStatus::Known | BlockStatus::Orphan { .. }) => {}
                Ok(BlockStatus::Invalid(reason)) => {
                    warn!(peer = %peer, number, reason = %reason, "Invalid block in sync response");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, number, error = %e, "Sync import failed");
                    break;
                }
            }
        }
        info!(peer = %peer, received, imported, height = self.chain.height(), "Applied sync response");

        // A full response means the peer may have more
        if received == MAX_BLOCKS_PER_MESSAGE && imported > 0 {
            let head = self.chain.height();
            self.request_range(peer, head + 1, head + MAX_BLOCKS_PER_MESSAGE as u64).await;
        }
    }

    async fn request_range(&self, peer: PeerId, from: u64, to: u64) {
        let to = to.min(from + MAX_BLOCKS_PER_MESSAGE as u64 - 1);
        debug!(peer = %peer, from, to, "Requesting missing blocks");
        if let Err(e) = self.network.request_sync(peer, from, to).await {
            debug!(peer = %peer, error = %e, "Sync request not sent");
        }
    }
}

/// Node result type
pub type NodeResult<T> = Result<T, NodeError>;

/// Node errors
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Mempool error: {0}")]
    Mempool(#[from] MempoolError),

    #[error("Key error: {0}")]
    Key(#[from] SignatureError),

    #[error("Gas price {price} below network price {min}")]
    GasPriceTooLow { price: u64, min: u64 },
}
