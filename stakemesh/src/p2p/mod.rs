//! P2P Gossip Network for StakeMesh
//!
//! Two TCP listeners (newline-delimited JSON and length-prefixed frames)
//! feed one event loop that owns the peer table. Callers talk to the loop
//! through a cloneable [`NetworkHandle`] and receive [`NetworkEvent`]s on an
//! mpsc channel.
//!
//! ## Modules
//! - `message` - Wire envelope and typed payloads
//! - `peer` - Peer identity and connection state
//! - `transport` - Per-connection reader and writer tasks
//! - `network` - Listener setup, event loop and handle

pub mod message;
pub mod network;
pub mod peer;
pub mod transport;

use crate::types::{Block, Transaction};
use std::net::SocketAddr;
use std::time::Duration;

// Re-exports
pub use message::{
    Heartbeat, MessageKind, NetworkMessage, PeerAddress, PeerDiscovery, SyncRequest, SyncResponse,
    MAX_BLOCKS_PER_MESSAGE, MAX_MESSAGE_SIZE,
};
pub use network::{NetworkHandle, NetworkIdentity, PeerNetwork, StartedNetwork};
pub use peer::{ConnectionDirection, PeerId, PeerInfo, PeerState, TransportKind};

/// Gossip topic for blocks
pub const CAPABILITY_BLOCK: &str = "block";

/// Gossip topic for transactions
pub const CAPABILITY_TRANSACTION: &str = "transaction";

/// Peer answers sync requests
pub const CAPABILITY_SYNC: &str = "sync";

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Listen host for both transports
    pub host: String,
    /// Newline-delimited JSON port (0 picks a free port)
    pub stream_port: u16,
    /// Length-prefixed frame port (0 picks a free port)
    pub framed_port: u16,
    /// Maximum connected peers, pending dials included
    pub max_peers: usize,
    /// Topics advertised in `peer_discovery`
    pub capabilities: Vec<String>,
    /// Sign outgoing envelopes with the node key
    pub sign_messages: bool,
    /// Dial timeout covering resolution and TCP connect
    pub connect_timeout: Duration,
    /// Messages older or newer than this are dropped
    pub message_staleness: Duration,
    /// Peers silent for longer are disconnected
    pub idle_timeout: Duration,
    /// Ping interval
    pub heartbeat_interval: Duration,
    /// Idle sweep interval
    pub housekeeping_interval: Duration,
    /// Per-connection outbound queue
    pub peer_buffer: usize,
    /// Capacity of the event channel
    pub event_buffer: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            stream_port: 7400,
            framed_port: 7401,
            max_peers: 50,
            capabilities: default_capabilities(),
            sign_messages: true,
            connect_timeout: Duration::from_secs(5),
            message_staleness: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            housekeeping_interval: Duration::from_secs(60),
            peer_buffer: 128,
            event_buffer: 1024,
        }
    }
}

impl NetworkConfig {
    /// Loopback listeners on ephemeral ports
    pub fn local() -> Self {
        Self {
            host: "127.0.0.1".into(),
            stream_port: 0,
            framed_port: 0,
            ..Default::default()
        }
    }
}

/// All gossip topics
pub fn default_capabilities() -> Vec<String> {
    vec![
        CAPABILITY_BLOCK.into(),
        CAPABILITY_TRANSACTION.into(),
        CAPABILITY_SYNC.into(),
    ]
}

/// Events delivered by the network loop
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Connection established in either direction
    PeerConnected {
        peer: PeerId,
        addr: SocketAddr,
        transport: TransportKind,
        direction: ConnectionDirection,
    },
    /// Connection closed and discarded
    PeerDisconnected { peer: PeerId, reason: String },
    /// Remote node announced itself
    PeerDiscovered {
        peer: PeerId,
        node_id: String,
        capabilities: Vec<String>,
        known_peers: Vec<PeerAddress>,
    },
    /// Block gossip
    BlockReceived { peer: PeerId, block: Box<Block> },
    /// Transaction gossip
    TransactionReceived {
        peer: PeerId,
        transaction: Box<Transaction>,
    },
    /// Peer asked for blocks `from..=to`
    SyncRequested { peer: PeerId, from: u64, to: u64 },
    /// Peer answered a sync request
    SyncResponse {
        peer: PeerId,
        blocks: Vec<Block>,
        transactions: Vec<Transaction>,
    },
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to bind {transport} listener on {addr}: {source}")]
    Bind {
        transport: TransportKind,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network is shut down")]
    Shutdown,

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Peer {0} outbound queue is full")]
    PeerBusy(PeerId),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.message_staleness, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.housekeeping_interval, Duration::from_secs(60));
        assert_eq!(config.capabilities.len(), 3);
    }

    #[test]
    fn test_local_config() {
        let config = NetworkConfig::local();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.stream_port, 0);
        assert_eq!(config.framed_port, 0);
    }
}
