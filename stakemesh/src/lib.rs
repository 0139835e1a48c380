//! StakeMesh: Proof-of-Stake Chain Node
//!
//! StakeMesh is a small proof-of-stake chain. Validators are chosen by
//! stake weighted with reputation, blocks are proposed by weighted random
//! draw and propagated over a dual-transport TCP gossip network.
//!
//! ## Core Features
//! - Epoch-based validator selection with stake-share rewards
//! - Rolling-window difficulty adjustment
//! - P2P gossip over newline-delimited JSON and length-prefixed frames
//! - Timed block production with mempool admission control
//!
//! ## Modules
//! - `types` - Core data structures (blocks, transactions, addresses)
//! - `consensus` - Validator registry, epochs, rewards and the engine
//! - `storage` - Account state and finalized chain storage
//! - `p2p` - Peer-to-peer networking
//! - `node` - Mempool, chain import, block producer and the full node

pub mod consensus;
pub mod node;
pub mod p2p;
pub mod storage;
pub mod types;

pub use types::*;

pub use consensus::{ConsensusConfig, ConsensusEngine, ConsensusError, ValidationError};
pub use node::{Node, NodeConfig, NodeError, NodeEvent, NodeResult};
pub use p2p::{NetworkConfig, NetworkError, NetworkEvent, NetworkHandle, PeerNetwork};
pub use storage::{MemoryStateStore, StateError, StateStore};
