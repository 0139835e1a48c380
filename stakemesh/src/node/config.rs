//! Node Configuration
//!
//! Configuration options for a StakeMesh node: listeners and bootstrap
//! peers, the node identity, consensus and producer parameters, the mempool
//! and the genesis allocation.

use super::mempool::MempoolConfig;
use crate::consensus::ConsensusConfig;
use crate::p2p::{default_capabilities, NetworkConfig, TransportKind};
use crate::types::{Address, Amount, Transaction};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DeserializeFromStr, DisplayFromStr, SerializeDisplay};
use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Signer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Config file name inside the data directory
pub const CONFIG_FILE: &str = "config.json";

/// Seed of the well-known devnet validator key
pub const DEVNET_SEED: [u8; 32] = [0x5e; 32];

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Shared test network
    #[default]
    Testnet,
    /// Local development
    Devnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Testnet => write!(f, "testnet"),
            Network::Devnet => write!(f, "devnet"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" | "local" => Ok(Network::Devnet),
            _ => Err(format!("Unknown network: {}", s)),
        }
    }
}

/// A peer dialed at startup, written as `[transport://]host:port`
///
/// The transport defaults to `stream`.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct BootstrapPeer {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

impl fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)
    }
}

impl FromStr for BootstrapPeer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme.parse()?, rest),
            None => (TransportKind::Stream, s),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {s}"))?;
        if host.is_empty() {
            return Err(format!("missing host in {s}"));
        }
        let port = port.parse().map_err(|_| format!("invalid port in {s}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
            transport,
        })
    }
}

/// Block producer parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Interval between production cycles (ms)
    pub block_time_ms: u64,
    /// Pause after a failed cycle (ms)
    pub retry_backoff_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 5_000,
            retry_backoff_ms: 5_000,
        }
    }
}

/// A validator registered at genesis
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    #[serde_as(as = "DisplayFromStr")]
    pub stake: Amount,
}

/// Genesis block and initial state
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Genesis timestamp (Unix ms); must match across the network
    pub timestamp: u64,
    /// Initial difficulty
    pub difficulty: u64,
    /// Network gas price
    pub gas_price: u64,
    /// Validators registered before the first epoch
    pub validators: Vec<GenesisValidator>,
    /// Funded accounts
    #[serde_as(as = "BTreeMap<_, DisplayFromStr>")]
    pub balances: BTreeMap<Address, Amount>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp: 0,
            difficulty: crate::consensus::INITIAL_DIFFICULTY,
            gas_price: 1,
            validators: Vec::new(),
            balances: BTreeMap::new(),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network type (testnet, devnet)
    pub network: Network,

    /// Data directory
    pub data_dir: PathBuf,

    /// Listen host for both transports
    pub listen_host: String,

    /// Newline-delimited JSON port
    pub stream_port: u16,

    /// Length-prefixed frame port
    pub framed_port: u16,

    /// Maximum peer connections
    pub max_peers: usize,

    /// Peers dialed at startup
    pub bootstrap_peers: Vec<BootstrapPeer>,

    /// Gossip topics advertised to peers
    pub capabilities: Vec<String>,

    /// Sign outgoing network messages
    pub sign_messages: bool,

    /// Node key seed (hex encoded, 32 bytes); random when absent
    pub identity_seed: Option<String>,

    /// Validator this node produces for; the node key's address when absent
    pub validator: Option<Address>,

    /// Produce for whichever validator owns the slot, key or not
    pub produce_for_any: bool,

    /// Consensus parameters
    pub consensus: ConsensusConfig,

    /// Block producer parameters
    pub producer: ProducerConfig,

    /// Mempool parameters
    pub mempool: MempoolConfig,

    /// Genesis allocation
    pub genesis: GenesisConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            data_dir: default_data_dir(),
            listen_host: "0.0.0.0".into(),
            stream_port: 7400,
            framed_port: 7401,
            max_peers: 50,
            bootstrap_peers: Vec::new(),
            capabilities: default_capabilities(),
            sign_messages: true,
            identity_seed: None,
            validator: None,
            produce_for_any: false,
            consensus: ConsensusConfig::default(),
            producer: ProducerConfig::default(),
            mempool: MempoolConfig::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create testnet configuration
    pub fn testnet(data_dir: PathBuf) -> Self {
        Self {
            network: Network::Testnet,
            data_dir,
            ..Default::default()
        }
    }

    /// Create devnet configuration for local testing
    ///
    /// The node runs the well-known devnet key as the single genesis
    /// validator, which also holds the funded devnet balance.
    pub fn devnet(data_dir: PathBuf) -> Self {
        let keypair = Ed25519Keypair::from_seed(&DEVNET_SEED);
        let address = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);

        let consensus = ConsensusConfig {
            epoch_length: 8,
            target_block_time_ms: 2_000,
            ..ConsensusConfig::default()
        };
        let genesis = GenesisConfig {
            validators: vec![GenesisValidator {
                address,
                stake: 10 * consensus.min_stake,
            }],
            balances: BTreeMap::from([(address, 1_000_000_000)]),
            ..GenesisConfig::default()
        };

        Self {
            network: Network::Devnet,
            data_dir,
            listen_host: "127.0.0.1".into(),
            max_peers: 10,
            identity_seed: Some(hex::encode(DEVNET_SEED)),
            validator: Some(address),
            consensus,
            producer: ProducerConfig {
                block_time_ms: 2_000,
                ..ProducerConfig::default()
            },
            mempool: MempoolConfig {
                max_size: 1_000,
                ..MempoolConfig::default()
            },
            genesis,
            ..Default::default()
        }
    }

    /// Preset for `network`
    pub fn preset(network: Network, data_dir: PathBuf) -> Self {
        match network {
            Network::Testnet => Self::testnet(data_dir),
            Network::Devnet => Self::devnet(data_dir),
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: NodeConfig = if path.extension().map_or(false, |e| e == "json") {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            return Err(ConfigError::Parse("Only JSON config files are supported".into()));
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Path of the config file for `data_dir`
    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .map_err(|e| ConfigError::Io(format!("Failed to create data dir: {}", e)))?;
        }

        if self.max_peers < 1 {
            return Err(ConfigError::Invalid("Max peers must be at least 1".into()));
        }

        if self.stream_port != 0 && self.stream_port == self.framed_port {
            return Err(ConfigError::Invalid("Stream and framed ports must differ".into()));
        }

        if let Some(ref seed) = self.identity_seed {
            if hex::decode(seed).is_err() || seed.len() != 64 {
                return Err(ConfigError::Invalid(
                    "Invalid identity seed format (expected 32 bytes hex)".into(),
                ));
            }
        }

        let consensus = &self.consensus;
        if consensus.epoch_length == 0 {
            return Err(ConfigError::Invalid("Epoch length must be at least 1".into()));
        }
        if consensus.max_validators == 0 {
            return Err(ConfigError::Invalid("Max validators must be at least 1".into()));
        }
        if consensus.proposer_timeout_ms == 0 {
            return Err(ConfigError::Invalid("Proposer timeout must be positive".into()));
        }
        if consensus.block_gas_limit < Transaction::TRANSFER_GAS {
            return Err(ConfigError::Invalid(format!(
                "Block gas limit must be at least {}",
                Transaction::TRANSFER_GAS
            )));
        }

        if self.producer.block_time_ms == 0 {
            return Err(ConfigError::Invalid("Block time must be positive".into()));
        }

        if self.mempool.max_size == 0 || self.mempool.max_per_sender == 0 {
            return Err(ConfigError::Invalid("Mempool limits must be positive".into()));
        }

        let mut seen = HashSet::new();
        for validator in &self.genesis.validators {
            if !seen.insert(validator.address) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate genesis validator {}",
                    validator.address
                )));
            }
            if validator.stake < consensus.min_stake {
                return Err(ConfigError::Invalid(format!(
                    "Genesis validator {} stake {} below minimum {}",
                    validator.address, validator.stake, consensus.min_stake
                )));
            }
        }

        Ok(())
    }

    /// Get P2P configuration
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.listen_host.clone(),
            stream_port: self.stream_port,
            framed_port: self.framed_port,
            max_peers: self.max_peers,
            capabilities: self.capabilities.clone(),
            sign_messages: self.sign_messages,
            ..NetworkConfig::default()
        }
    }

    /// Check if this node is bound to a validator
    pub fn is_validator(&self) -> bool {
        self.validator.is_some()
    }

    /// Validator the block producer serves, given the node key's address
    ///
    /// `None` only when `produce_for_any` is set.
    pub fn producer_validator(&self, node_address: Address) -> Option<Address> {
        match self.validator {
            Some(validator) => Some(validator),
            None if self.produce_for_any => None,
            None => Some(node_address),
        }
    }

    /// Decoded identity seed
    pub fn identity_seed_bytes(&self) -> Option<[u8; 32]> {
        self.identity_seed.as_ref().and_then(|s| {
            let bytes = hex::decode(s).ok()?;
            bytes.try_into().ok()
        })
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("stakemesh"))
        .unwrap_or_else(|| PathBuf::from(".stakemesh"))
}
