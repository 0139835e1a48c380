//! Proof-of-Stake Consensus Engine
//!
//! Validators are ranked by stake weighted with reputation. Each epoch
//! selects an active set, pays the epoch reward by stake share, and then
//! hands out block-proposal slots by a weighted draw seeded from the head.
//!
//! ## Modules
//! - `validator` - Validator registry and epoch selection
//! - `epoch` - Epoch phase tracking
//! - `reward` - Epoch reward distribution
//! - `difficulty` - Rolling-window difficulty adjustment
//! - `engine` - Block proposal, validation and proposer selection

pub mod difficulty;
pub mod engine;
pub mod epoch;
pub mod reward;
pub mod validator;

pub use difficulty::{calculate_difficulty, DifficultyTracker, INITIAL_DIFFICULTY, MIN_DIFFICULTY};
pub use engine::{ConsensusEngine, ConsensusState};
pub use epoch::{Epoch, EpochPhase, EpochSummary};
pub use reward::{distribute_rewards, RewardDistribution};
pub use validator::{RegistryError, Validator, ValidatorRegistry};

use crate::types::{Address, Amount, TransactionError, TxHash};
use serde::{Deserialize, Serialize};

/// Consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Minimum stake to be selected into an epoch
    pub min_stake: Amount,
    /// Maximum validators per epoch
    pub max_validators: usize,
    /// Reward split across the active set at each epoch start
    pub block_reward: Amount,
    /// Epoch length in blocks
    pub epoch_length: u64,
    /// Gas limit for every proposed block
    pub block_gas_limit: u64,
    /// Target block interval used for difficulty adjustment (ms)
    pub target_block_time_ms: u64,
    /// Blocks without production before a validator's uptime decays
    pub stale_after_blocks: u64,
    /// Maximum allowed distance between a block timestamp and local time (ms)
    pub max_clock_drift_ms: u64,
    /// Time after the parent block before a slot is redrawn (ms)
    pub proposer_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_stake: 1_000,
            max_validators: 100,
            block_reward: 100,
            epoch_length: 100,
            block_gas_limit: 10_000_000,
            target_block_time_ms: 5_000,
            stale_after_blocks: 100,
            max_clock_drift_ms: 30_000,
            proposer_timeout_ms: 30_000,
        }
    }
}

/// Block and transaction validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Block timestamp is {drift_ms}ms away from local time")]
    StaleTimestamp { drift_ms: u64 },
    #[error("Invalid transaction {hash}: {reason}")]
    InvalidTransaction { hash: TxHash, reason: TransactionError },
    #[error("Gas limit exceeded: used {used}, limit {limit}")]
    GasLimitExceeded { used: u64, limit: u64 },
    #[error("Invalid transaction root")]
    InvalidTxRoot,
    #[error("Block hash does not match contents")]
    HashMismatch,
}

/// Consensus-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("{0} is not an active validator of the current epoch")]
    UnauthorizedProposer(Address),
    #[error("{proposer} does not own this slot; it belongs to {owner}")]
    NotSlotOwner { proposer: Address, owner: Address },
    #[error("Insufficient stake: have {have}, need {need}")]
    InsufficientStake { have: Amount, need: Amount },
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;
