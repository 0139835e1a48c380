//! Epoch tracking
//!
//! An epoch owns the active validator subset chosen when it started. The
//! engine moves through `Idle -> EpochStarted -> RewardsDistributed` while
//! rotating, and returns to `Idle` once the next block is finalized.

use super::reward::RewardDistribution;
use crate::types::{Address, Amount};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

/// Phase of the epoch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochPhase {
    /// Producing blocks within an epoch
    Idle,
    /// Active set selected, rewards pending
    EpochStarted,
    /// Rewards paid for the new epoch
    RewardsDistributed,
}

/// The current epoch
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// Epoch number (0 before the first rotation)
    pub number: u64,
    /// First block number produced in this epoch
    pub start_block: u64,
    /// Active validators in ranking order
    pub validators: Vec<Address>,
    /// Total stake of the active set at selection time
    #[serde_as(as = "DisplayFromStr")]
    pub total_stake: Amount,
    /// Total `stake × reputation` of the active set at selection time
    #[serde_as(as = "DisplayFromStr")]
    pub total_weight: Amount,
}

impl Epoch {
    /// The empty pre-genesis epoch
    pub fn empty() -> Self {
        Self {
            number: 0,
            start_block: 0,
            validators: Vec::new(),
            total_stake: 0,
            total_weight: 0,
        }
    }

    /// Check membership in the active set
    pub fn contains(&self, address: &Address) -> bool {
        self.validators.contains(address)
    }

    /// Drop a validator from the active set
    pub fn remove(&mut self, address: &Address) -> bool {
        let before = self.validators.len();
        self.validators.retain(|a| a != address);
        before != self.validators.len()
    }
}

/// Result of an epoch rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochSummary {
    /// New epoch number
    pub epoch: u64,
    /// Selected active set
    pub validators: Vec<Address>,
    /// Rewards paid at rotation
    pub distribution: RewardDistribution,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut epoch = Epoch::empty();
        epoch.validators = vec![Address::new([1; 20]), Address::new([2; 20])];

        assert!(epoch.contains(&Address::new([1; 20])));
        assert!(epoch.remove(&Address::new([1; 20])));
        assert!(!epoch.remove(&Address::new([1; 20])));
        assert_eq!(epoch.validators, vec![Address::new([2; 20])]);
    }
}
