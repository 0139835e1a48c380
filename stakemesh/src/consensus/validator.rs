//! Validator Registry
//!
//! Handles validator registration, stake updates, uptime tracking and the
//! per-epoch ranking. Validators are never removed, only deactivated.

use crate::types::{Address, Amount};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::collections::BTreeMap;

/// Reputation assigned at registration
pub const INITIAL_REPUTATION: u8 = 50;

/// Upper bound for reputation and uptime
pub const MAX_SCORE: u8 = 100;

/// Uptime gained per produced block
pub const UPTIME_INCREMENT: u8 = 1;

/// Uptime lost per decay pass while stale
pub const UPTIME_DECREMENT: u8 = 5;

/// Uptime below which a validator is deactivated
pub const DEACTIVATION_THRESHOLD: u8 = 50;

/// A registered validator
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Validator address
    pub address: Address,
    /// Bonded stake
    #[serde_as(as = "DisplayFromStr")]
    pub stake: Amount,
    /// Reputation score (0..=100)
    pub reputation: u8,
    /// Member of the current epoch's active set
    pub active: bool,
    /// Number of the last block this validator produced
    pub last_block_produced: u64,
    /// Uptime score (0..=100)
    pub uptime: u8,
}

impl Validator {
    fn new(address: Address, stake: Amount) -> Self {
        Self {
            address,
            stake,
            reputation: INITIAL_REPUTATION,
            active: false,
            last_block_produced: 0,
            uptime: 0,
        }
    }

    /// Selection weight: `stake × reputation`
    pub fn weight(&self) -> Amount {
        self.stake.saturating_mul(Amount::from(self.reputation))
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Validator already registered: {0}")]
    AlreadyExists(Address),
    #[error("Validator not found: {0}")]
    NotFound(Address),
    #[error("Validator {0} is below the minimum stake")]
    BelowMinimumStake(Address),
}

/// All known validators, keyed by address
#[derive(Debug, Clone)]
pub struct ValidatorRegistry {
    validators: BTreeMap<Address, Validator>,
    min_stake: Amount,
}

impl ValidatorRegistry {
    /// Create an empty registry
    pub fn new(min_stake: Amount) -> Self {
        Self {
            validators: BTreeMap::new(),
            min_stake,
        }
    }

    /// Minimum stake enforced for activity
    pub fn min_stake(&self) -> Amount {
        self.min_stake
    }

    /// Register a new, inactive validator
    pub fn register(&mut self, address: Address, stake: Amount) -> Result<(), RegistryError> {
        if self.validators.contains_key(&address) {
            return Err(RegistryError::AlreadyExists(address));
        }
        self.validators.insert(address, Validator::new(address, stake));
        Ok(())
    }

    /// Set a validator's stake; dropping below the minimum deactivates it
    pub fn update_stake(&mut self, address: &Address, stake: Amount) -> Result<(), RegistryError> {
        let validator = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::NotFound(*address))?;

        validator.stake = stake;
        if stake < self.min_stake {
            validator.active = false;
        }
        Ok(())
    }

    /// Add to a validator's stake
    pub fn add_stake(&mut self, address: &Address, amount: Amount) -> Result<(), RegistryError> {
        let current = self
            .validators
            .get(address)
            .ok_or(RegistryError::NotFound(*address))?
            .stake;
        self.update_stake(address, current.saturating_add(amount))
    }

    /// Record that a validator produced block `number`
    pub fn record_block(&mut self, address: &Address, number: u64) -> Result<(), RegistryError> {
        let validator = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::NotFound(*address))?;

        validator.last_block_produced = number;
        validator.uptime = validator.uptime.saturating_add(UPTIME_INCREMENT).min(MAX_SCORE);
        Ok(())
    }

    /// Decay uptime of active validators that have not produced a block
    /// for more than `stale_after` blocks.
    ///
    /// Returns the validators that fell below the threshold and were
    /// deactivated during this pass.
    pub fn decay_inactive(&mut self, now: u64, stale_after: u64) -> Vec<Address> {
        let mut deactivated = Vec::new();

        for validator in self.validators.values_mut().filter(|v| v.active) {
            if now.saturating_sub(validator.last_block_produced) <= stale_after {
                continue;
            }
            validator.uptime = validator.uptime.saturating_sub(UPTIME_DECREMENT);
            if validator.uptime < DEACTIVATION_THRESHOLD {
                validator.active = false;
                deactivated.push(validator.address);
            }
        }

        deactivated
    }

    /// Rank eligible validators for a new epoch
    ///
    /// Filters by `min_stake`, sorts by `stake × reputation` descending with
    /// address ascending as the tie-break, and keeps the top `max_validators`.
    pub fn select_epoch_validators(&self, max_validators: usize, min_stake: Amount) -> Vec<Validator> {
        let mut eligible: Vec<&Validator> = self
            .validators
            .values()
            .filter(|v| v.stake >= min_stake)
            .collect();

        eligible.sort_by(|a, b| {
            b.weight()
                .cmp(&a.weight())
                .then_with(|| a.address.cmp(&b.address))
        });

        eligible
            .into_iter()
            .take(max_validators)
            .cloned()
            .collect()
    }

    /// Mark a validator active or inactive
    ///
    /// Activation is refused for validators below the minimum stake.
    pub fn set_active(&mut self, address: &Address, active: bool) -> Result<(), RegistryError> {
        let min_stake = self.min_stake;
        let validator = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::NotFound(*address))?;

        if active && validator.stake < min_stake {
            return Err(RegistryError::BelowMinimumStake(*address));
        }
        validator.active = active;
        Ok(())
    }

    /// Activate a validator for an epoch starting after block `at_block`
    ///
    /// A validator coming back from inactivity gets its production marker
    /// moved to `at_block`, so staleness is counted from activation.
    pub fn activate(&mut self, address: &Address, at_block: u64) -> Result<(), RegistryError> {
        let min_stake = self.min_stake;
        let validator = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::NotFound(*address))?;

        if validator.stake < min_stake {
            return Err(RegistryError::BelowMinimumStake(*address));
        }
        if !validator.active {
            validator.last_block_produced = validator.last_block_produced.max(at_block);
            validator.active = true;
        }
        Ok(())
    }

    /// Set reputation, clamped to 0..=100
    pub fn set_reputation(&mut self, address: &Address, reputation: u8) -> Result<(), RegistryError> {
        let validator = self
            .validators
            .get_mut(address)
            .ok_or(RegistryError::NotFound(*address))?;
        validator.reputation = reputation.min(MAX_SCORE);
        Ok(())
    }

    /// Get validator by address
    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.validators.get(address)
    }

    /// Check registration
    pub fn contains(&self, address: &Address) -> bool {
        self.validators.contains_key(address)
    }

    /// Iterator over all validators in address order
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    /// Number of registered validators
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    #[test]
    fn test_register_defaults() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();

        let v = registry.get(&addr(1)).unwrap();
        assert_eq!(v.reputation, INITIAL_REPUTATION);
        assert_eq!(v.uptime, 0);
        assert!(!v.active);
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();
        assert_eq!(
            registry.register(addr(1), 2000),
            Err(RegistryError::AlreadyExists(addr(1)))
        );
        // Original entry untouched
        assert_eq!(registry.get(&addr(1)).unwrap().stake, 1000);
    }

    #[test]
    fn test_update_stake_below_minimum_deactivates() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();
        registry.set_active(&addr(1), true).unwrap();

        registry.update_stake(&addr(1), 99).unwrap();
        assert!(!registry.get(&addr(1)).unwrap().active);

        assert_eq!(
            registry.update_stake(&addr(2), 500),
            Err(RegistryError::NotFound(addr(2)))
        );
    }

    #[test]
    fn test_activation_guard() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 50).unwrap();
        assert_eq!(
            registry.set_active(&addr(1), true),
            Err(RegistryError::BelowMinimumStake(addr(1)))
        );
    }

    #[test]
    fn test_activate_resets_staleness_marker() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();
        registry.register(addr(2), 10).unwrap();

        registry.activate(&addr(1), 400).unwrap();
        let v = registry.get(&addr(1)).unwrap();
        assert!(v.active);
        assert_eq!(v.last_block_produced, 400);

        // Already active: marker untouched
        registry.record_block(&addr(1), 410).unwrap();
        registry.activate(&addr(1), 500).unwrap();
        assert_eq!(registry.get(&addr(1)).unwrap().last_block_produced, 410);

        assert_eq!(
            registry.activate(&addr(2), 400),
            Err(RegistryError::BelowMinimumStake(addr(2)))
        );
    }

    #[test]
    fn test_uptime_capped() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();
        for n in 1..=150 {
            registry.record_block(&addr(1), n).unwrap();
        }
        let v = registry.get(&addr(1)).unwrap();
        assert_eq!(v.uptime, MAX_SCORE);
        assert_eq!(v.last_block_produced, 150);
    }

    #[test]
    fn test_decay_deactivates_below_threshold() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();
        registry.set_active(&addr(1), true).unwrap();
        // uptime 52
        for n in 1..=52 {
            registry.record_block(&addr(1), n).unwrap();
        }

        // Not stale yet
        assert!(registry.decay_inactive(100, 100).is_empty());
        assert_eq!(registry.get(&addr(1)).unwrap().uptime, 52);

        // Stale: 52 -> 47, below threshold
        let deactivated = registry.decay_inactive(200, 100);
        assert_eq!(deactivated, vec![addr(1)]);
        let v = registry.get(&addr(1)).unwrap();
        assert_eq!(v.uptime, 47);
        assert!(!v.active);
        // Stake is never slashed
        assert_eq!(v.stake, 1000);
    }

    #[test]
    fn test_decay_saturates_at_zero() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();
        registry.set_active(&addr(1), true).unwrap();
        registry.decay_inactive(1_000, 10);
        assert_eq!(registry.get(&addr(1)).unwrap().uptime, 0);
    }

    #[test]
    fn test_selection_ranking() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(1), 1000).unwrap();
        registry.register(addr(2), 2000).unwrap();
        registry.register(addr(3), 1500).unwrap();
        registry.register(addr(4), 50).unwrap();

        let selected = registry.select_epoch_validators(10, 100);
        let order: Vec<Address> = selected.iter().map(|v| v.address).collect();
        assert_eq!(order, vec![addr(2), addr(3), addr(1)]);

        let top_two = registry.select_epoch_validators(2, 100);
        assert_eq!(top_two.len(), 2);
    }

    #[test]
    fn test_selection_reputation_weighting_and_ties() {
        let mut registry = ValidatorRegistry::new(100);
        registry.register(addr(5), 1000).unwrap();
        registry.register(addr(3), 1000).unwrap();
        registry.register(addr(9), 600).unwrap();
        registry.set_reputation(&addr(9), 100).unwrap();

        let order: Vec<Address> = registry
            .select_epoch_validators(10, 100)
            .iter()
            .map(|v| v.address)
            .collect();
        // 600*100 beats 1000*50; equal weights break by address
        assert_eq!(order, vec![addr(9), addr(3), addr(5)]);
    }
}
