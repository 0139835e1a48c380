//! Epoch Reward Distribution
//!
//! The fixed epoch reward is split across the active set in proportion to
//! stake. Each share is rounded down; the undistributed remainder is
//! reported but never paid, so the rewards of an epoch never exceed the
//! configured amount.

use super::Validator;
use crate::types::{Address, Amount};
use std::collections::BTreeMap;

/// Rewards paid at the start of an epoch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewardDistribution {
    /// Epoch the rewards were paid for
    pub epoch: u64,
    /// Configured reward
    pub block_reward: Amount,
    /// Sum of all paid rewards
    pub total_distributed: Amount,
    /// Remainder lost to rounding
    pub remainder: Amount,
    /// Reward per validator
    pub rewards: BTreeMap<Address, Amount>,
}

/// Split `block_reward` across `validators` by stake share
pub fn distribute_rewards(epoch: u64, block_reward: Amount, validators: &[Validator]) -> RewardDistribution {
    let total_stake = validators
        .iter()
        .fold(0 as Amount, |acc, v| acc.saturating_add(v.stake));

    let mut distribution = RewardDistribution {
        epoch,
        block_reward,
        ..Default::default()
    };

    if total_stake == 0 {
        distribution.remainder = block_reward;
        return distribution;
    }

    for validator in validators {
        let reward = stake_share(block_reward, validator.stake, total_stake)
            .min(block_reward - distribution.total_distributed);
        if reward == 0 {
            continue;
        }
        distribution.total_distributed += reward;
        distribution.rewards.insert(validator.address, reward);
    }

    distribution.remainder = block_reward - distribution.total_distributed;
    distribution
}

/// `floor(reward × stake / total)` for `stake <= total`
///
/// Exact whenever `reward × stake` fits in a `u128`, which holds for any
/// supply below 2^64. Past that the reward is split into whole multiples of
/// `total` and a remainder; the whole part times `stake` never exceeds
/// `reward`, and the remainder term is rounded down further when it would
/// overflow. The result never exceeds the exact share.
fn stake_share(reward: Amount, stake: Amount, total: Amount) -> Amount {
    if total == 0 || stake == 0 {
        return 0;
    }
    if let Some(product) = reward.checked_mul(stake) {
        return product / total;
    }

    let whole = (reward / total) * stake;
    let rest = reward % total;
    let part = match rest.checked_mul(stake) {
        Some(product) => product / total,
        None => rest / total.div_ceil(stake),
    };
    whole.saturating_add(part)
}
