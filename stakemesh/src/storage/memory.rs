//! In-memory state store

use super::{StateError, StateResult, StateStore};
use crate::types::{Address, Amount, Block, Transaction, TxHash};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct MemoryState {
    balances: HashMap<Address, Amount>,
    nonces: HashMap<Address, u64>,
    blocks: BTreeMap<u64, Block>,
    /// Transaction hash -> (block number, index in block)
    tx_index: HashMap<TxHash, (u64, usize)>,
}

/// Process-local [`StateStore`]
pub struct MemoryStateStore {
    state: RwLock<MemoryState>,
    gas_price: RwLock<u64>,
}

impl MemoryStateStore {
    /// Create an empty store with a fixed gas price
    pub fn new(gas_price: u64) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            gas_price: RwLock::new(gas_price),
        }
    }

    /// Mint `amount` into `address` (genesis funding)
    pub fn credit(&self, address: &Address, amount: Amount) -> StateResult<Amount> {
        let mut state = self.state.write();
        let balance = state.balances.entry(*address).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow(*address))?;
        Ok(*balance)
    }

    /// Change the gas price
    pub fn set_gas_price(&self, gas_price: u64) {
        *self.gas_price.write() = gas_price;
    }

    /// Number of persisted blocks
    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl StateStore for MemoryStateStore {
    fn get_balance(&self, address: &Address) -> StateResult<Amount> {
        Ok(self.state.read().balances.get(address).copied().unwrap_or(0))
    }

    fn get_nonce(&self, address: &Address) -> StateResult<u64> {
        Ok(self.state.read().nonces.get(address).copied().unwrap_or(0))
    }

    fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> StateResult<()> {
        let mut state = self.state.write();

        let have = state.balances.get(from).copied().unwrap_or(0);
        if have < amount {
            return Err(StateError::InsufficientBalance {
                address: *from,
                have,
                need: amount,
            });
        }
        if from == to || amount == 0 {
            return Ok(());
        }

        let receiver = state.balances.get(to).copied().unwrap_or(0);
        let credited = receiver
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow(*to))?;

        state.balances.insert(*from, have - amount);
        state.balances.insert(*to, credited);
        Ok(())
    }

    fn transfer_all(&self, from: &Address, payments: &[(Address, Amount)]) -> StateResult<()> {
        let mut state = self.state.write();
        let mut staged: HashMap<Address, Amount> = HashMap::new();
        let balance = |staged: &HashMap<Address, Amount>, address: &Address| {
            staged
                .get(address)
                .or_else(|| state.balances.get(address))
                .copied()
                .unwrap_or(0)
        };

        for (to, amount) in payments {
            let have = balance(&staged, from);
            if have < *amount {
                return Err(StateError::InsufficientBalance {
                    address: *from,
                    have,
                    need: *amount,
                });
            }
            if from == to || *amount == 0 {
                continue;
            }
            let credited = balance(&staged, to)
                .checked_add(*amount)
                .ok_or(StateError::BalanceOverflow(*to))?;
            staged.insert(*from, have - amount);
            staged.insert(*to, credited);
        }

        state.balances.extend(staged);
        Ok(())
    }

    fn increment_nonce(&self, address: &Address) -> StateResult<u64> {
        let mut state = self.state.write();
        let nonce = state.nonces.entry(*address).or_insert(0);
        *nonce = nonce
            .checked_add(1)
            .ok_or(StateError::NonceOverflow(*address))?;
        Ok(*nonce)
    }

    fn add_block(&self, block: &Block) -> StateResult<()> {
        let mut state = self.state.write();

        let expected = state
            .blocks
            .keys()
            .next_back()
            .map(|n| n.saturating_add(1))
            .unwrap_or(0);
        if block.number() != expected {
            return Err(StateError::NonSequentialBlock {
                expected,
                got: block.number(),
            });
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            state.tx_index.insert(tx.hash, (block.number(), index));
        }
        state.blocks.insert(block.number(), block.clone());
        Ok(())
    }

    fn get_block(&self, number: u64) -> StateResult<Option<Block>> {
        Ok(self.state.read().blocks.get(&number).cloned())
    }

    fn get_transaction(&self, hash: &TxHash) -> StateResult<Option<Transaction>> {
        let state = self.state.read();
        let tx = state
            .tx_index
            .get(hash)
            .and_then(|(number, index)| state.blocks.get(number)?.transactions.get(*index))
            .cloned();
        Ok(tx)
    }

    fn get_gas_price(&self) -> StateResult<u64> {
        Ok(*self.gas_price.read())
    }

    fn latest_block_number(&self) -> StateResult<Option<u64>> {
        Ok(self.state.read().blocks.keys().next_back().copied())
    }
}
