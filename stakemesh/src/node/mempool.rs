//! Transaction Mempool
//!
//! Pending pool shared by the block producer and inbound gossip. Entries are
//! indexed by hash, by sender nonce and by fee so the pool can evict the
//! cheapest transaction when it is full.

use crate::types::{Address, Amount, Transaction, TxHash};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Mempool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum number of transactions in the pool
    pub max_size: usize,
    /// Maximum pending transactions per sender
    pub max_per_sender: usize,
    /// Minimum gas price to accept
    pub min_gas_price: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_per_sender: 64,
            min_gas_price: 1,
        }
    }
}

/// Reasons a transaction is refused by the pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    #[error("Gas price {price} below minimum {min}")]
    GasPriceTooLow { price: u64, min: u64 },

    #[error("Sender {0} has too many pending transactions")]
    SenderLimit(Address),

    #[error("Nonce {nonce} already pending for {sender}")]
    NonceTaken { sender: Address, nonce: u64 },

    #[error("Pool is full and the transaction does not outbid the cheapest entry")]
    PoolFull,
}

#[derive(Debug, Clone)]
struct TxEntry {
    tx: Transaction,
    fee: Amount,
}

#[derive(Default)]
struct PoolInner {
    txs: HashMap<TxHash, TxEntry>,
    by_sender: HashMap<Address, BTreeMap<u64, TxHash>>,
    by_fee: BTreeMap<Amount, HashSet<TxHash>>,
    stats: MempoolStats,
}

impl PoolInner {
    fn remove(&mut self, hash: &TxHash) -> Option<Transaction> {
        let entry = self.txs.remove(hash)?;

        if let Some(nonces) = self.by_sender.get_mut(&entry.tx.from) {
            nonces.remove(&entry.tx.nonce);
            if nonces.is_empty() {
                self.by_sender.remove(&entry.tx.from);
            }
        }
        if let Some(set) = self.by_fee.get_mut(&entry.fee) {
            set.remove(hash);
            if set.is_empty() {
                self.by_fee.remove(&entry.fee);
            }
        }
        Some(entry.tx)
    }

    fn cheapest(&self) -> Option<(Amount, TxHash)> {
        let (fee, set) = self.by_fee.iter().next()?;
        // Smallest hash among equal fees keeps eviction deterministic
        let hash = set.iter().min()?;
        Some((*fee, *hash))
    }
}

/// Mempool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MempoolStats {
    /// Transactions accepted
    pub total_added: u64,
    /// Transactions removed after inclusion or eviction by the producer
    pub total_removed: u64,
    /// Transactions evicted to make room
    pub total_evicted: u64,
}

/// Transaction mempool
pub struct Mempool {
    config: MempoolConfig,
    inner: RwLock<PoolInner>,
}

impl Mempool {
    /// Create a new mempool with configuration
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// Configuration
    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Add a transaction
    ///
    /// Returns `Ok(false)` when the hash is already pending. A full pool
    /// evicts its lowest-fee entry when the newcomer pays more.
    pub fn add(&self, tx: Transaction) -> Result<bool, MempoolError> {
        if tx.gas_price < self.config.min_gas_price {
            return Err(MempoolError::GasPriceTooLow {
                price: tx.gas_price,
                min: self.config.min_gas_price,
            });
        }

        let mut inner = self.inner.write();
        if inner.txs.contains_key(&tx.hash) {
            debug!(hash = %tx.hash, "Transaction already pending");
            return Ok(false);
        }

        if let Some(nonces) = inner.by_sender.get(&tx.from) {
            if nonces.contains_key(&tx.nonce) {
                return Err(MempoolError::NonceTaken {
                    sender: tx.from,
                    nonce: tx.nonce,
                });
            }
            if nonces.len() >= self.config.max_per_sender {
                return Err(MempoolError::SenderLimit(tx.from));
            }
        }

        let fee = tx.fee();
        if inner.txs.len() >= self.config.max_size {
            match inner.cheapest() {
                Some((lowest, hash)) if lowest < fee => {
                    inner.remove(&hash);
                    inner.stats.total_evicted += 1;
                    debug!(evicted = %hash, "Evicted lowest-fee transaction");
                }
                _ => return Err(MempoolError::PoolFull),
            }
        }

        let hash = tx.hash;
        inner.by_sender.entry(tx.from).or_default().insert(tx.nonce, hash);
        inner.by_fee.entry(fee).or_default().insert(hash);
        inner.txs.insert(hash, TxEntry { tx, fee });
        inner.stats.total_added += 1;

        debug!(hash = %hash, size = inner.txs.len(), "Transaction added to mempool");
        Ok(true)
    }

    /// Remove a transaction by hash
    pub fn remove(&self, hash: &TxHash) -> Option<Transaction> {
        let mut inner = self.inner.write();
        let tx = inner.remove(hash);
        if tx.is_some() {
            inner.stats.total_removed += 1;
        }
        tx
    }

    /// Remove multiple transactions (after block inclusion)
    pub fn remove_batch(&self, hashes: &[TxHash]) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        for hash in hashes {
            if inner.remove(hash).is_some() {
                removed += 1;
            }
        }
        inner.stats.total_removed += removed as u64;
        removed
    }

    /// All pending transactions, ordered by sender then nonce
    pub fn pending(&self) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut senders: Vec<&Address> = inner.by_sender.keys().collect();
        senders.sort();

        senders
            .into_iter()
            .filter_map(|sender| inner.by_sender.get(sender))
            .flat_map(|nonces| nonces.values())
            .filter_map(|hash| inner.txs.get(hash).map(|e| e.tx.clone()))
            .collect()
    }

    /// Get transaction by hash
    pub fn get(&self, hash: &TxHash) -> Option<Transaction> {
        self.inner.read().txs.get(hash).map(|e| e.tx.clone())
    }

    /// Check if transaction exists
    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.read().txs.contains_key(hash)
    }

    /// Next nonce for `address` counting consecutive pending entries
    pub fn pending_nonce(&self, address: &Address, current_nonce: u64) -> u64 {
        let inner = self.inner.read();
        let Some(nonces) = inner.by_sender.get(address) else {
            return current_nonce;
        };

        let mut next = current_nonce;
        while nonces.contains_key(&next) {
            next += 1;
        }
        next
    }

    /// Get current mempool size
    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    /// Check if mempool is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().txs.is_empty()
    }

    /// Get mempool statistics
    pub fn stats(&self) -> MempoolStats {
        self.inner.read().stats.clone()
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MempoolConfig::default())
    }
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("size", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
