//! State Storage for StakeMesh
//!
//! Account balances, nonces and the finalized chain sit behind the
//! [`StateStore`] trait. The node only talks to the trait:
//! - `MemoryStateStore` keeps everything in process memory
//! - `CachedStateStore` wraps any store with a read-through balance/nonce
//!   cache that is invalidated on every write touching an address

pub mod cache;
pub mod memory;

use crate::types::{Address, Amount, Block, Transaction, TxHash};

// Re-exports
pub use cache::{CacheConfig, CacheStats, CachedStateStore, LruCache};
pub use memory::MemoryStateStore;

/// Storage result type
pub type StateResult<T> = Result<T, StateError>;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Insufficient balance for {address}: have {have}, need {need}")]
    InsufficientBalance {
        address: Address,
        have: Amount,
        need: Amount,
    },

    #[error("Balance overflow for {0}")]
    BalanceOverflow(Address),

    #[error("Nonce overflow for {0}")]
    NonceOverflow(Address),

    #[error("Non-sequential block: expected {expected}, got {got}")]
    NonSequentialBlock { expected: u64, got: u64 },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Account state and finalized chain storage
///
/// Implementations must make `transfer` and `transfer_all` atomic: either
/// every balance changes or none does.
pub trait StateStore: Send + Sync {
    /// Balance of `address` (zero when unknown)
    fn get_balance(&self, address: &Address) -> StateResult<Amount>;

    /// Account nonce of `address` (zero when unknown)
    fn get_nonce(&self, address: &Address) -> StateResult<u64>;

    /// Move `amount` from `from` to `to`
    fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> StateResult<()>;

    /// Pay every `(recipient, amount)` from `from` in one write
    fn transfer_all(&self, from: &Address, payments: &[(Address, Amount)]) -> StateResult<()>;

    /// Increment the nonce of `address`, returning the new value
    fn increment_nonce(&self, address: &Address) -> StateResult<u64>;

    /// Persist a finalized block; numbers must be contiguous
    fn add_block(&self, block: &Block) -> StateResult<()>;

    /// Finalized block by number
    fn get_block(&self, number: u64) -> StateResult<Option<Block>>;

    /// Finalized transaction by hash
    fn get_transaction(&self, hash: &TxHash) -> StateResult<Option<Transaction>>;

    /// Current network gas price
    fn get_gas_price(&self) -> StateResult<u64>;

    /// Number of the latest persisted block, `None` before genesis
    fn latest_block_number(&self) -> StateResult<Option<u64>>;
}

/// Load up to `limit` contiguous blocks starting at `from`, stopping at the
/// first gap or at `to` (inclusive)
pub fn load_block_range(
    store: &dyn StateStore,
    from: u64,
    to: u64,
    limit: usize,
) -> StateResult<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut number = from;
    while number <= to && blocks.len() < limit {
        match store.get_block(number)? {
            Some(block) => blocks.push(block),
            None => break,
        }
        number = match number.checked_add(1) {
            Some(n) => n,
            None => break,
        };
    }
    Ok(blocks)
}
