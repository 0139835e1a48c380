//! State Cache
//!
//! LRU read-through cache for balances and nonces in front of any
//! [`StateStore`]. Writes go straight to the inner store and drop the cached
//! entries of every address they touch.

use super::{StateResult, StateStore};
use crate::types::{Address, Amount, Block, Transaction, TxHash};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries in the balance cache
    pub balance_cache_size: usize,
    /// Maximum entries in the nonce cache
    pub nonce_cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            balance_cache_size: 10_000,
            nonce_cache_size: 10_000,
        }
    }
}

impl CacheConfig {
    /// Minimal cache for testing
    pub fn minimal() -> Self {
        Self {
            balance_cache_size: 4,
            nonce_cache_size: 4,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// Access counter for LRU
    last_access: u64,
}

struct LruInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    access_counter: u64,
    stats: CacheStats,
}

/// Simple LRU cache
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<LruInner<K, V>>,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// Evictions
    pub evictions: u64,
    /// Invalidations caused by writes
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// Create new cache with capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LruInner {
                entries: HashMap::with_capacity(capacity),
                access_counter: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Get value from cache
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.access_counter += 1;
        let tick = inner.access_counter;

        let value = inner.entries.get_mut(key).map(|entry| {
            entry.last_access = tick;
            entry.value.clone()
        });
        match value {
            Some(_) => inner.stats.hits += 1,
            None => inner.stats.misses += 1,
        }
        value
    }

    /// Put value into cache
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&key) {
            Self::evict_lru(&mut inner);
        }

        inner.access_counter += 1;
        let last_access = inner.access_counter;
        inner.entries.insert(key, CacheEntry { value, last_access });
    }

    /// Drop an entry after a write
    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            inner.stats.invalidations += 1;
        }
    }

    /// Get current size
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Get statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    fn evict_lru(inner: &mut LruInner<K, V>) {
        let lru_key = inner
            .entries
            .iter()
            .min_by_key(|(_, v)| v.last_access)
            .map(|(k, _)| k.clone());

        if let Some(key) = lru_key {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
        }
    }
}

/// Read-through balance/nonce cache over another store
pub struct CachedStateStore<S> {
    inner: S,
    balances: LruCache<Address, Amount>,
    nonces: LruCache<Address, u64>,
}

impl<S: StateStore> CachedStateStore<S> {
    /// Wrap `inner` with the given cache sizes
    pub fn new(inner: S, config: CacheConfig) -> Self {
        Self {
            inner,
            balances: LruCache::new(config.balance_cache_size),
            nonces: LruCache::new(config.nonce_cache_size),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Balance cache statistics
    pub fn balance_stats(&self) -> CacheStats {
        self.balances.stats()
    }

    /// Nonce cache statistics
    pub fn nonce_stats(&self) -> CacheStats {
        self.nonces.stats()
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        self.balances.clear();
        self.nonces.clear();
    }
}

impl<S: StateStore> StateStore for CachedStateStore<S> {
    fn get_balance(&self, address: &Address) -> StateResult<Amount> {
        if let Some(balance) = self.balances.get(address) {
            return Ok(balance);
        }
        let balance = self.inner.get_balance(address)?;
        self.balances.put(*address, balance);
        Ok(balance)
    }

    fn get_nonce(&self, address: &Address) -> StateResult<u64> {
        if let Some(nonce) = self.nonces.get(address) {
            return Ok(nonce);
        }
        let nonce = self.inner.get_nonce(address)?;
        self.nonces.put(*address, nonce);
        Ok(nonce)
    }

    fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> StateResult<()> {
        // Invalidate on failure too
        let result = self.inner.transfer(from, to, amount);
        self.balances.invalidate(from);
        self.balances.invalidate(to);
        result
    }

    fn transfer_all(&self, from: &Address, payments: &[(Address, Amount)]) -> StateResult<()> {
        let result = self.inner.transfer_all(from, payments);
        self.balances.invalidate(from);
        for (to, _) in payments {
            self.balances.invalidate(to);
        }
        result
    }

    fn increment_nonce(&self, address: &Address) -> StateResult<u64> {
        let result = self.inner.increment_nonce(address);
        self.nonces.invalidate(address);
        result
    }

    fn add_block(&self, block: &Block) -> StateResult<()> {
        self.inner.add_block(block)
    }

    fn get_block(&self, number: u64) -> StateResult<Option<Block>> {
        self.inner.get_block(number)
    }

    fn get_transaction(&self, hash: &TxHash) -> StateResult<Option<Transaction>> {
        self.inner.get_transaction(hash)
    }

    fn get_gas_price(&self) -> StateResult<u64> {
        self.inner.get_gas_price()
    }

    fn latest_block_number(&self) -> StateResult<Option<u64>> {
        self.inner.latest_block_number()
    }
}
