//! Block Producer
//!
//! One production cycle per `block_time`: draw the slot's proposer, admit
//! pending transactions, propose, execute, seal and finalize, then gossip
//! the block. Cycles never overlap.

use super::chain::{BlockOrigin, Chain, ChainError};
use super::config::ProducerConfig;
use crate::p2p::NetworkHandle;
use crate::types::{now_millis, Address, Amount, BlockHash, Transaction, TxHash};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one production cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle is still running
    Busy,
    /// No eligible validator in the current epoch
    NoValidator,
    /// The slot belongs to a validator this node does not run
    NotOurSlot(Address),
    /// A block was finalized
    Produced {
        number: u64,
        hash: BlockHash,
        transactions: usize,
        peers: usize,
    },
}

/// Transactions picked for a block
#[derive(Debug, Default)]
pub(crate) struct Admission {
    pub admitted: Vec<Transaction>,
    /// Permanently invalid; removed from the pool
    pub evicted: Vec<TxHash>,
}

/// Resets the in-progress flag when a cycle ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Block producer
pub struct BlockProducer {
    chain: Arc<Chain>,
    network: Option<NetworkHandle>,
    /// Validator this node produces for; `None` produces for every slot owner
    local_validator: Option<Address>,
    config: ProducerConfig,
    in_progress: AtomicBool,
    /// Serializes finalize and broadcast against block import
    finalize_lock: Arc<Mutex<()>>,
}

impl BlockProducer {
    pub fn new(
        chain: Arc<Chain>,
        network: Option<NetworkHandle>,
        local_validator: Option<Address>,
        config: ProducerConfig,
        finalize_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            chain,
            network,
            local_validator,
            config,
            in_progress: AtomicBool::new(false),
            finalize_lock,
        }
    }

    /// Run one production cycle
    pub async fn produce_once(&self) -> Result<CycleOutcome, ChainError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(CycleOutcome::Busy);
        }
        let _cycle = CycleGuard(&self.in_progress);

        // Imports cannot move the head between the draw and finalize
        let _finalize = self.finalize_lock.lock().await;

        let timestamp = now_millis();
        let proposer = self.chain.engine().read().slot_owner_at(timestamp);
        let Some(proposer) = proposer else {
            debug!("No eligible validator for this slot");
            return Ok(CycleOutcome::NoValidator);
        };
        if let Some(local) = self.local_validator {
            if local != proposer {
                debug!(proposer = %proposer, "Slot belongs to another validator");
                return Ok(CycleOutcome::NotOurSlot(proposer));
            }
        }

        let Admission { admitted, evicted } = self.admit()?;
        if !evicted.is_empty() {
            let removed = self.chain.mempool().remove_batch(&evicted);
            debug!(removed, "Evicted invalid transactions");
        }

        let block = self
            .chain
            .engine()
            .write()
            .propose_block_at(admitted, proposer, timestamp)?;
        let executed = self.chain.execute_transactions(&block.transactions, &proposer);
        let block = self.chain.engine().read().seal_block(block, executed);

        let finalized = self.chain.finalize(&block, BlockOrigin::Produced)?;

        let peers = match &self.network {
            Some(network) => match network.broadcast_block(&block).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!(number = finalized.number, error = %e, "Block broadcast failed");
                    0
                }
            },
            None => 0,
        };

        info!(
            number = finalized.number,
            hash = %finalized.hash,
            transactions = block.transactions.len(),
            peers,
            "Produced block"
        );
        Ok(CycleOutcome::Produced {
            number: finalized.number,
            hash: finalized.hash,
            transactions: block.transactions.len(),
            peers,
        })
    }

    /// Pick the pending transactions that fit the next block
    ///
    /// Nonces and balances are tracked cumulatively per sender so a sender
    /// can land several consecutive transactions in one block.
    pub(crate) fn admit(&self) -> Result<Admission, ChainError> {
        let state = self.chain.state();
        let engine = self.chain.engine().read();
        let gas_limit = engine.config().block_gas_limit;
        let min_gas_price = state.get_gas_price()?;

        let mut admission = Admission::default();
        let mut next_nonce: HashMap<Address, u64> = HashMap::new();
        let mut committed: HashMap<Address, Amount> = HashMap::new();
        let mut gas_used = 0u64;

        for tx in self.chain.mempool().pending() {
            if let Err(e) = engine.validate_transaction(&tx) {
                debug!(hash = %tx.hash, error = %e, "Evicting invalid transaction");
                admission.evicted.push(tx.hash);
                continue;
            }
            if tx.gas_price < min_gas_price {
                admission.evicted.push(tx.hash);
                continue;
            }

            let expected = match next_nonce.get(&tx.from) {
                Some(nonce) => *nonce,
                None => state.get_nonce(&tx.from)?,
            };
            if tx.nonce < expected {
                debug!(hash = %tx.hash, nonce = tx.nonce, expected, "Evicting stale nonce");
                admission.evicted.push(tx.hash);
                continue;
            }
            if tx.nonce > expected {
                continue;
            }

            let Some(cost) = tx.max_cost() else {
                admission.evicted.push(tx.hash);
                continue;
            };
            let already = committed.get(&tx.from).copied().unwrap_or(0);
            let Some(needed) = already.checked_add(cost) else {
                continue;
            };
            if state.get_balance(&tx.from)? < needed {
                continue;
            }

            let Some(block_gas) = gas_used.checked_add(tx.gas_limit).filter(|g| *g <= gas_limit) else {
                continue;
            };

            gas_used = block_gas;
            next_nonce.insert(tx.from, expected + 1);
            committed.insert(tx.from, needed);
            admission.admitted.push(tx);
        }

        Ok(admission)
    }

    /// Produce every `block_time` until cancelled
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.block_time_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);

        info!(block_time_ms = self.config.block_time_ms, "Block producer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.produce_once().await {
                Ok(outcome) => debug!(?outcome, "Production cycle"),
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Production cycle failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        info!("Block producer stopped");
    }
}
