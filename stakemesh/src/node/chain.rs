//! Chain Manager
//!
//! Finalization is shared by locally produced and imported blocks: persist,
//! advance the consensus head, rotate the epoch when due, run uptime decay,
//! and clear included transactions from the pool. Imported blocks may arrive
//! out of order; blocks ahead of the head are buffered as orphans until
//! their parent is finalized.

use super::mempool::Mempool;
use super::NodeEvent;
use crate::consensus::{ConsensusEngine, ConsensusError, EpochSummary, ValidationError};
use crate::storage::{StateError, StateStore};
use crate::types::{now_millis, Address, Amount, Block, BlockHash, Transaction, TxHash};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Maximum buffered orphan blocks
pub const MAX_ORPHANS: usize = 256;

/// Where an imported block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSource {
    /// Live gossip; must be within the clock drift window
    Gossip,
    /// Historical block from a sync response
    Sync,
}

/// Where a finalized block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Produced,
    Imported,
}

/// Block import result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    /// Finalized, together with `count - 1` drained orphans
    Imported { count: usize },
    /// At or below the local head
    Known,
    /// Buffered; blocks `from..=to` are missing
    Orphan { from: u64, to: u64 },
    /// Rejected
    Invalid(String),
}

/// Result of finalizing one block
#[derive(Debug, Clone)]
pub struct Finalized {
    pub number: u64,
    pub hash: BlockHash,
    /// Set when the block completed an epoch
    pub epoch: Option<EpochSummary>,
    /// Validators deactivated by uptime decay
    pub decayed: Vec<Address>,
}

/// Chain errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
}

/// Transaction execution failures; each aborts only its transaction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },

    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: Amount, need: Amount },

    #[error("Transaction cost overflows")]
    CostOverflow,

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Execute one transaction: value to the recipient, fee to the proposer,
/// then bump the sender nonce
///
/// Both payments move in one store write, so a failure leaves the sender
/// untouched.
pub fn execute_transaction(
    state: &dyn StateStore,
    tx: &Transaction,
    proposer: &Address,
) -> Result<(), ExecutionError> {
    let expected = state.get_nonce(&tx.from)?;
    if tx.nonce != expected {
        return Err(ExecutionError::NonceMismatch {
            expected,
            got: tx.nonce,
        });
    }

    let need = tx.max_cost().ok_or(ExecutionError::CostOverflow)?;
    let have = state.get_balance(&tx.from)?;
    if have < need {
        return Err(ExecutionError::InsufficientFunds { have, need });
    }

    if expected == u64::MAX {
        return Err(StateError::NonceOverflow(tx.from).into());
    }

    state.transfer_all(&tx.from, &[(tx.to, tx.value), (*proposer, tx.fee())])?;
    state.increment_nonce(&tx.from)?;
    Ok(())
}

/// Finalized chain, orphan buffer and shared finalization
pub struct Chain {
    engine: Arc<RwLock<ConsensusEngine>>,
    state: Arc<dyn StateStore>,
    mempool: Arc<Mempool>,
    /// Orphans by block number
    orphans: Mutex<BTreeMap<u64, Block>>,
    events: broadcast::Sender<NodeEvent>,
}

impl Chain {
    pub fn new(
        engine: Arc<RwLock<ConsensusEngine>>,
        state: Arc<dyn StateStore>,
        mempool: Arc<Mempool>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            engine,
            state,
            mempool,
            orphans: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    pub fn engine(&self) -> &Arc<RwLock<ConsensusEngine>> {
        &self.engine
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    /// Get current chain height
    pub fn height(&self) -> u64 {
        self.engine.read().head().number
    }

    /// Number of buffered orphans
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Execute `txs` in order, returning those that succeeded
    pub fn execute_transactions(&self, txs: &[Transaction], proposer: &Address) -> Vec<Transaction> {
        txs.iter()
            .filter(|tx| match execute_transaction(self.state.as_ref(), tx, proposer) {
                Ok(()) => true,
                Err(e) => {
                    warn!(hash = %tx.hash, error = %e, "Transaction execution failed");
                    false
                }
            })
            .cloned()
            .collect()
    }

    /// Persist `block` and advance consensus past it
    pub fn finalize(&self, block: &Block, origin: BlockOrigin) -> Result<Finalized, ChainError> {
        self.state.add_block(block)?;

        let (epoch, decayed) = {
            let mut engine = self.engine.write();
            let rotate = engine.apply_finalized(block);
            let epoch = rotate.then(|| engine.start_epoch());
            (epoch, engine.decay_inactive())
        };

        let included: Vec<TxHash> = block.transactions.iter().map(|tx| tx.hash).collect();
        self.mempool.remove_batch(&included);

        info!(
            number = block.number(),
            hash = %block.hash(),
            proposer = %block.header.proposer,
            transactions = block.transactions.len(),
            ?origin,
            "Block finalized"
        );

        let _ = self.events.send(NodeEvent::BlockFinalized {
            number: block.number(),
            hash: block.hash(),
            proposer: block.header.proposer,
            transactions: block.transactions.len(),
            origin,
        });
        if let Some(summary) = &epoch {
            let _ = self.events.send(NodeEvent::EpochStarted {
                epoch: summary.epoch,
                validators: summary.validators.clone(),
            });
        }

        Ok(Finalized {
            number: block.number(),
            hash: block.hash(),
            epoch,
            decayed,
        })
    }

    /// Import a block received from a peer
    pub fn import_block(&self, block: Block, source: ImportSource) -> Result<BlockStatus, ChainError> {
        let head_number = self.height();
        let number = block.number();

        if number <= head_number {
            debug!(number, head = head_number, "Ignoring known block");
            return Ok(BlockStatus::Known);
        }

        if number > head_number + 1 {
            if source == ImportSource::Gossip {
                if let Err(e) = self.engine.read().validate_block(&block) {
                    return Ok(BlockStatus::Invalid(e.to_string()));
                }
            }
            self.buffer_orphan(block);
            return Ok(BlockStatus::Orphan {
                from: head_number + 1,
                to: number - 1,
            });
        }

        if let Err(reason) = self.check_imported(&block, source) {
            warn!(number, hash = %block.hash(), reason = %reason, "Rejected block");
            return Ok(BlockStatus::Invalid(reason));
        }
        self.apply_imported(&block)?;

        let mut count = 1;
        while let Some(orphan) = self.next_orphan() {
            match self.check_imported(&orphan, ImportSource::Sync) {
                Ok(()) => {
                    self.apply_imported(&orphan)?;
                    count += 1;
                }
                Err(reason) => {
                    warn!(number = orphan.number(), reason = %reason, "Discarding orphan");
                    break;
                }
            }
        }
        Ok(BlockStatus::Imported { count })
    }

    fn check_imported(&self, block: &Block, source: ImportSource) -> Result<(), String> {
        let engine = self.engine.read();
        let head = engine.head();

        if block.header.parent_hash != head.hash {
            return Err(format!("parent {} is not the head {}", block.header.parent_hash, head.hash));
        }
        engine
            .validate_proposer(&block.header.proposer, block.header.timestamp)
            .map_err(|e| e.to_string())?;

        let validated = match source {
            ImportSource::Gossip => engine.validate_block(block),
            ImportSource::Sync => {
                let now = now_millis();
                let max_drift = engine.config().max_clock_drift_ms;
                if block.header.timestamp > now.saturating_add(max_drift) {
                    Err(ValidationError::StaleTimestamp {
                        drift_ms: block.header.timestamp - now,
                    })
                } else if block.header.timestamp < head.timestamp {
                    return Err("timestamp precedes parent".into());
                } else {
                    engine.validate_block_at(block, block.header.timestamp)
                }
            }
        };
        validated.map_err(|e| e.to_string())
    }

    fn apply_imported(&self, block: &Block) -> Result<Finalized, ChainError> {
        let executed = self.execute_transactions(&block.transactions, &block.header.proposer);
        if executed.len() != block.transactions.len() {
            warn!(
                number = block.number(),
                executed = executed.len(),
                included = block.transactions.len(),
                "Imported block did not fully execute"
            );
        }
        self.finalize(block, BlockOrigin::Imported)
    }

    fn buffer_orphan(&self, block: Block) {
        let mut orphans = self.orphans.lock();
        let number = block.number();
        if !orphans.contains_key(&number) && orphans.len() >= MAX_ORPHANS {
            // Keep the blocks closest to the head
            match orphans.keys().next_back().copied() {
                Some(furthest) if furthest > number => {
                    orphans.remove(&furthest);
                }
                _ => {
                    debug!(number, "Orphan buffer full");
                    return;
                }
            }
        }
        debug!(number, parent = %block.header.parent_hash, "Buffered orphan block");
        orphans.insert(number, block);
    }

    fn next_orphan(&self) -> Option<Block> {
        let head = self.height();
        let mut orphans = self.orphans.lock();
        // Drop anything at or below the new head
        *orphans = orphans.split_off(&(head + 1));
        orphans.remove(&(head + 1))
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("height", &self.height())
            .field("orphans", &self.orphan_count())
            .finish()
    }
}
