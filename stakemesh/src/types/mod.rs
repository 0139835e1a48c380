//! Core types for the StakeMesh chain
//!
//! This module defines the fundamental data structures:
//! - Blocks and block headers
//! - Transactions and their signature envelopes
//! - Addresses and identifiers

pub mod address;
pub mod block;
pub mod transaction;

pub use address::{Address, AddressError};
pub use block::{Block, BlockError, BlockHash, BlockHeader};
pub use transaction::{Transaction, TransactionError, TxHash, TxSignature};

/// Stake, balance, value and reward amounts
pub type Amount = u128;

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
