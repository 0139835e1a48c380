//! Block and BlockHeader definitions
//!
//! The header hash is a pure function of the other header fields. The
//! transaction list is committed through `tx_root`, so any change to the
//! body also changes the hash.

use super::{Address, Transaction};
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::{serde_as, DeserializeFromStr, SerializeDisplay};
use stakemesh_crypto::Hasher;
use std::fmt;
use std::str::FromStr;

/// Block hash (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, SerializeDisplay, DeserializeFromStr)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Zero hash (genesis parent)
    pub const ZERO: Self = Self([0u8; 32]);

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check if zero
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Block header
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number (0 for genesis)
    pub number: u64,
    /// Hash of parent block
    pub parent_hash: BlockHash,
    /// Block timestamp (Unix milliseconds)
    pub timestamp: u64,
    /// Difficulty at the time of proposal
    pub difficulty: u64,
    /// Gas limit for this block
    pub gas_limit: u64,
    /// Sum of the gas limits of included transactions
    pub gas_used: u64,
    /// Validator who proposed this block
    pub proposer: Address,
    /// Proposer-chosen nonce
    pub nonce: u64,
    /// Merkle root of transaction hashes
    #[serde_as(as = "Hex")]
    pub tx_root: [u8; 32],
    /// Hash over every other header field
    pub hash: BlockHash,
}

impl BlockHeader {
    /// Compute block hash
    pub fn compute_hash(&self, hasher: &dyn Hasher) -> BlockHash {
        let parts: [&[u8]; 10] = [
            b"stakemesh-block-v1",
            &self.number.to_le_bytes(),
            &self.parent_hash.0,
            &self.timestamp.to_le_bytes(),
            &self.difficulty.to_le_bytes(),
            &self.gas_limit.to_le_bytes(),
            &self.gas_used.to_le_bytes(),
            &self.proposer.0,
            &self.nonce.to_le_bytes(),
            &self.tx_root,
        ];
        BlockHash(hasher.hash_parts(&parts))
    }

    /// Check if this is a genesis header
    pub fn is_genesis(&self) -> bool {
        self.number == 0 && self.parent_hash.is_zero()
    }
}

/// A complete block with header and transactions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Transactions in this block, in execution order
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Get block hash
    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    /// Get block number
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Sum of transaction gas limits
    pub fn total_gas(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.gas_limit))
    }

    /// Compute transaction root (Merkle root of tx hashes)
    pub fn compute_tx_root(&self, hasher: &dyn Hasher) -> [u8; 32] {
        let tx_hashes: Vec<[u8; 32]> = self.transactions.iter().map(|tx| tx.hash.0).collect();
        compute_merkle_root(&tx_hashes, hasher)
    }

    /// Recompute gas usage, transaction root and hash
    pub fn seal(&mut self, hasher: &dyn Hasher) {
        self.header.gas_used = self.total_gas();
        self.header.tx_root = self.compute_tx_root(hasher);
        self.header.hash = self.header.compute_hash(hasher);
    }

    /// Create genesis block
    pub fn genesis(timestamp: u64, gas_limit: u64, difficulty: u64, hasher: &dyn Hasher) -> Self {
        let mut block = Self {
            header: BlockHeader {
                number: 0,
                parent_hash: BlockHash::ZERO,
                timestamp,
                difficulty,
                gas_limit,
                gas_used: 0,
                proposer: Address::zero(),
                nonce: 0,
                tx_root: [0u8; 32],
                hash: BlockHash::ZERO,
            },
            transactions: Vec::new(),
        };
        block.seal(hasher);
        block
    }

    /// Check header hash, transaction root and gas accounting
    pub fn validate_structure(&self, hasher: &dyn Hasher) -> Result<(), BlockError> {
        if self.compute_tx_root(hasher) != self.header.tx_root {
            return Err(BlockError::InvalidTxRoot);
        }
        if self.header.compute_hash(hasher) != self.header.hash {
            return Err(BlockError::HashMismatch);
        }
        if self.total_gas() > self.header.gas_limit {
            return Err(BlockError::GasExceedsLimit);
        }
        Ok(())
    }
}

/// Compute Merkle root from a list of hashes
pub fn compute_merkle_root(hashes: &[[u8; 32]], hasher: &dyn Hasher) -> [u8; 32] {
    if hashes.is_empty() {
        return [0u8; 32];
    }

    let mut current_level: Vec<[u8; 32]> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| {
                // Duplicate if odd
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                let pair: [&[u8]; 2] = [&chunk[0], right];
                hasher.hash_parts(&pair)
            })
            .collect();
    }

    current_level[0]
}

/// Block-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("Gas used exceeds gas limit")]
    GasExceedsLimit,
    #[error("Invalid transaction root")]
    InvalidTxRoot,
    #[error("Header hash does not match contents")]
    HashMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakemesh_crypto::Blake3Hasher;

    #[test]
    fn test_block_hash() {
        let genesis = Block::genesis(1_234_567_890, 10_000_000, 10_000, &Blake3Hasher);
        assert!(!genesis.hash().is_zero());
        assert!(genesis.header.is_genesis());

        // Hash should be deterministic
        assert_eq!(genesis.header.compute_hash(&Blake3Hasher), genesis.hash());
    }

    #[test]
    fn test_header_fields_change_hash() {
        let genesis = Block::genesis(0, 10_000_000, 10_000, &Blake3Hasher);
        let mut header = genesis.header.clone();
        header.nonce = 1;
        assert_ne!(header.compute_hash(&Blake3Hasher), genesis.hash());
    }

    #[test]
    fn test_merkle_root() {
        let hashes = vec![[1u8; 32], [2u8; 32], [3u8; 32]];

        let root = compute_merkle_root(&hashes, &Blake3Hasher);
        assert!(!root.iter().all(|&b| b == 0));

        // Single element
        assert_eq!(compute_merkle_root(&[[5u8; 32]], &Blake3Hasher), [5u8; 32]);

        // Empty
        assert_eq!(compute_merkle_root(&[], &Blake3Hasher), [0u8; 32]);
    }

    #[test]
    fn test_block_validation() {
        let mut block = Block::genesis(0, 10_000_000, 10_000, &Blake3Hasher);
        assert!(block.validate_structure(&Blake3Hasher).is_ok());

        block.header.timestamp += 1;
        assert_eq!(
            block.validate_structure(&Blake3Hasher),
            Err(BlockError::HashMismatch)
        );
    }

    #[test]
    fn test_body_tamper_detected() {
        let mut block = Block::genesis(0, 10_000_000, 10_000, &Blake3Hasher);
        let mut tx = Transaction::transfer(Address::zero(), Address::zero(), 1, 0, 1, 0);
        tx.hash = tx.compute_hash(&Blake3Hasher);
        block.transactions.push(tx);
        assert_eq!(
            block.validate_structure(&Blake3Hasher),
            Err(BlockError::InvalidTxRoot)
        );

        block.seal(&Blake3Hasher);
        assert!(block.validate_structure(&Blake3Hasher).is_ok());
        assert_eq!(block.header.gas_used, Transaction::TRANSFER_GAS);
    }
}
