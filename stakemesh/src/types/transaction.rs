//! Transaction types for StakeMesh
//!
//! A transaction moves `value` from `from` to `to` and carries an opaque
//! `payload` that the core never interprets. The signing message is the
//! transaction hash, which covers every field except the hash itself and the
//! signature envelope.

use super::{Address, Amount};
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::{serde_as, DeserializeFromStr, DisplayFromStr, SerializeDisplay};
use stakemesh_crypto::{Hasher, PublicKey, Signature, Signer, Verifier};
use std::fmt;
use std::str::FromStr;

/// Transaction hash (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, SerializeDisplay, DeserializeFromStr)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Convert to raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for TxHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Signature envelope attached to a transaction
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    /// Signer's public key
    #[serde_as(as = "Hex")]
    pub public_key: [u8; 32],
    /// Signature over the transaction hash
    #[serde_as(as = "Hex")]
    pub signature: [u8; 64],
}

/// A value transfer with an opaque payload
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash over all other fields except `signature`
    pub hash: TxHash,
    /// Sender address
    pub from: Address,
    /// Recipient address
    pub to: Address,
    /// Amount transferred
    #[serde_as(as = "DisplayFromStr")]
    pub value: Amount,
    /// Opaque application data
    #[serde_as(as = "Hex")]
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Sender's nonce (must equal the account nonce at execution)
    pub nonce: u64,
    /// Maximum gas to use
    pub gas_limit: u64,
    /// Price per gas unit
    pub gas_price: u64,
    /// Creation time (Unix milliseconds)
    pub timestamp: u64,
    /// Signature envelope, absent until signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<TxSignature>,
}

impl Transaction {
    /// Gas charged for a plain transfer
    pub const TRANSFER_GAS: u64 = 21_000;

    /// Create an unsigned transfer
    pub fn transfer(
        from: Address,
        to: Address,
        value: Amount,
        nonce: u64,
        gas_price: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            hash: TxHash::default(),
            from,
            to,
            value,
            payload: Vec::new(),
            nonce,
            gas_limit: Self::TRANSFER_GAS,
            gas_price,
            timestamp,
            signature: None,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Override the gas limit
    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// Compute transaction hash
    pub fn compute_hash(&self, hasher: &dyn Hasher) -> TxHash {
        let payload_len = (self.payload.len() as u64).to_le_bytes();
        let parts: [&[u8]; 10] = [
            b"stakemesh-tx-v1",
            &self.from.0,
            &self.to.0,
            &self.value.to_le_bytes(),
            &payload_len,
            &self.payload,
            &self.nonce.to_le_bytes(),
            &self.gas_limit.to_le_bytes(),
            &self.gas_price.to_le_bytes(),
            &self.timestamp.to_le_bytes(),
        ];
        TxHash(hasher.hash_parts(&parts))
    }

    /// Fill in the hash and sign it
    pub fn sign(mut self, signer: &dyn Signer, hasher: &dyn Hasher) -> Self {
        self.hash = self.compute_hash(hasher);
        let signature = signer.sign(&self.hash.0);
        self.signature = Some(TxSignature {
            public_key: signer.public_key().0,
            signature: signature.0,
        });
        self
    }

    /// Gas fee charged to the sender (`gas_price × gas_limit`)
    pub fn fee(&self) -> Amount {
        Amount::from(self.gas_price) * Amount::from(self.gas_limit)
    }

    /// Total amount the sender must hold: `value + fee`
    pub fn max_cost(&self) -> Option<Amount> {
        self.value.checked_add(self.fee())
    }

    /// Verify hash, signer identity and signature
    pub fn verify(
        &self,
        verifier: &dyn Verifier,
        hasher: &dyn Hasher,
    ) -> Result<(), TransactionError> {
        if self.gas_limit == 0 {
            return Err(TransactionError::InvalidGasLimit);
        }

        let envelope = self
            .signature
            .as_ref()
            .ok_or(TransactionError::MissingSignature)?;

        if self.compute_hash(hasher) != self.hash {
            return Err(TransactionError::HashMismatch);
        }

        let public_key = PublicKey(envelope.public_key);
        if Address::from_public_key(&public_key, hasher) != self.from {
            return Err(TransactionError::SenderMismatch);
        }

        verifier
            .verify(&public_key, &self.hash.0, &Signature(envelope.signature))
            .map_err(|_| TransactionError::InvalidSignature)
    }
}

/// Transaction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("Transaction is not signed")]
    MissingSignature,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Signer does not match sender address")]
    SenderMismatch,
    #[error("Stored hash does not match contents")]
    HashMismatch,
    #[error("Invalid gas limit")]
    InvalidGasLimit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Ed25519Verifier};

    fn signed_transfer(seed: u8) -> (Transaction, Ed25519Keypair) {
        let keypair = Ed25519Keypair::from_seed(&[seed; 32]);
        let from = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);
        let tx = Transaction::transfer(from, Address::new([9; 20]), 1_000, 0, 2, 1_700_000_000_000)
            .sign(&keypair, &Blake3Hasher);
        (tx, keypair)
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let (tx, _) = signed_transfer(1);
        assert!(tx.verify(&Ed25519Verifier, &Blake3Hasher).is_ok());
    }

    #[test]
    fn test_unsigned_rejected() {
        let tx = Transaction::transfer(Address::zero(), Address::zero(), 1, 0, 1, 0);
        assert_eq!(
            tx.verify(&Ed25519Verifier, &Blake3Hasher),
            Err(TransactionError::MissingSignature)
        );
    }

    #[test]
    fn test_tampered_value_rejected() {
        let (mut tx, _) = signed_transfer(1);
        tx.value += 1;
        assert_eq!(
            tx.verify(&Ed25519Verifier, &Blake3Hasher),
            Err(TransactionError::HashMismatch)
        );
    }

    #[test]
    fn test_signer_must_own_sender_address() {
        let keypair = Ed25519Keypair::from_seed(&[1; 32]);
        // Claims to be someone else
        let tx = Transaction::transfer(Address::new([7; 20]), Address::zero(), 5, 0, 1, 0)
            .sign(&keypair, &Blake3Hasher);
        assert_eq!(
            tx.verify(&Ed25519Verifier, &Blake3Hasher),
            Err(TransactionError::SenderMismatch)
        );
    }

    #[test]
    fn test_zero_gas_limit_rejected() {
        let keypair = Ed25519Keypair::from_seed(&[1; 32]);
        let from = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);
        let tx = Transaction::transfer(from, Address::zero(), 5, 0, 1, 0)
            .with_gas_limit(0)
            .sign(&keypair, &Blake3Hasher);
        assert_eq!(
            tx.verify(&Ed25519Verifier, &Blake3Hasher),
            Err(TransactionError::InvalidGasLimit)
        );
    }

    #[test]
    fn test_payload_changes_hash() {
        let base = Transaction::transfer(Address::zero(), Address::zero(), 1, 0, 1, 0);
        let with_data = base.clone().with_payload(vec![1, 2, 3]);
        assert_ne!(
            base.compute_hash(&Blake3Hasher),
            with_data.compute_hash(&Blake3Hasher)
        );
    }

    #[test]
    fn test_cost_includes_fee() {
        let tx = Transaction::transfer(Address::zero(), Address::zero(), 100, 0, 3, 0);
        assert_eq!(tx.fee(), 3 * 21_000);
        assert_eq!(tx.max_cost(), Some(100 + 3 * 21_000));

        let huge = Transaction::transfer(Address::zero(), Address::zero(), Amount::MAX, 0, 1, 0);
        assert_eq!(huge.max_cost(), None);
    }

    #[test]
    fn test_json_keeps_large_values_exact() {
        let (mut tx, keypair) = signed_transfer(2);
        tx.value = u128::MAX / 3;
        let tx = tx.sign(&keypair, &Blake3Hasher);

        let value = serde_json::to_value(&tx).unwrap();
        let back: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(back, tx);
        assert!(back.verify(&Ed25519Verifier, &Blake3Hasher).is_ok());
    }
}
