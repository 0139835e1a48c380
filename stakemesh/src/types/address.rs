//! StakeMesh addresses
//!
//! An address is the last 20 bytes of the hash of an account's public key.
//! Text form is lowercase hex, optionally `0x`-prefixed on input.

use serde_with::{DeserializeFromStr, SerializeDisplay};
use stakemesh_crypto::{Hasher, PublicKey};
use std::fmt;
use std::str::FromStr;

/// Address length in bytes (20 bytes = 160 bits)
pub const ADDRESS_LENGTH: usize = 20;

/// A 20-byte account identity
///
/// Ordering is byte-wise and is used wherever ties must break
/// deterministically (validator ranking).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, SerializeDisplay, DeserializeFromStr)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    /// Create from raw bytes
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derive address from a public key
    pub fn from_public_key(public_key: &PublicKey, hasher: &dyn Hasher) -> Self {
        let hash = hasher.hash(public_key.as_bytes());

        // Take last 20 bytes of hash
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&hash[12..32]);
        Self(bytes)
    }

    /// Zero address (burn address)
    pub const fn zero() -> Self {
        Self([0u8; ADDRESS_LENGTH])
    }

    /// Check if this is the zero address
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex, with or without `0x`
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| AddressError::InvalidHex)?;
        if bytes.len() != ADDRESS_LENGTH {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; ADDRESS_LENGTH];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; ADDRESS_LENGTH]> for Address {
    fn from(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

/// Address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid hex encoding")]
    InvalidHex,

    #[error("Invalid address length: {0} bytes")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Signer};

    #[test]
    fn test_address_from_public_key() {
        let keypair = Ed25519Keypair::from_seed(&[1u8; 32]);
        let a = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);
        let b = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);
        assert_eq!(a, b);
        assert!(!a.is_zero());

        let other = Ed25519Keypair::from_seed(&[2u8; 32]);
        assert_ne!(a, Address::from_public_key(&other.public_key(), &Blake3Hasher));
    }

    #[test]
    fn test_hex_parsing() {
        let addr = Address::new([0xab; 20]);
        assert_eq!(Address::from_hex(&addr.to_hex()).unwrap(), addr);
        assert_eq!(Address::from_hex(&format!("0x{}", addr)).unwrap(), addr);
        assert_eq!(Address::from_hex("abcd"), Err(AddressError::InvalidLength(2)));
        assert_eq!(Address::from_hex("zz"), Err(AddressError::InvalidHex));
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let mut low = [0u8; 20];
        low[19] = 1;
        let mut high = [0u8; 20];
        high[0] = 1;
        assert!(Address::new(low) < Address::new(high));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let addr = Address::new([0x11; 20]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(20)));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
