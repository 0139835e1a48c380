//! # Signatures
//!
//! [`Signer`] and [`Verifier`] separate "holding a key" from "checking a
//! signature" so that verification can run with nothing but public data.
//! Ed25519 (RFC 8032, strict verification) is the provided scheme.

use crate::random::{random_bytes, RandomError};
use ed25519_dalek::Signer as _;
use std::fmt;
use zeroize::Zeroizing;

/// Public key size in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Error types for signature operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// Invalid public key
    #[error("Invalid public key")]
    InvalidPublicKey,
    /// Invalid signature format
    #[error("Invalid signature format")]
    InvalidSignature,
    /// Signature verification failed
    #[error("Signature verification failed")]
    VerificationFailed,
    /// Key generation failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(#[from] RandomError),
}

/// Raw public key bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Parse from a byte slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self(arr))
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s).map_err(|_| SignatureError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Raw signature bytes
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Parse from a byte slice of exactly 64 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; SIGNATURE_SIZE] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidSignature)?;
        Ok(Self(arr))
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s).map_err(|_| SignatureError::InvalidSignature)?;
        Self::from_slice(&bytes)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &self.to_hex()[..16])
    }
}

/// Something that holds a private key
pub trait Signer: Send + Sync {
    /// The public key matching the held private key
    fn public_key(&self) -> PublicKey;

    /// Sign a message
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Signature verification against a public key
pub trait Verifier: Send + Sync {
    /// Verify `signature` over `message` was produced by `public_key`
    fn verify(
        &self,
        public_key: &PublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), SignatureError>;
}

/// Ed25519 keypair
pub struct Ed25519Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Ed25519Keypair {
    /// Generate a fresh keypair from OS entropy
    pub fn generate() -> Result<Self, SignatureError> {
        let seed = Zeroizing::new(random_bytes::<32>()?);
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic keypair from a 32-byte secret seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Export the secret seed
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

impl Signer for Ed25519Keypair {
    fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for Ed25519Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Strict Ed25519 verification
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(
        &self,
        public_key: &PublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), SignatureError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(public_key.as_bytes())
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify_strict(message, &sig)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Ed25519Keypair::from_seed(&[1u8; 32]);
        let sig = keypair.sign(b"Hello, stake!");
        assert!(Ed25519Verifier
            .verify(&keypair.public_key(), b"Hello, stake!", &sig)
            .is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = Ed25519Keypair::from_seed(&[1u8; 32]);
        let sig = keypair.sign(b"original");
        assert_eq!(
            Ed25519Verifier.verify(&keypair.public_key(), b"modified", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = Ed25519Keypair::from_seed(&[1u8; 32]);
        let other = Ed25519Keypair::from_seed(&[2u8; 32]);
        let sig = signer.sign(b"message");
        assert!(Ed25519Verifier
            .verify(&other.public_key(), b"message", &sig)
            .is_err());
    }

    #[test]
    fn test_deterministic_signatures() {
        let keypair = Ed25519Keypair::from_seed(&[9u8; 32]);
        assert_eq!(keypair.sign(b"m"), keypair.sign(b"m"));
    }

    #[test]
    fn test_seed_recreates_key() {
        let keypair = Ed25519Keypair::generate().unwrap();
        let restored = Ed25519Keypair::from_seed(&keypair.seed());
        assert_eq!(keypair.public_key(), restored.public_key());
    }

    #[test]
    fn test_hex_parsing_rejects_wrong_length() {
        assert_eq!(
            PublicKey::from_hex("abcd"),
            Err(SignatureError::InvalidPublicKey)
        );
        assert_eq!(
            Signature::from_hex(&"00".repeat(63)),
            Err(SignatureError::InvalidSignature)
        );
    }
}
