//! # stakemesh-crypto
//!
//! Hashing and signature capabilities used by the StakeMesh node.
//!
//! ## Overview
//!
//! The consensus core never calls a concrete hash function or signature
//! scheme directly. It holds trait objects for three capabilities:
//!
//! - **[`Hasher`]** - 32-byte digests for block and transaction hashes
//! - **[`Signer`]** - produces signatures for a held key
//! - **[`Verifier`]** - checks a signature against a public key
//!
//! The default implementations are BLAKE3 ([`hash::Blake3Hasher`]) and
//! Ed25519 ([`signature::Ed25519Keypair`], [`signature::Ed25519Verifier`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use stakemesh_crypto::prelude::*;
//!
//! let keypair = Ed25519Keypair::from_seed(&[7u8; 32]);
//! let signature = keypair.sign(b"message");
//!
//! let verifier = Ed25519Verifier;
//! assert!(verifier.verify(&keypair.public_key(), b"message", &signature).is_ok());
//!
//! let digest = Blake3Hasher.hash(b"data to hash");
//! assert_eq!(digest.len(), 32);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub use hash::{Blake3Hasher, Hasher, HASH_SIZE};
pub use random::{random_bytes, RandomError};
pub use signature::{
    Ed25519Keypair, Ed25519Verifier, PublicKey, Signature, SignatureError, Signer, Verifier,
    PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};

/// Hash capability and the BLAKE3 implementation
pub mod hash;

/// Signature capabilities and the Ed25519 implementation
pub mod signature;

/// OS-backed random bytes for key generation
pub mod random;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "stakemesh-crypto";

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient imports for common use cases
    //!
    //! ```rust
    //! use stakemesh_crypto::prelude::*;
    //! ```

    pub use crate::hash::{Blake3Hasher, Hasher};
    pub use crate::signature::{
        Ed25519Keypair, Ed25519Verifier, PublicKey, Signature, Signer, Verifier,
    };
}
