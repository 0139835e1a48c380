//! # Hashing
//!
//! The [`Hasher`] capability produces fixed 32-byte digests. Block and
//! transaction hashes, address derivation and message ids all go through it,
//! so swapping the implementation changes every digest in the system at once.

/// Digest size in bytes
pub const HASH_SIZE: usize = 32;

/// A 32-byte hash function
pub trait Hasher: Send + Sync {
    /// Hash a single buffer
    fn hash(&self, data: &[u8]) -> [u8; HASH_SIZE];

    /// Hash the concatenation of several buffers
    fn hash_parts(&self, parts: &[&[u8]]) -> [u8; HASH_SIZE] {
        let mut joined = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            joined.extend_from_slice(part);
        }
        self.hash(&joined)
    }
}

/// BLAKE3 with the default 256-bit output
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    fn hash(&self, data: &[u8]) -> [u8; HASH_SIZE] {
        *blake3::hash(data).as_bytes()
    }

    fn hash_parts(&self, parts: &[&[u8]]) -> [u8; HASH_SIZE] {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        *hasher.finalize().as_bytes()
    }
}

impl Blake3Hasher {
    /// Keyed hash with a domain-separation context string
    pub fn derive(context: &str, data: &[u8]) -> [u8; HASH_SIZE] {
        blake3::derive_key(context, data)
    }
}
