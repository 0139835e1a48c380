//! Random byte generation backed by the operating system.

use rand::rngs::OsRng;
use rand::RngCore;

/// Error types for random operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RandomError {
    /// System entropy source unavailable
    #[error("System entropy source unavailable: {0}")]
    EntropyUnavailable(String),
}

/// Fill a fixed-size array from the OS entropy source
pub fn random_bytes<const N: usize>() -> Result<[u8; N], RandomError> {
    let mut out = [0u8; N];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| RandomError::EntropyUnavailable(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; 32] = random_bytes().unwrap();
        let b: [u8; 32] = random_bytes().unwrap();
        assert_ne!(a, b);
    }
}
