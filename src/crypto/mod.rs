//! Cryptographic primitives for session encryption
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD sealing with per-message random nonces
//! - HKDF-SHA256 derivation of session keys from the shared token
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::Cipher;
pub use kdf::{derive_session_key, Hkdf};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Random source failure")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Pick a uniformly distributed index in `0..len`
///
/// Returns 0 for an empty range.
pub fn random_index(len: usize) -> Result<usize, CryptoError> {
    if len <= 1 {
        return Ok(0);
    }

    // Rejection sampling keeps the distribution uniform
    let len = len as u64;
    let zone = u64::MAX - (u64::MAX % len);
    loop {
        let mut buf = [0u8; 8];
        random_bytes(&mut buf)?;
        let value = u64::from_le_bytes(buf);
        if value < zone {
            return Ok((value % len) as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_index_in_range() {
        assert_eq!(random_index(0).unwrap(), 0);
        assert_eq!(random_index(1).unwrap(), 0);

        for _ in 0..1000 {
            assert!(random_index(3).unwrap() < 3);
        }
    }
}
