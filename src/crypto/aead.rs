//! AEAD encryption/decryption for session payloads
//!
//! Sealed messages carry their own nonce:
//!
//! ```text
//! +-----------------+----------------------+-----------+
//! |  Nonce (12B)    |  Ciphertext (N)      | Tag (16B) |
//! +-----------------+----------------------+-----------+
//! ```
//!
//! Every session key is shared by both peers of a session (and by every
//! member of a multicast group), so a per-cipher counter cannot guarantee
//! nonce uniqueness. Nonces are drawn from the system random source instead.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// AEAD cipher for sealing and opening session data
pub struct Cipher {
    key: LessSafeKey,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`
    pub fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce)?;

        let mut buffer = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(&nonce);
        buffer.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(associated_data),
                &mut buffer[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        buffer.extend_from_slice(tag.as_ref());

        Ok(buffer)
    }

    /// Decrypt data produced by [`Cipher::seal`], verifying the auth tag
    pub fn open(&self, associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption("message too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);
        let mut buffer = sealed[NONCE_LEN..].to_vec();

        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(associated_data),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;

        Ok(plaintext.to_vec())
    }
}
