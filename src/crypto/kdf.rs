//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for deriving session keys from the shared token

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// Info label bound into every session key
const SESSION_KEY_INFO: &[u8] = b"mesh_tunnel_session_key";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        let prk = salt.extract(ikm);

        Self { prk }
    }

    /// Derive key material from the PRK into `output`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(())
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the key of a session from the tunnel token, channel and session id
///
/// The input is the plain concatenation `token + channel + session`, so both
/// ends of a session (and every member of a multicast group) derive the
/// same key without any exchange.
pub fn derive_session_key(
    token: &str,
    channel: &str,
    session: &str,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut ikm = Vec::with_capacity(token.len() + channel.len() + session.len());
    ikm.extend_from_slice(token.as_bytes());
    ikm.extend_from_slice(channel.as_bytes());
    ikm.extend_from_slice(session.as_bytes());

    Hkdf::new(None, &ikm).expand_key(SESSION_KEY_INFO)
}
