use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::errors::{CacheError, Result};

const NONCE_LEN: usize = 12;
const AAD_VERSION: &str = "v1";

/// AES-256 key sealing cache files at rest
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        getrandom::fill(&mut key).map_err(|e| CacheError::Crypto(format!("RNG failure: {e}")))?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// On-disk envelope of an encrypted cache file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Base64url nonce (12 bytes)
    pub nonce: String,
    /// Base64url ciphertext + tag
    pub ciphertext: String,
    pub aad_version: String,
}

fn aad(version: &str, context: &str) -> String {
    format!("tc-cache|{version}|{context}")
}

/// Seal `plaintext` with AES-256-GCM, binding it to `context` (the cache file stem)
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], context: &str) -> Result<EncryptedBlob> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CacheError::Crypto(format!("Invalid key: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce_bytes).map_err(|e| CacheError::Crypto(format!("RNG failure: {e}")))?;

    let aad = aad(AAD_VERSION, context);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| CacheError::Crypto(format!("Encryption failed: {e}")))?;

    Ok(EncryptedBlob {
        nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        aad_version: AAD_VERSION.to_string(),
    })
}

pub fn decrypt(key: &EncryptionKey, blob: &EncryptedBlob, context: &str) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CacheError::Crypto(format!("Invalid key: {e}")))?;

    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(&blob.nonce)
        .map_err(|_| CacheError::Corrupted)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CacheError::Corrupted);
    }

    let ciphertext = URL_SAFE_NO_PAD
        .decode(&blob.ciphertext)
        .map_err(|_| CacheError::Corrupted)?;

    let aad = aad(&blob.aad_version, context);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CacheError::Corrupted)
}
