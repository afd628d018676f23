use std::path::Path;
use std::sync::Arc;

use argon2::{Argon2, Params};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::EncryptionKey;
use crate::errors::{CacheError, Result};
use crate::secret::SecretProvider;

const SALT_LEN: usize = 32;
const META_FILE: &str = "meta.json";
#[cfg(feature = "keyring-support")]
const KEYRING_SERVICE: &str = "tokenchain";

/// Key-derivation metadata stored beside the cache files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMeta {
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Base64 Argon2id salt, present once a passphrase key was derived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase_salt: Option<String>,
}

impl Default for KeyMeta {
    fn default() -> Self {
        Self {
            version: 1,
            created_at: chrono::Utc::now(),
            passphrase_salt: None,
        }
    }
}

/// Resolves the cache encryption key: OS keyring first, passphrase fallback
pub struct KeyManager {
    key: EncryptionKey,
}

impl KeyManager {
    pub async fn load(cache_dir: &Path, secret_provider: Arc<dyn SecretProvider>) -> Result<Self> {
        let meta_path = cache_dir.join(META_FILE);
        let mut meta = match fs::read_to_string(&meta_path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring unreadable {}: {}", meta_path.display(), e);
                KeyMeta::default()
            }),
            Err(_) => KeyMeta::default(),
        };

        let key = match Self::load_from_keyring(cache_dir) {
            Ok(key) => {
                debug!("Loaded cache encryption key from OS keyring");
                key
            }
            Err(e) => {
                debug!("Keyring unavailable ({}), using passphrase fallback", e);
                let key = Self::derive_from_passphrase(&mut meta, secret_provider.as_ref()).await?;
                if let Err(e) = Self::save_to_keyring(cache_dir, &key) {
                    warn!("Failed to save cache key to keyring: {}", e);
                }
                key
            }
        };

        let meta_json = serde_json::to_string_pretty(&meta)?;
        fs::write(&meta_path, meta_json)
            .await
            .map_err(|e| CacheError::io(&meta_path, e))?;

        Ok(Self { key })
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    #[cfg(feature = "keyring-support")]
    fn keyring_entry(cache_dir: &Path) -> Result<keyring::Entry> {
        let account = format!("cache:{}", crate::record::short_hash(&cache_dir.to_string_lossy()));
        keyring::Entry::new(KEYRING_SERVICE, &account)
            .map_err(|e| CacheError::Keyring(format!("Failed to access keyring: {e}")))
    }

    #[cfg(feature = "keyring-support")]
    fn load_from_keyring(cache_dir: &Path) -> Result<EncryptionKey> {
        let encoded = Self::keyring_entry(cache_dir)?
            .get_password()
            .map(Zeroizing::new)
            .map_err(|e| CacheError::Keyring(format!("Failed to read from keyring: {e}")))?;

        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(|_| CacheError::Corrupted)?,
        );
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| CacheError::Corrupted)?;
        Ok(EncryptionKey::from_bytes(key))
    }

    #[cfg(not(feature = "keyring-support"))]
    fn load_from_keyring(_cache_dir: &Path) -> Result<EncryptionKey> {
        Err(CacheError::Keyring("keyring support disabled".to_string()))
    }

    #[cfg(feature = "keyring-support")]
    fn save_to_keyring(cache_dir: &Path, key: &EncryptionKey) -> Result<()> {
        let encoded = Zeroizing::new(STANDARD.encode(key.as_bytes()));
        Self::keyring_entry(cache_dir)?
            .set_password(&encoded)
            .map_err(|e| CacheError::Keyring(format!("Failed to write to keyring: {e}")))
    }

    #[cfg(not(feature = "keyring-support"))]
    fn save_to_keyring(_cache_dir: &Path, _key: &EncryptionKey) -> Result<()> {
        Ok(())
    }

    /// Argon2id, m=64MiB t=3 p=1
    async fn derive_from_passphrase(
        meta: &mut KeyMeta,
        secret_provider: &dyn SecretProvider,
    ) -> Result<EncryptionKey> {
        let salt = match &meta.passphrase_salt {
            Some(encoded) => STANDARD.decode(encoded).map_err(|_| CacheError::Corrupted)?,
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                getrandom::fill(&mut salt)
                    .map_err(|e| CacheError::Crypto(format!("RNG failure: {e}")))?;
                meta.passphrase_salt = Some(STANDARD.encode(&salt));
                salt
            }
        };

        let passphrase = secret_provider
            .get_passphrase("Enter passphrase for the token cache")
            .await
            .ok_or(CacheError::PassphraseCancelled)?;

        let params = Params::new(65536, 3, 1, Some(32))
            .map_err(|e| CacheError::Crypto(format!("Invalid Argon2 params: {e}")))?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| CacheError::Crypto(format!("Key derivation failed: {e}")))?;

        Ok(EncryptionKey::from_bytes(key))
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
