use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crypto::{self, EncryptedBlob};
use crate::errors::{CacheError, Result};
use crate::key_manager::KeyManager;
use crate::record::{CacheLookup, Namespace, SetOptions, TokenRecord, short_hash};
use crate::secret::SecretProvider;
use crate::store::{Cache, CacheFactory, KNOWN_CACHE_NAMES, ensure_known, entries};

const LOCK_FILE: &str = ".lock";

type Records = HashMap<String, TokenRecord>;

/// JSON file holding every record of one `(cache name, user)` pair
///
/// The file is read lazily on first access and rewritten atomically on every
/// change. A missing, unreadable, or undecryptable file reads as empty.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    lock_path: PathBuf,
    key_manager: Option<Arc<KeyManager>>,
    records: RwLock<Option<Records>>,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_key_manager(path.into(), None)
    }

    fn with_key_manager(path: PathBuf, key_manager: Option<Arc<KeyManager>>) -> Self {
        let lock_path = path
            .parent()
            .map(|dir| dir.join(LOCK_FILE))
            .unwrap_or_else(|| PathBuf::from(LOCK_FILE));
        Self {
            path,
            lock_path,
            key_manager,
            records: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn context(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    async fn load_from_disk(&self) -> Records {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Records::new(),
            Err(e) => {
                warn!("Failed to read cache file {}: {}", self.path.display(), e);
                return Records::new();
            }
        };

        match self.decode(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    "Treating corrupt cache file {} as empty: {}",
                    self.path.display(),
                    e
                );
                Records::new()
            }
        }
    }

    fn decode(&self, content: &[u8]) -> Result<Records> {
        match &self.key_manager {
            Some(key_manager) => {
                let blob: EncryptedBlob = serde_json::from_slice(content)?;
                let plaintext = crypto::decrypt(key_manager.key(), &blob, &self.context())?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
            None => Ok(serde_json::from_slice(content)?),
        }
    }

    fn encode(&self, records: &Records) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(records)?;
        match &self.key_manager {
            Some(key_manager) => {
                let blob = crypto::encrypt(key_manager.key(), &plaintext, &self.context())?;
                Ok(serde_json::to_vec_pretty(&blob)?)
            }
            None => Ok(plaintext),
        }
    }

    /// Atomic write under the directory-wide advisory lock
    async fn persist(&self, records: &Records) -> Result<()> {
        let bytes = self.encode(records)?;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || write_locked(&path, &lock_path, &bytes))
            .await
            .map_err(|e| CacheError::io(&self.path, std::io::Error::other(e)))?
    }

    /// Run `f` against the loaded records and persist the result if it reports a change
    async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Records) -> bool,
    {
        let mut guard = self.records.write().await;
        if guard.is_none() {
            *guard = Some(self.load_from_disk().await);
        }
        let records = guard.get_or_insert_with(Records::new);
        if f(records) {
            self.persist(records).await?;
        }
        Ok(())
    }

    async fn snapshot<T>(&self, f: impl FnOnce(&Records) -> T) -> T {
        {
            let guard = self.records.read().await;
            if let Some(records) = guard.as_ref() {
                return f(records);
            }
        }
        let mut guard = self.records.write().await;
        if guard.is_none() {
            *guard = Some(self.load_from_disk().await);
        }
        f(guard.get_or_insert_with(Records::new))
    }
}

fn write_locked(path: &Path, lock_path: &Path, bytes: &[u8]) -> Result<()> {
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| CacheError::io(lock_path, e))?;
    lock.lock_exclusive().map_err(|e| CacheError::io(lock_path, e))?;

    let temp_path = path.with_extension("tmp");
    let result = (|| {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&temp_path, path)
    })()
    .map_err(|e| CacheError::io(path, e));

    let _ = FileExt::unlock(&lock);
    result
}

#[async_trait::async_trait]
impl Cache for FileCache {
    async fn get(&self, namespace: &Namespace) -> Result<Option<CacheLookup>> {
        let key = namespace.key();
        Ok(self.snapshot(|records| records.get(&key).map(TokenRecord::lookup)).await)
    }

    async fn set(
        &self,
        namespace: &Namespace,
        value: serde_json::Value,
        options: SetOptions,
    ) -> Result<()> {
        self.mutate(|records| {
            entries::set(records, namespace, value, options);
            true
        })
        .await
    }

    async fn invalidate(&self, namespace: &Namespace) -> Result<()> {
        self.mutate(|records| entries::invalidate(records, namespace))
            .await
    }

    async fn reset(&self) -> Result<()> {
        let mut guard = self.records.write().await;
        let records = Records::new();
        self.persist(&records).await?;
        *guard = Some(records);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<()> {
        self.mutate(|records| {
            let removed = entries::cleanup_expired(records);
            if removed > 0 {
                debug!("Evicted {} expired cache entries", removed);
            }
            removed > 0
        })
        .await
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.snapshot(|records| records.is_empty()).await)
    }
}

/// Creates [`FileCache`]s named `<hash(user)>_<cache name>.json` in one directory
///
/// # Directory Structure
/// ```text
/// ~/.cache/tokenchain/
/// ├── meta.json              # Key derivation metadata (encrypted mode)
/// ├── .lock                  # Advisory write lock
/// ├── 1a2b3c_live.json       # Identity tokens for one user
/// └── 1a2b3c_xbl.json        # Xbox tokens for the same user
/// ```
#[derive(Debug, Clone)]
pub struct FileCacheFactory {
    dir: PathBuf,
    key_manager: Option<Arc<KeyManager>>,
}

impl FileCacheFactory {
    /// Plain JSON files
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir).await?;
        debug!("Using cache path: {}", dir.display());
        Ok(Self {
            dir,
            key_manager: None,
        })
    }

    /// Files sealed with AES-256-GCM; the key comes from the OS keyring or a passphrase
    pub async fn encrypted(
        dir: impl AsRef<Path>,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir).await?;
        let key_manager = KeyManager::load(&dir, secret_provider).await?;
        debug!("Using encrypted cache path: {}", dir.display());
        Ok(Self {
            dir,
            key_manager: Some(Arc::new(key_manager)),
        })
    }

    /// Platform cache directory, e.g. `~/.cache/tokenchain` on Linux
    pub fn default_cache_dir() -> Result<PathBuf> {
        let project_dirs =
            directories::ProjectDirs::from("", "", "tokenchain").ok_or(CacheError::NoCacheDir)?;
        Ok(project_dirs.cache_dir().to_path_buf())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_path(&self, cache_name: &str, user: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}.json", short_hash(user), cache_name))
    }

    pub async fn has_cache(&self, cache_name: &str, user: &str) -> bool {
        fs::try_exists(self.cache_path(cache_name, user))
            .await
            .unwrap_or(false)
    }

    pub async fn delete_cache(&self, cache_name: &str, user: &str) -> Result<()> {
        let path = self.cache_path(cache_name, user);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Remove every known cache file of `user`
    pub async fn delete_caches(&self, user: &str) -> Result<()> {
        for cache_name in KNOWN_CACHE_NAMES {
            self.delete_cache(cache_name, user).await?;
        }
        Ok(())
    }

    /// Sweep expired records from every cache file, deleting files left empty
    pub async fn cleanup(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json")
                || path.file_name().and_then(|s| s.to_str()) == Some("meta.json")
            {
                continue;
            }

            let cache = FileCache::with_key_manager(path.clone(), self.key_manager.clone());
            cache.cleanup_expired().await?;
            if cache.is_empty().await? {
                debug!("Removing empty cache file {}", path.display());
                fs::remove_file(&path)
                    .await
                    .map_err(|e| CacheError::io(&path, e))?;
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheFactory for FileCacheFactory {
    async fn create_cache(&self, cache_name: &str, user: &str) -> Result<Arc<dyn Cache>> {
        ensure_known(cache_name)?;
        Ok(Arc::new(FileCache::with_key_manager(
            self.cache_path(cache_name, user),
            self.key_manager.clone(),
        )))
    }
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| CacheError::io(dir, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| CacheError::io(dir, e))?;
    }

    Ok(())
}
