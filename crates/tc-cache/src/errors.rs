use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by cache backends
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cannot instantiate cache for unknown cache name '{0}'")]
    UnknownCacheName(String),

    #[error("Cache I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Encrypted cache data is corrupted or was sealed with another key")]
    Corrupted,

    #[error("Passphrase entry was cancelled")]
    PassphraseCancelled,

    #[error("Could not determine a cache directory for this platform")]
    NoCacheDir,
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
