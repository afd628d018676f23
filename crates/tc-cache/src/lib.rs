//! TTL-aware token cache for the tokenchain credential engine
//!
//! Every token manager owns one [`Cache`] handle scoped to a cache name and a
//! user identifier. Records carry an absolute expiry and are only reported as
//! valid while `now + 1000 ms < expiresOn`, so a token is never handed out in
//! the instant before it lapses.
//!
//! Three interchangeable backends are provided:
//!
//! - [`MemoryCache`] / [`MemoryCacheFactory`] for tests and short-lived processes
//! - [`FileCache`] / [`FileCacheFactory::new`] writing plain JSON files
//! - [`FileCacheFactory::encrypted`] sealing those files with AES-256-GCM, the key
//!   held in the OS keyring with an Argon2id passphrase fallback
//!
//! ```
//! use tc_cache::{Cache, CacheFactory, MemoryCacheFactory, Namespace, SetOptions};
//!
//! # async fn example() -> Result<(), tc_cache::CacheError> {
//! let factory = MemoryCacheFactory::new();
//! let cache = factory.create_cache("xbl", "player@example.com").await?;
//!
//! cache
//!     .set(&Namespace::XboxDevice, serde_json::json!({"Token": "dt"}), SetOptions::default())
//!     .await?;
//!
//! let lookup = cache.get(&Namespace::XboxDevice).await?.expect("just written");
//! assert!(lookup.valid);
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod errors;
pub mod file_store;
pub mod key_manager;
pub mod record;
pub mod secret;
pub mod store;

pub use errors::{CacheError, Result};
pub use file_store::{FileCache, FileCacheFactory};
pub use record::{
    CacheLookup, DEFAULT_HORIZON_MS, Namespace, SAFETY_MARGIN_MS, SetOptions, TokenRecord, now_ms,
    short_hash,
};
pub use secret::{NoSecretProvider, SecretProvider, StaticSecretProvider};
pub use store::{Cache, CacheFactory, KNOWN_CACHE_NAMES, MemoryCache, MemoryCacheFactory};
