use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{CacheError, Result};
use crate::record::{CacheLookup, Namespace, SetOptions, TokenRecord, now_ms};

/// Cache names a factory accepts, one per token manager
pub const KNOWN_CACHE_NAMES: &[&str] = &["live", "msal", "sisu", "xbl", "bed", "mca", "mcs", "pfb"];

/// TTL-aware key/value store backing one `(cache name, user)` pair
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Read a record; `valid` reflects the safety margin at call time
    async fn get(&self, namespace: &Namespace) -> Result<Option<CacheLookup>>;

    /// Write a record, overwriting any previous one in place
    async fn set(
        &self,
        namespace: &Namespace,
        value: serde_json::Value,
        options: SetOptions,
    ) -> Result<()>;

    /// Mark a record stale without dropping its value
    async fn invalidate(&self, namespace: &Namespace) -> Result<()>;

    /// Drop every record
    async fn reset(&self) -> Result<()>;

    /// Drop records whose expiry has passed and that hold no refresh token
    async fn cleanup_expired(&self) -> Result<()>;

    async fn is_empty(&self) -> Result<bool>;
}

/// Creates cache handles scoped to a cache name and user identifier
#[async_trait::async_trait]
pub trait CacheFactory: Send + Sync {
    async fn create_cache(&self, cache_name: &str, user: &str) -> Result<Arc<dyn Cache>>;
}

pub(crate) fn ensure_known(cache_name: &str) -> Result<()> {
    if KNOWN_CACHE_NAMES.contains(&cache_name) {
        Ok(())
    } else {
        Err(CacheError::UnknownCacheName(cache_name.to_string()))
    }
}

/// Shared record-map operations used by every backend
pub(crate) mod entries {
    use super::*;

    pub fn set(
        map: &mut HashMap<String, TokenRecord>,
        ns: &Namespace,
        value: serde_json::Value,
        options: SetOptions,
    ) {
        map.insert(ns.key(), TokenRecord::new(value, options));
    }

    pub fn invalidate(map: &mut HashMap<String, TokenRecord>, ns: &Namespace) -> bool {
        match map.get_mut(&ns.key()) {
            Some(record) => {
                record.expires_on = record.expires_on.min(now_ms());
                true
            }
            None => false,
        }
    }

    pub fn cleanup_expired(map: &mut HashMap<String, TokenRecord>) -> usize {
        let now = now_ms();
        let before = map.len();
        map.retain(|_, record| !record.is_expired_at(now) || record.is_renewable());
        before - map.len()
    }
}

/// In-memory cache for tests and short-lived processes
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    records: Arc<RwLock<HashMap<String, TokenRecord>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
    async fn get(&self, namespace: &Namespace) -> Result<Option<CacheLookup>> {
        let records = self.records.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(records.get(&namespace.key()).map(TokenRecord::lookup))
    }

    async fn set(
        &self,
        namespace: &Namespace,
        value: serde_json::Value,
        options: SetOptions,
    ) -> Result<()> {
        let mut records = self.records.write().map_err(|_| CacheError::LockPoisoned)?;
        entries::set(&mut records, namespace, value, options);
        Ok(())
    }

    async fn invalidate(&self, namespace: &Namespace) -> Result<()> {
        let mut records = self.records.write().map_err(|_| CacheError::LockPoisoned)?;
        entries::invalidate(&mut records, namespace);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.records
            .write()
            .map_err(|_| CacheError::LockPoisoned)?
            .clear();
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<()> {
        let mut records = self.records.write().map_err(|_| CacheError::LockPoisoned)?;
        entries::cleanup_expired(&mut records);
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self
            .records
            .read()
            .map_err(|_| CacheError::LockPoisoned)?
            .is_empty())
    }
}

/// Factory handing out one shared [`MemoryCache`] per `(cache name, user)`
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheFactory {
    caches: Arc<RwLock<HashMap<(String, String), MemoryCache>>>,
}

impl MemoryCacheFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CacheFactory for MemoryCacheFactory {
    async fn create_cache(&self, cache_name: &str, user: &str) -> Result<Arc<dyn Cache>> {
        ensure_known(cache_name)?;
        let mut caches = self.caches.write().map_err(|_| CacheError::LockPoisoned)?;
        let cache = caches
            .entry((cache_name.to_string(), user.to_string()))
            .or_default()
            .clone();
        Ok(Arc::new(cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let cache = MemoryCache::new();
        let expires_on = now_ms() + 60_000;
        cache
            .set(
                &Namespace::Java,
                json!({"access_token": "mc"}),
                SetOptions::expiring_at(expires_on),
            )
            .await
            .unwrap();

        let lookup = cache.get(&Namespace::Java).await.unwrap().unwrap();
        assert_eq!(lookup.value, json!({"access_token": "mc"}));
        assert!(lookup.valid);
        assert_eq!(lookup.expires_on, expires_on);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let cache = MemoryCache::new();
        assert!(cache.get(&Namespace::Identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_reads_invalid() {
        let cache = MemoryCache::new();
        cache
            .set(&Namespace::XboxUser, json!("ut"), SetOptions::expiring_at(now_ms() - 10))
            .await
            .unwrap();
        let lookup = cache.get(&Namespace::XboxUser).await.unwrap().unwrap();
        assert!(!lookup.valid);
    }

    #[tokio::test]
    async fn test_invalidate_keeps_value() {
        let cache = MemoryCache::new();
        cache
            .set(&Namespace::Identity, json!({"refresh_token": "rt"}), SetOptions::default())
            .await
            .unwrap();
        cache.invalidate(&Namespace::Identity).await.unwrap();

        let lookup = cache.get(&Namespace::Identity).await.unwrap().unwrap();
        assert!(!lookup.valid);
        assert_eq!(lookup.value["refresh_token"], "rt");
    }

    #[tokio::test]
    async fn test_cleanup_and_reset() {
        let cache = MemoryCache::new();
        cache
            .set(&Namespace::Bedrock, json!(1), SetOptions::expiring_at(now_ms() - 1))
            .await
            .unwrap();
        cache
            .set(&Namespace::Session, json!(2), SetOptions::default())
            .await
            .unwrap();

        cache.cleanup_expired().await.unwrap();
        assert!(cache.get(&Namespace::Bedrock).await.unwrap().is_none());
        assert!(cache.get(&Namespace::Session).await.unwrap().is_some());

        cache.reset().await.unwrap();
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_factory_shares_handles_and_rejects_unknown_names() {
        let factory = MemoryCacheFactory::new();
        let a = factory.create_cache("xbl", "steve").await.unwrap();
        let b = factory.create_cache("xbl", "steve").await.unwrap();
        let other = factory.create_cache("xbl", "alex").await.unwrap();

        a.set(&Namespace::XboxDevice, json!("dt"), SetOptions::default())
            .await
            .unwrap();
        assert!(b.get(&Namespace::XboxDevice).await.unwrap().is_some());
        assert!(other.get(&Namespace::XboxDevice).await.unwrap().is_none());

        let result = factory.create_cache("bogus", "steve").await;
        assert!(matches!(result, Err(CacheError::UnknownCacheName(_))));
    }
}
