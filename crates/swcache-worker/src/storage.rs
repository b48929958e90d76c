//! Cache storage: the `caches` global.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::cache::{Cache, CacheEntry, RequestKey};
use crate::error::StorageError;

/// Named buckets of cached responses.
///
/// Every method is atomic with respect to the others. Bucket order is
/// creation order and decides which bucket wins a cross-bucket match.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Open a bucket, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), StorageError>;

    async fn has(&self, name: &str) -> Result<bool, StorageError>;

    /// All bucket names in creation order.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Delete a bucket. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;

    /// Match a request across all buckets; the oldest bucket wins.
    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheEntry>, StorageError>;

    /// Match a request in one bucket.
    async fn match_in(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, StorageError>;

    /// Store an entry, creating the bucket if absent and replacing any entry
    /// with the same key.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError>;

    /// Store an entry only if the bucket still exists. Returns whether it
    /// was stored. The check and the write are one atomic step, so a bucket
    /// deleted concurrently is never recreated.
    async fn put_if_present(&self, name: &str, entry: CacheEntry) -> Result<bool, StorageError>;

    /// All entries of a bucket; empty if the bucket does not exist.
    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, StorageError>;
}

// ==================== Cache Storage ====================

/// In-memory set of buckets. Not synchronized; the stores wrap it in a lock.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    order: Vec<String>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Insert a whole bucket, e.g. one loaded from disk.
    pub fn insert(&mut self, cache: Cache) {
        if !self.caches.contains_key(&cache.name) {
            self.order.push(cache.name.clone());
        }
        self.caches.insert(cache.name.clone(), cache);
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Get all cache names in creation order.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match across all caches.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(key))
    }
}

// ==================== Memory Store ====================

/// Volatile [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<CacheStorage>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        self.inner.write().await.open(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.inner.read().await.has(name))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .keys()
            .into_iter()
            .map(String::from)
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.inner.write().await.delete(name))
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.inner.read().await.match_request(key).cloned())
    }

    async fn match_in(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.inner.write().await.open(name).put(entry);
        Ok(())
    }

    async fn put_if_present(&self, name: &str, entry: CacheEntry) -> Result<bool, StorageError> {
        match self.inner.write().await.get_mut(name) {
            Some(cache) => {
                cache.put(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .get(name)
            .map(|cache| cache.entries().cloned().collect())
            .unwrap_or_default())
    }
}
