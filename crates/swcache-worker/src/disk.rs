//! Persistent [`CacheStore`] keeping one JSON file per bucket.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{BucketFile, Cache, CacheEntry, RequestKey};
use crate::error::StorageError;
use crate::storage::{CacheStorage, CacheStore};

/// Buckets mirrored in memory and written through to `root`.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    inner: RwLock<CacheStorage>,
}

impl DiskStorage {
    /// Open (creating if needed) a storage directory and load its buckets.
    ///
    /// Files that cannot be read or parsed are skipped with a warning.
    /// Temp files left by an interrupted write are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut loaded = Vec::new();
        let mut dir = fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {}
                Some("tmp") if path.to_string_lossy().ends_with(".json.tmp") => {
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                    }
                    continue;
                }
                _ => continue,
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            match serde_json::from_slice::<BucketFile>(&bytes) {
                Ok(file) => loaded.push(Cache::from(file)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache file")
                }
            }
        }

        loaded.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));

        let mut storage = CacheStorage::new();
        let count = loaded.len();
        for cache in loaded {
            storage.insert(cache);
        }

        info!(root = %root.display(), buckets = count, "Opened disk cache storage");

        Ok(Self {
            root,
            inner: RwLock::new(storage),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", urlencoding::encode(name)))
    }

    async fn write_bucket(&self, cache: &Cache) -> Result<(), StorageError> {
        let json = serde_json::to_vec(&BucketFile::from(cache))?;
        let path = self.path_for(&cache.name);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, json).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(bucket = %cache.name, entries = cache.len(), "Bucket written");
        Ok(())
    }

    /// Put `entry` and write its bucket through. On a failed write the
    /// in-memory bucket is put back the way it was.
    async fn put_locked(
        &self,
        inner: &mut CacheStorage,
        name: &str,
        entry: CacheEntry,
    ) -> Result<(), StorageError> {
        let existed = inner.has(name);
        let key = entry.key();

        let cache = inner.open(name);
        let previous = cache.put(entry);
        let snapshot = cache.clone();

        if let Err(e) = self.write_bucket(&snapshot).await {
            if !existed {
                inner.delete(name);
            } else if let Some(cache) = inner.get_mut(name) {
                match previous {
                    Some(previous) => {
                        cache.put(previous);
                    }
                    None => {
                        cache.delete(&key);
                    }
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if inner.has(name) {
            return Ok(());
        }

        let cache = inner.open(name).clone();
        if let Err(e) = self.write_bucket(&cache).await {
            inner.delete(name);
            return Err(e);
        }
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
        let mut inner = self.inner.write().await;
        if !inner.has(name) {
            return Ok(false);
        }

        match fs::remove_file(self.path_for(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(inner.delete(name))
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
        let mut inner = self.inner.write().await;
        self.put_locked(&mut inner, name, entry).await
    }

    async fn put_if_present(&self, name: &str, entry: CacheEntry) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.has(name) {
            return Ok(false);
        }
        self.put_locked(&mut inner, name, entry).await?;
        Ok(true)
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

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use swcache_net::Response;
    use url::Url;

    fn entry(u: &str, body: &str) -> CacheEntry {
        let url = Url::parse(u).unwrap();
        let response = Response::new(url.clone(), StatusCode::OK, body.to_string());
        CacheEntry::capture(&RequestKey::get(&url), &response)
    }

    fn key(u: &str) -> RequestKey {
        RequestKey::get(&Url::parse(u).unwrap())
    }

    #[tokio::test]
    async fn test_disk_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let storage = DiskStorage::open(dir.path()).await.unwrap();
            storage
                .put("cache-v1", entry("https://example.com/", "index"))
                .await
                .unwrap();
            storage
                .put("cache-v1", entry("https://example.com/app.html", "app"))
                .await
                .unwrap();
        }

        let storage = DiskStorage::open(dir.path()).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["cache-v1".to_string()]);
        let hit = storage
            .match_request(&key("https://example.com/app.html"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, b"app");
        assert_eq!(storage.entries("cache-v1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disk_storage_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();

        storage.open("mtg-life-counter-v1.14").await.unwrap();

        assert!(dir.path().join("mtg-life-counter-v1.14.json").exists());
        assert!(storage.has("mtg-life-counter-v1.14").await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_storage_encodes_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();

        storage.open("../escape").await.unwrap();

        assert!(dir.path().join("..%2Fescape.json").exists());
        let reopened = DiskStorage::open(dir.path()).await.unwrap();
        assert!(reopened.has("../escape").await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_storage_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();
        storage.open("cache-v1").await.unwrap();

        assert!(storage.delete("cache-v1").await.unwrap());
        assert!(!dir.path().join("cache-v1.json").exists());
        assert!(!storage.delete("cache-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_storage_delete_failure_keeps_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();
        storage.open("cache-v1").await.unwrap();

        // A directory where the file should be makes remove_file fail.
        let path = dir.path().join("cache-v1.json");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(storage.delete("cache-v1").await.is_err());
        assert!(storage.has("cache-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_storage_skips_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.json"), b"not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::create_dir(dir.path().join("folder.json")).unwrap();

        let storage = DiskStorage::open(dir.path()).await.unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_disk_storage_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = DiskStorage::open(dir.path()).await.unwrap();
            storage
                .put("cache-v1", entry("https://example.com/", "index"))
                .await
                .unwrap();
        }
        let stale = dir.path().join("cache-v1.json.tmp");
        std::fs::write(&stale, b"{\"half\":").unwrap();

        let storage = DiskStorage::open(dir.path()).await.unwrap();

        assert!(!stale.exists());
        assert_eq!(storage.entries("cache-v1").await.unwrap().len(), 1);
    }

    /// Make the next write of `name` fail by putting a directory where its
    /// file goes.
    fn block_bucket_file(dir: &Path, name: &str) {
        let path = dir.join(format!("{}.json", name));
        if path.exists() {
            std::fs::remove_file(&path).unwrap();
        }
        std::fs::create_dir(&path).unwrap();
    }

    #[tokio::test]
    async fn test_disk_storage_failed_put_restores_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();
        storage
            .put("cache-v1", entry("https://example.com/", "old"))
            .await
            .unwrap();
        block_bucket_file(dir.path(), "cache-v1");

        assert!(storage
            .put("cache-v1", entry("https://example.com/", "new"))
            .await
            .is_err());
        assert!(storage
            .put("cache-v1", entry("https://example.com/app.html", "app"))
            .await
            .is_err());

        let kept = storage
            .match_in("cache-v1", &key("https://example.com/"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.body, b"old");
        assert!(storage
            .match_in("cache-v1", &key("https://example.com/app.html"))
            .await
            .unwrap()
            .is_none());
        assert!(!dir.path().join("cache-v1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_disk_storage_failed_put_drops_new_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();
        block_bucket_file(dir.path(), "cache-v9");

        assert!(storage
            .put("cache-v9", entry("https://example.com/", "x"))
            .await
            .is_err());
        assert!(!storage.has("cache-v9").await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_storage_put_if_present() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();

        assert!(!storage
            .put_if_present("cache-v1", entry("https://example.com/", "x"))
            .await
            .unwrap());
        assert!(!dir.path().join("cache-v1.json").exists());

        storage.open("cache-v1").await.unwrap();
        assert!(storage
            .put_if_present("cache-v1", entry("https://example.com/", "x"))
            .await
            .unwrap());

        let reopened = DiskStorage::open(dir.path()).await.unwrap();
        assert_eq!(reopened.entries("cache-v1").await.unwrap().len(), 1);
    }
}
