//! The offline asset cache: install, activate, fetch and message handlers.

use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use hashbrown::HashSet;
use http::{Method, StatusCode};
use serde_json::Value as JsonValue;
use swcache_net::{Fetcher, Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheEntry, RequestKey};
use crate::config::CacheConfig;
use crate::error::{ServiceWorkerError, StorageError};
use crate::storage::CacheStore;

/// Control message `type` that asks a waiting worker to activate now.
pub const SKIP_WAITING: &str = "SKIP_WAITING";

/// What a handler asks of the lifecycle host once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// Activate without waiting for existing clients to go away.
    SkipWaiting,
    /// Take control of all existing clients right after activation.
    ClaimClients,
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub bucket: String,
    /// Distinct request keys written.
    pub cached: usize,
    pub signal: LifecycleSignal,
}

/// Result of activation cleanup.
#[derive(Debug)]
pub struct ActivateReport {
    /// The bucket that was kept.
    pub current: String,
    pub deleted: Vec<String>,
    /// Buckets whose deletion failed; the rest were still processed.
    pub failed: Vec<(String, StorageError)>,
    pub signal: LifecycleSignal,
}

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// How a background revalidation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationResult {
    /// The current bucket now holds the fresh response.
    Updated,
    /// The network answered with something other than 200; nothing stored.
    Skipped(StatusCode),
    /// The bucket was deleted before the answer arrived; nothing stored.
    Discarded,
    /// The network or the store failed; the cached copy stays as it was.
    Failed,
}

/// Handle to a background revalidation task.
///
/// Dropping it does not cancel the task. The fetch path never awaits it.
#[derive(Debug)]
pub struct Revalidation {
    handle: JoinHandle<RevalidationResult>,
}

impl Revalidation {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task. `None` if it panicked or was aborted.
    pub async fn settled(self) -> Option<RevalidationResult> {
        self.handle.await.ok()
    }
}

/// A response plus what produced it.
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: ResponseSource,
    /// Present on cache hits.
    pub revalidation: Option<Revalidation>,
}

impl FetchOutcome {
    fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
            revalidation: None,
        }
    }
}

/// Parsed control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    SkipWaiting,
}

impl ControlMessage {
    /// Recognize a message by its `type` field. Anything else is `None`.
    pub fn parse(message: &JsonValue) -> Option<Self> {
        match message.get("type").and_then(JsonValue::as_str) {
            Some(SKIP_WAITING) => Some(Self::SkipWaiting),
            _ => None,
        }
    }
}

/// Stale-while-revalidate cache for one app version.
pub struct OfflineAssetCache {
    config: CacheConfig,
    bucket: String,
    storage: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl fmt::Debug for OfflineAssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineAssetCache")
            .field("version", &self.config.version)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl OfflineAssetCache {
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let bucket = config.bucket_name();
        Ok(Self {
            config,
            bucket,
            storage,
            fetcher,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Name of the bucket this version reads from and writes to.
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// Install handler: fetch the whole manifest into the current bucket.
    ///
    /// Any transport failure or non-2xx answer fails the install. Entries
    /// already written stay written.
    pub async fn install(&self) -> Result<InstallOutcome, ServiceWorkerError> {
        let urls = self.config.manifest_urls()?;
        info!(
            version = %self.config.version,
            bucket = %self.bucket,
            assets = urls.len(),
            "Service worker installing"
        );

        self.storage.open(&self.bucket).await?;

        let fetched = try_join_all(urls.into_iter().map(|url| async move {
            let request = Request::get(url);
            let response = self.fetcher.fetch(&request).await.map_err(|e| {
                ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok((RequestKey::from_request(&request), response))
        }))
        .await;

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(version = %self.config.version, error = %e, "Install failed");
                return Err(e);
            }
        };

        for (key, response) in &fetched {
            self.storage
                .put(&self.bucket, CacheEntry::capture(key, response))
                .await?;
            debug!(bucket = %self.bucket, key = %key, "Cached asset");
        }

        let cached = fetched
            .iter()
            .map(|(key, _)| key)
            .collect::<HashSet<_>>()
            .len();
        info!(version = %self.config.version, cached, "Service worker installed");

        Ok(InstallOutcome {
            bucket: self.bucket.clone(),
            cached,
            signal: LifecycleSignal::SkipWaiting,
        })
    }

    /// Activate handler: delete every bucket except the current one.
    ///
    /// Deletions run independently; failures are collected, not propagated.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        info!(version = %self.config.version, "Service worker activating");

        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != &self.bucket)
            .collect();

        let results = join_all(stale.into_iter().map(|name| async move {
            let result = self.storage.delete(&name).await;
            (name, result)
        }))
        .await;

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(_) => {
                    info!(bucket = %name, "Deleted old cache");
                    deleted.push(name);
                }
                Err(e) => {
                    warn!(bucket = %name, error = %e, "Failed to delete old cache");
                    failed.push((name, e));
                }
            }
        }

        Ok(ActivateReport {
            current: self.bucket.clone(),
            deleted,
            failed,
            signal: LifecycleSignal::ClaimClients,
        })
    }

    /// Fetch handler: cache first, revalidate in the background.
    ///
    /// Only GET requests touch the cache; other methods go straight to the
    /// network. A miss awaits the network and stores a 200 answer before
    /// returning it. A network failure on a miss is the caller's error.
    ///
    /// Writes from this path never recreate the bucket: once a newer version
    /// has deleted it, late answers are dropped.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Bypassing cache");
            return Ok(FetchOutcome::network(self.fetcher.fetch(&request).await?));
        }

        let key = RequestKey::from_request(&request);

        match self.lookup(&key).await {
            Some(cached) => {
                trace!(key = %key, "Cache hit");
                let revalidation = self.spawn_revalidation(request, key);
                Ok(FetchOutcome {
                    response: cached,
                    source: ResponseSource::Cache,
                    revalidation: Some(revalidation),
                })
            }
            None => {
                trace!(key = %key, "Cache miss");
                let response = self.fetcher.fetch(&request).await?;
                if response.status == StatusCode::OK {
                    match self
                        .storage
                        .put_if_present(&self.bucket, CacheEntry::capture(&key, &response))
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(key = %key, bucket = %self.bucket, "Bucket gone, not caching")
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to cache network response")
                        }
                    }
                }
                Ok(FetchOutcome::network(response))
            }
        }
    }

    /// Message handler.
    pub fn handle_message(&self, message: &JsonValue) -> Option<LifecycleSignal> {
        match ControlMessage::parse(message) {
            Some(ControlMessage::SkipWaiting) => {
                debug!(version = %self.config.version, "Skip waiting requested");
                Some(LifecycleSignal::SkipWaiting)
            }
            None => {
                trace!(?message, "Ignoring message");
                None
            }
        }
    }

    /// Look `key` up across all buckets. Store failures and unreadable
    /// entries count as a miss.
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let entry = match self.storage.match_request(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                return None;
            }
        };
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    fn spawn_revalidation(&self, request: Request, key: RequestKey) -> Revalidation {
        let storage = Arc::clone(&self.storage);
        let fetcher = Arc::clone(&self.fetcher);
        let bucket = self.bucket.clone();

        let handle = tokio::spawn(async move {
            let response = match fetcher.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(key = %key, error = %e, "Background revalidation failed");
                    return RevalidationResult::Failed;
                }
            };

            if response.status != StatusCode::OK {
                trace!(key = %key, status = %response.status, "Revalidation not stored");
                return RevalidationResult::Skipped(response.status);
            }

            match storage
                .put_if_present(&bucket, CacheEntry::capture(&key, &response))
                .await
            {
                Ok(true) => {
                    trace!(key = %key, bucket = %bucket, "Revalidated");
                    RevalidationResult::Updated
                }
                Ok(false) => {
                    debug!(key = %key, bucket = %bucket, "Bucket gone, dropping revalidation");
                    RevalidationResult::Discarded
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Failed to store revalidated response");
                    RevalidationResult::Failed
                }
            }
        });

        Revalidation { handle }
    }
}
