//! Test doubles for the network and the store.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::StatusCode;
use swcache_net::{Fetcher, NetError, Request, Response};
use tokio::sync::Notify;

use crate::cache::{CacheEntry, RequestKey};
use crate::error::StorageError;
use crate::storage::{CacheStore, MemoryStorage};

#[derive(Debug, Clone)]
enum Route {
    Respond { status: u16, body: String },
    Fail,
    Hang,
    /// Respond once the paired [`Notify`] fires.
    Gated {
        gate: Arc<Notify>,
        status: u16,
        body: String,
    },
}

/// Answers requests from a table keyed by URL. Unknown URLs fail.
#[derive(Debug, Default)]
pub(crate) struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.route(
            url,
            Route::Respond {
                status,
                body: body.to_string(),
            },
        );
    }

    pub fn fail(&self, url: &str) {
        self.route(url, Route::Fail);
    }

    /// Never answer.
    pub fn hang(&self, url: &str) {
        self.route(url, Route::Hang);
    }

    /// Hold responses for `url` until the returned gate is notified.
    pub fn gate(&self, url: &str, status: u16, body: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.route(
            url,
            Route::Gated {
                gate: Arc::clone(&gate),
                status,
                body: body.to_string(),
            },
        );
        gate
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }

    fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());
        let route = self.routes.lock().unwrap().get(&url).cloned();

        match route {
            Some(Route::Respond { status, body }) => Ok(Response::new(
                request.url.clone(),
                StatusCode::from_u16(status).unwrap(),
                body,
            )),
            Some(Route::Gated { gate, status, body }) => {
                gate.notified().await;
                Ok(Response::new(
                    request.url.clone(),
                    StatusCode::from_u16(status).unwrap(),
                    body,
                ))
            }
            Some(Route::Hang) => std::future::pending().await,
            Some(Route::Fail) | None => {
                Err(NetError::Unreachable(format!("no route to {}", url)))
            }
        }
    }
}

/// Memory store whose deletes or writes fail for chosen bucket names.
pub(crate) struct FlakyStorage {
    inner: Arc<MemoryStorage>,
    undeletable: HashSet<String>,
    unwritable: HashSet<String>,
}

impl FlakyStorage {
    pub fn new(inner: Arc<MemoryStorage>) -> Self {
        Self {
            inner,
            undeletable: HashSet::new(),
            unwritable: HashSet::new(),
        }
    }

    pub fn undeletable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.undeletable.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn unwritable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unwritable.extend(names.into_iter().map(Into::into));
        self
    }

    fn locked(name: &str) -> StorageError {
        StorageError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} is locked", name),
        ))
    }
}

#[async_trait]
impl CacheStore for FlakyStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        if self.undeletable.contains(name) {
            return Err(Self::locked(name));
        }
        self.inner.delete(name).await
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheEntry>, StorageError> {
        self.inner.match_request(key).await
    }

    async fn match_in(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, StorageError> {
        self.inner.match_in(name, key).await
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError> {
        if self.unwritable.contains(name) {
            return Err(Self::locked(name));
        }
        self.inner.put(name, entry).await
    }

    async fn put_if_present(&self, name: &str, entry: CacheEntry) -> Result<bool, StorageError> {
        if self.unwritable.contains(name) {
            return Err(Self::locked(name));
        }
        self.inner.put_if_present(name, entry).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, StorageError> {
        self.inner.entries(name).await
    }
}
