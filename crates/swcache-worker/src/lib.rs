//! # swcache Worker
//!
//! Offline asset cache for a small static web app, driven by a service
//! worker lifecycle.
//!
//! ## Features
//!
//! - **Install**: pre-cache the app manifest into a version-named bucket
//! - **Activate**: delete every bucket but the current one
//! - **Fetch**: stale-while-revalidate, cache first with a background refresh
//! - **Messages**: `SKIP_WAITING` promotes a waiting worker
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost (one scope)
//!     │
//!     ├── installing / waiting / active (ServiceWorker)
//!     │       └── OfflineAssetCache ("{app}-{version}")
//!     └── Clients
//!
//! CacheStore (MemoryStorage | DiskStorage)
//!     └── Cache
//!             └── RequestKey → CacheEntry
//! ```

pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod host;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cache::{Cache, CacheEntry, RequestKey};
pub use config::CacheConfig;
pub use disk::DiskStorage;
pub use error::{ServiceWorkerError, StorageError};
pub use host::{
    Client, ServiceWorker, ServiceWorkerEvent, ServiceWorkerHost, ServiceWorkerId,
    ServiceWorkerState,
};
pub use storage::{CacheStorage, CacheStore, MemoryStorage};
pub use worker::{
    ActivateReport, ControlMessage, FetchOutcome, InstallOutcome, LifecycleSignal,
    OfflineAssetCache, ResponseSource, Revalidation, RevalidationResult, SKIP_WAITING,
};
