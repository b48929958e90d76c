//! Error types for the offline cache.

use swcache_net::NetError;
use thiserror::Error;

/// Errors surfaced by the offline cache and its lifecycle host.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    /// A manifest asset could not be fetched during install.
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    /// The network failed on a cache miss.
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(String),

    /// The worker's deployment root lies outside the host scope.
    #[error("Security error: {base} is outside scope {scope}")]
    OutOfScope { base: String, scope: String },
}

impl ServiceWorkerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Errors from a cache store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored entry cannot be turned back into a response.
    #[error("Corrupt entry: {0}")]
    Corrupt(String),
}
