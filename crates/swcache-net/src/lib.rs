//! # swcache Net
//!
//! Request and response types plus the network seam used by the offline cache.
//!
//! ## Design Goals
//!
//! 1. **One request shape**: the same [`Request`] flows through cache lookup
//!    and network fetch
//! 2. **Buffered responses**: bodies are fully read so a response can be both
//!    returned and stored
//! 3. **Swappable transport**: anything implementing [`Fetcher`] can stand in
//!    for the network

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{LoaderConfig, NetworkFetcher};

/// Why a fetch produced no usable response.
///
/// An HTTP error status is not a `NetError`; it arrives as a normal
/// [`Response`].
#[derive(Error, Debug)]
pub enum NetError {
    /// The client could not be built.
    #[error("Client setup failed: {0}")]
    Setup(String),

    /// No response was obtained (offline, refused, reset).
    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The body is not what the caller asked for.
    #[error("Body error: {0}")]
    Body(String),
}

/// Per-process request sequence number, for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::next(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse `url` and create a GET request for it.
    pub fn get_str(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL (after redirects).
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Create a response with no headers.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Check if the request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }
}

/// Something that can turn a [`Request`] into a [`Response`].
///
/// A returned `Ok` carries any HTTP status; `Err` means no response was
/// obtained at all.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
