//! Cache buckets and their entries.

use std::fmt;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use swcache_net::{Request, Response};
use url::Url;

use crate::error::StorageError;

/// Identity of a cached request: method plus URL without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// GET key for `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A captured response, stored under its request key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (fragment removed).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeats allowed.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture `response` for `key`.
    pub fn capture(key: &RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: swcache_common::unix_millis(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild the response this entry was captured from.
    pub fn to_response(&self) -> Result<Response, StorageError> {
        let url = Url::parse(&self.url)
            .map_err(|e| StorageError::Corrupt(format!("{}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|_| StorageError::Corrupt(format!("{}: status {}", self.url, self.status)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", self.url, e)))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", self.url, e)))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status,
            headers,
            body: Bytes::from(self.body.clone()),
        })
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A named bucket of cached responses.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Creation timestamp (ms since epoch).
    pub created_at: u64,

    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create a new, empty cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: swcache_common::unix_millis(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, returning the one it replaced.
    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key(), entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// On-disk shape of a bucket.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BucketFile {
    pub name: String,
    pub created_at: u64,
    pub entries: Vec<CacheEntry>,
}

impl From<&Cache> for BucketFile {
    fn from(cache: &Cache) -> Self {
        let mut entries: Vec<CacheEntry> = cache.entries().cloned().collect();
        entries.sort_by(|a, b| (&a.url, &a.method).cmp(&(&b.url, &b.method)));
        Self {
            name: cache.name.clone(),
            created_at: cache.created_at,
            entries,
        }
    }
}

impl From<BucketFile> for Cache {
    fn from(file: BucketFile) -> Self {
        let mut cache = Cache {
            name: file.name,
            created_at: file.created_at,
            entries: HashMap::new(),
        };
        for entry in file.entries {
            cache.put(entry);
        }
        cache
    }
}
