//! Cache storage: named stores of request → response snapshots.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use mimesis_net::{NetError, Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::{Result, ServiceWorkerError};

// ==================== Keys ====================

/// Cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    /// Key for `request`, or `None` when its method can't be cached.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::get(&request.url))
    }
}

// ==================== Entries ====================

/// A stored response snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in received order. Values are raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response type at the time of storing.
    pub response_type: ResponseType,

    /// Whether the response followed redirects.
    pub redirected: bool,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response, consuming its body.
    pub async fn from_response(response: Response) -> std::result::Result<Self, NetError> {
        let url = response.url.to_string();
        let status = response.status;
        let status_text = response.status_text.clone();
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let response_type = response.response_type;
        let redirected = response.redirected;
        let body = response.bytes().await?.to_vec();

        Ok(Self {
            url,
            status,
            status_text,
            headers,
            response_type,
            redirected,
            body,
            cached_at: now_millis(),
        })
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad stored url: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ServiceWorkerError::CacheError(format!("bad stored header: {e}")))?;
            let value = HeaderValue::from_bytes(value).map_err(|e| {
                ServiceWorkerError::CacheError(format!("bad stored value for {name}: {e}"))
            })?;
            headers.append(name, value);
        }

        let mut response = Response::new(url, self.status)
            .with_headers(headers)
            .with_type(self.response_type)
            .with_redirected(self.redirected)
            .with_body(Bytes::from(self.body.clone()));
        response.status_text = self.status_text.clone();
        Ok(response)
    }

    /// Whether two snapshots hold the same response, ignoring when they were taken.
    pub fn same_response(&self, other: &CacheEntry) -> bool {
        self.url == other.url
            && self.status == other.status
            && self.status_text == other.status_text
            && self.headers == other.headers
            && self.response_type == other.response_type
            && self.redirected == other.redirected
            && self.body == other.body
    }

    /// Bytes counted against the storage quota.
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }
}

// ==================== Cache ====================

/// A cache instance.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous one for the key.
    pub fn put(&mut self, key: RequestKey, entry: CacheEntry) -> Option<CacheEntry> {
        trace!(cache = %self.name, url = %key.url, "Cache put");
        self.entries.insert(key, entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<&RequestKey> {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by this cache.
    pub fn size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

// ==================== Cache Storage ====================

/// All cache stores owned by the worker host.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    quota: Option<usize>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage limited to `bytes` across all caches.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            caches: HashMap::new(),
            quota: Some(bytes),
        }
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        let removed = self.caches.remove(name).is_some();
        if removed {
            debug!(cache = %name, "Cache deleted");
        }
        removed
    }

    /// All cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up `key` in the named cache. A missing cache is a miss.
    pub fn match_in(&self, name: &str, key: &RequestKey) -> Option<&CacheEntry> {
        self.caches.get(name)?.match_request(key)
    }

    /// Bytes held across all caches.
    pub fn total_size(&self) -> usize {
        self.caches.values().map(Cache::size).sum()
    }

    /// Store one entry in the named cache.
    pub fn put(&mut self, name: &str, key: RequestKey, entry: CacheEntry) -> Result<()> {
        self.put_all(name, vec![(key, entry)])
    }

    /// Store several entries in the named cache, all or none.
    ///
    /// The quota is checked against the storage size after every replacement
    /// is applied; on failure nothing is written and no cache is created.
    pub fn put_all(&mut self, name: &str, entries: Vec<(RequestKey, CacheEntry)>) -> Result<()> {
        if let Some(quota) = self.quota {
            let existing = self.caches.get(name);
            let mut replaced = 0;
            let mut added = 0;
            let mut seen = hashbrown::HashSet::new();
            for (key, entry) in &entries {
                if seen.insert(key) {
                    replaced += existing
                        .and_then(|c| c.match_request(key))
                        .map_or(0, CacheEntry::size);
                }
                added += entry.size();
            }

            let after = self.total_size() - replaced + added;
            if after > quota {
                return Err(ServiceWorkerError::QuotaExceeded {
                    needed: after,
                    available: quota,
                });
            }
        }

        let cache = self.open(name);
        for (key, entry) in entries {
            cache.put(key, entry);
        }
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
