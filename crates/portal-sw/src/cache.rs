//! Versioned cache store.
//!
//! ```text
//! CacheStorage (all generations, one backend)
//!     └── Cache "portal-cache-v2"
//!             └── CacheKey → CachedResponse
//! ```
//!
//! Backends guarantee atomic point reads and writes only. Two requests that
//! race on the same key both write; whichever lands last wins.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use portal_net::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::error::CacheError;

// ==================== Keys and entries ====================

/// Identifies a cached request: method, URL and the configured key headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
    /// Lowercased `(name, value)` pairs, sorted by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vary: Vec<(String, String)>,
}

impl CacheKey {
    /// Key for a plain GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET.to_string(),
            url: url.to_string(),
            vary: Vec::new(),
        }
    }

    /// Key for `request`, capturing the values of `key_headers`.
    pub fn for_request(request: &Request, key_headers: &[String]) -> Self {
        let mut vary: Vec<(String, String)> = key_headers
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .filter_map(|name| {
                let value = request.headers.get(name.as_str())?.to_str().ok()?.to_string();
                Some((name, value))
            })
            .collect();
        vary.sort();
        vary.dedup_by(|a, b| a.0 == b.0);

        Self {
            method: request.method.to_string(),
            url: request.url.to_string(),
            vary,
        }
    }

    /// Same method and URL with no header values. Precached entries are
    /// stored under this form.
    pub fn without_vary(&self) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            vary: Vec::new(),
        }
    }

    /// Whether entries under this key may be stored.
    pub fn is_storable(&self) -> bool {
        self.method == Method::GET.as_str()
    }

    /// Flat string form used as the primary key by backends.
    pub fn storage_key(&self) -> String {
        let mut key = format!("{} {}", self.method, self.url);
        for (name, value) in &self.vary {
            key.push('|');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A response captured at the time it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Capture time, ms since epoch.
    pub cached_at: i64,
}

impl CachedResponse {
    /// Capture a response, consuming it. Pass a duplicate if the response is
    /// also handed to a caller.
    pub fn capture(response: Response) -> Self {
        let url = response.url.to_string();
        let status = response.status.as_u16();
        let status_text = response.status_text.clone();
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().to_vec();

        Self {
            url,
            status,
            status_text,
            headers,
            body,
            cached_at: Utc::now().timestamp_millis(),
        }
    }

    /// Rebuild a live response from the stored capture.
    pub fn into_response(self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::Storage(format!("bad stored url {}: {e}", self.url)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| CacheError::Storage(format!("bad stored status {}: {e}", self.status)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response::new(url, status, headers, self.body).with_status_text(self.status_text))
    }
}

// ==================== Backend ====================

/// Storage primitive behind [`CacheStorage`].
///
/// Every method is an independent point operation; no ordering is promised
/// between concurrent calls.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the named cache if it does not exist.
    async fn open(&self, cache: &str) -> Result<(), CacheError>;

    /// Whether the named cache exists.
    async fn has(&self, cache: &str) -> Result<bool, CacheError>;

    /// Delete the named cache and every entry in it.
    async fn delete_cache(&self, cache: &str) -> Result<bool, CacheError>;

    /// Names of all caches, sorted.
    async fn cache_names(&self) -> Result<Vec<String>, CacheError>;

    /// Point lookup.
    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError>;

    /// Point write; overwrites any existing entry. Creates the cache if needed.
    async fn put(&self, cache: &str, key: &CacheKey, entry: CachedResponse) -> Result<(), CacheError>;

    /// Delete one entry.
    async fn delete(&self, cache: &str, key: &CacheKey) -> Result<bool, CacheError>;

    /// All keys in the named cache, sorted by storage key.
    async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>, CacheError>;
}

type MemoryCache = HashMap<String, (CacheKey, CachedResponse)>;

/// In-process backend; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    caches: RwLock<HashMap<String, MemoryCache>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, cache: &str) -> Result<(), CacheError> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, cache: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(cache))
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(cache).is_some())
    }

    async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .and_then(|entries| entries.get(&key.storage_key()))
            .map(|(_, entry)| entry.clone()))
    }

    async fn put(&self, cache: &str, key: &CacheKey, entry: CachedResponse) -> Result<(), CacheError> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default()
            .insert(key.storage_key(), (key.clone(), entry));
        Ok(())
    }

    async fn delete(&self, cache: &str, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(cache)
            .is_some_and(|entries| entries.remove(&key.storage_key()).is_some()))
    }

    async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>, CacheError> {
        let caches = self.caches.read().await;
        let entries = caches
            .get(cache)
            .ok_or_else(|| CacheError::NotFound(cache.to_string()))?;
        let mut keys: Vec<CacheKey> = entries.values().map(|(key, _)| key.clone()).collect();
        keys.sort_by_key(CacheKey::storage_key);
        Ok(keys)
    }
}

// ==================== Cache Storage ====================

/// All cache generations (the `caches` global).
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStorage {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Storage backed by a fresh [`MemoryBackend`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a cache, creating it if absent.
    pub async fn open(&self, name: &str) -> Result<Cache, CacheError> {
        self.backend.open(name).await?;
        Ok(Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        })
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.backend.has(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.backend.delete_cache(name).await
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.backend.cache_names().await
    }
}

impl fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

/// Handle to one named cache.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    /// Cache name (the version identifier).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request key.
    pub async fn match_key(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let entry = self.backend.get(&self.name, key).await?;
        trace!(cache = %self.name, key = %key, hit = entry.is_some(), "Cache lookup");
        Ok(entry)
    }

    /// Store an entry, replacing any previous one.
    pub async fn put(&self, key: &CacheKey, entry: CachedResponse) -> Result<(), CacheError> {
        if !key.is_storable() {
            return Err(CacheError::UnsupportedMethod(key.method.clone()));
        }
        self.backend.put(&self.name, key, entry).await
    }

    /// Delete entry.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.backend.delete(&self.name, key).await
    }

    /// All keys in this cache.
    pub async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        self.backend.keys(&self.name).await
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT, CONTENT_TYPE};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(body: &str) -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/css"));
        CachedResponse::capture(Response::new(
            url("https://portal.example/app.css"),
            StatusCode::OK,
            headers,
            body.to_string(),
        ))
    }

    #[test]
    fn test_key_for_request_captures_configured_headers() {
        let request = Request::get(url("https://portal.example/api"))
            .header(ACCEPT, HeaderValue::from_static("application/json"));

        let plain = CacheKey::for_request(&request, &[]);
        assert_eq!(plain, CacheKey::get(&url("https://portal.example/api")));

        let keyed = CacheKey::for_request(&request, &["Accept".to_string(), "x-missing".to_string()]);
        assert_eq!(keyed.vary, vec![("accept".to_string(), "application/json".to_string())]);
        assert_eq!(
            keyed.storage_key(),
            "GET https://portal.example/api|accept=application/json"
        );
        assert_eq!(keyed.without_vary(), plain);
    }

    #[test]
    fn test_capture_round_trips_to_response() {
        let captured = entry("body { color: red }");
        assert_eq!(captured.status, 200);
        assert_eq!(captured.status_text, "OK");

        let response = captured.into_response().unwrap();
        assert_eq!(response.header("content-type"), Some("text/css"));
        assert_eq!(response.text().unwrap(), "body { color: red }");
    }

    #[tokio::test]
    async fn test_cache_put_overwrites() {
        let storage = CacheStorage::memory();
        let cache = storage.open("v1").await.unwrap();
        let key = CacheKey::get(&url("https://portal.example/app.css"));

        cache.put(&key, entry("old")).await.unwrap();
        cache.put(&key, entry("new")).await.unwrap();

        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let stored = cache.match_key(&key).await.unwrap().unwrap();
        assert_eq!(stored.body, b"new");
    }

    #[tokio::test]
    async fn test_cache_rejects_non_get() {
        let storage = CacheStorage::memory();
        let cache = storage.open("v1").await.unwrap();
        let request = Request::post(url("https://portal.example/api/results"), Default::default());
        let key = CacheKey::for_request(&request, &[]);

        assert!(matches!(
            cache.put(&key, entry("x")).await,
            Err(CacheError::UnsupportedMethod(m)) if m == "POST"
        ));
    }

    #[tokio::test]
    async fn test_cache_delete() {
        let storage = CacheStorage::memory();
        let cache = storage.open("v1").await.unwrap();
        let key = CacheKey::get(&url("https://portal.example/app.css"));

        cache.put(&key, entry("x")).await.unwrap();
        assert!(cache.delete(&key).await.unwrap());
        assert!(cache.match_key(&key).await.unwrap().is_none());
        assert!(!cache.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = CacheStorage::memory();

        assert!(!storage.has("v1").await.unwrap());
        storage.open("v2").await.unwrap();
        storage.open("v1").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["v1", "v2"]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(storage.keys().await.unwrap() == vec!["v2"]);
    }

    #[tokio::test]
    async fn test_keys_of_missing_cache() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.keys("gone").await,
            Err(CacheError::NotFound(_))
        ));
    }
}
