//! Cache store: named buckets of request identity → captured response.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use shellcache_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::Result;

// ==================== Keys ====================

/// Opaque identity of a request: method plus URL (fragment stripped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for `method` `url`.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }

    /// Key identifying `request`.
    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A captured response. Never edited in place; a new capture replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request identity.
    pub key: RequestKey,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: BTreeMap<String, String>,

    /// Response body.
    pub body: Bytes,

    /// Captured at (ms since epoch).
    pub cached_at: u64,

    /// Store-wide write sequence, assigned by the store on `put`.
    #[serde(default)]
    pub revision: u64,
}

impl CacheEntry {
    /// Snapshot `response` as the answer to `key`.
    pub fn capture(key: RequestKey, response: &Response) -> Self {
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
            key,
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
            revision: 0,
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache ====================

/// One bucket.
#[derive(Debug, Default)]
pub struct Cache {
    /// Bucket name.
    pub name: String,

    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create an empty bucket.
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

    /// Store an entry, replacing any previous capture for the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All request keys in the bucket.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All buckets, in creation order.
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

    /// Open a bucket (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Check if a bucket exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Get a bucket without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Delete a bucket and everything in it.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Bucket names in creation order.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match across all buckets. When several buckets hold the key, the most
    /// recently written entry wins.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .filter_map(|cache| cache.match_request(key))
            .max_by_key(|entry| entry.revision)
    }
}

// ==================== Store ====================

/// Async access to the bucket store.
///
/// Each call is atomic on its own; nothing spans several keys. Concurrent
/// writes to one key are last-write-wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create `bucket` if it does not exist.
    async fn open(&self, bucket: &str);

    async fn has(&self, bucket: &str) -> bool;

    /// Bucket names in creation order.
    async fn keys(&self) -> Vec<String>;

    /// Delete a whole bucket. Returns whether it existed.
    async fn delete(&self, bucket: &str) -> bool;

    /// Store `entry` in `bucket`, creating the bucket if needed.
    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<()>;

    /// Look `key` up in one bucket.
    async fn match_in(&self, bucket: &str, key: &RequestKey) -> Option<CacheEntry>;

    /// Look `key` up in every bucket.
    async fn match_any(&self, key: &RequestKey) -> Option<CacheEntry>;

    /// Keys stored in `bucket` (empty if the bucket does not exist).
    async fn entries(&self, bucket: &str) -> Vec<RequestKey>;
}

/// In-memory [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    storage: RwLock<CacheStorage>,
    revision: AtomicU64,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, bucket: &str) {
        self.storage.write().await.open(bucket);
    }

    async fn has(&self, bucket: &str) -> bool {
        self.storage.read().await.has(bucket)
    }

    async fn keys(&self) -> Vec<String> {
        self.storage
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    async fn delete(&self, bucket: &str) -> bool {
        self.storage.write().await.delete(bucket)
    }

    async fn put(&self, bucket: &str, mut entry: CacheEntry) -> Result<()> {
        let mut storage = self.storage.write().await;
        entry.revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(bucket, key = %entry.key, revision = entry.revision, "Storing entry");
        storage.open(bucket).put(entry);
        Ok(())
    }

    async fn match_in(&self, bucket: &str, key: &RequestKey) -> Option<CacheEntry> {
        self.storage
            .read()
            .await
            .get(bucket)
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    async fn match_any(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.storage.read().await.match_request(key).cloned()
    }

    async fn entries(&self, bucket: &str) -> Vec<RequestKey> {
        self.storage
            .read()
            .await
            .get(bucket)
            .map(|cache| cache.keys().into_iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(u: &str, body: &'static str) -> CacheEntry {
        let url = url(u);
        let response = Response::new(url.clone(), StatusCode::OK, body);
        CacheEntry::capture(RequestKey::get(&url), &response)
    }

    #[test]
    fn test_request_key_normalization() {
        let a = RequestKey::new("get", &url("https://app.test/page#section"));
        let b = RequestKey::get(&url("https://app.test/page"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://app.test/page");

        let post = RequestKey::new("POST", &url("https://app.test/page"));
        assert_ne!(post, b);
    }

    #[test]
    fn test_cache_put_overwrites() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://app.test/a", "old"));
        cache.put(entry("https://app.test/a", "new"));

        let key = RequestKey::get(&url("https://app.test/a"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.match_request(&key).unwrap().body, Bytes::from("new"));
        assert!(cache.delete(&key));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_storage_order() {
        let mut storage = CacheStorage::new();
        assert!(!storage.has("b"));

        storage.open("b");
        storage.open("a");
        storage.open("b");
        assert_eq!(storage.keys(), vec!["b", "a"]);

        assert!(storage.delete("b"));
        assert!(!storage.delete("b"));
        assert_eq!(storage.keys(), vec!["a"]);
    }

    #[test]
    fn test_capture_keeps_headers() {
        let u = url("https://app.test/data.json");
        let response = Response::new(u.clone(), StatusCode::OK, "{}").with_header(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        let captured = CacheEntry::capture(RequestKey::get(&u), &response);
        assert_eq!(captured.status, 200);
        assert_eq!(captured.headers["content-type"], "application/json");
        assert!(captured.cached_at > 0);
    }

    #[tokio::test]
    async fn test_memory_store_newest_wins_across_buckets() {
        let store = MemoryCacheStore::new();
        store.put("static", entry("https://app.test/index.html", "precached")).await.unwrap();
        store.put("dynamic", entry("https://app.test/index.html", "fresh")).await.unwrap();

        let key = RequestKey::get(&url("https://app.test/index.html"));
        let hit = store.match_any(&key).await.unwrap();
        assert_eq!(hit.body, Bytes::from("fresh"));

        let in_static = store.match_in("static", &key).await.unwrap();
        assert_eq!(in_static.body, Bytes::from("precached"));
    }

    #[tokio::test]
    async fn test_memory_store_delete_bucket() {
        let store = MemoryCacheStore::new();
        store.open("empty").await;
        store.put("full", entry("https://app.test/a", "a")).await.unwrap();
        assert_eq!(store.keys().await, vec!["empty", "full"]);
        assert_eq!(store.entries("full").await.len(), 1);

        assert!(store.delete("full").await);
        assert!(!store.has("full").await);
        assert!(store.entries("full").await.is_empty());
        let key = RequestKey::get(&url("https://app.test/a"));
        assert!(store.match_any(&key).await.is_none());
    }
}
