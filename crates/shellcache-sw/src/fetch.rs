//! Fetch interception policies.
//!
//! Cross-origin requests are cache-first: a hit never touches the network.
//! Same-origin requests are network-first: a 2xx answer is stored in the
//! dynamic bucket in the background, and a transport failure falls back to
//! the cache, then (for navigations) to the shell document. No retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use shellcache_common::with_timeout;
use shellcache_net::{NetError, Network, Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStore, RequestKey};
use crate::config::WorkerConfig;
use crate::event::ExtendableEvent;
use crate::SwError;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The cached shell document, standing in for an uncached navigation.
    ShellFallback,
}

/// Response handed back to the page.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a response from a network answer.
    pub fn from_network(response: &Response) -> Self {
        let entry = CacheEntry::capture(RequestKey::get(&response.url), response);
        Self {
            url: response.url.to_string(),
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            source: ResponseSource::Network,
        }
    }

    /// Create a response from a cache entry.
    pub fn from_cache(entry: &CacheEntry, source: ResponseSource) -> Self {
        Self {
            url: entry.key.url.clone(),
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            source,
        }
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn from_cache_storage(&self) -> bool {
        self.source != ResponseSource::Network
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Policy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
}

/// The decision logic run for every intercepted request.
#[derive(Clone)]
pub struct FetchPolicy {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    /// Open while the owning generation may still write to the store.
    writes: Arc<RwLock<bool>>,
}

impl FetchPolicy {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            config,
            store,
            network,
            writes: Arc::new(RwLock::new(true)),
        }
    }

    /// Stop storing responses. Returns once every write already under way
    /// has landed, so nothing started by this policy lands afterwards.
    pub(crate) async fn close_writes(&self) {
        *self.writes.write().await = false;
    }

    /// Pick the policy for `request`.
    pub fn strategy_for(&self, request: &Request) -> Strategy {
        if request.is_same_origin(&self.config.origin) {
            Strategy::NetworkFirst
        } else {
            Strategy::CacheFirst
        }
    }

    /// Produce exactly one response for `request`. Cache writes are
    /// registered on `lifetime` and do not delay the answer.
    pub async fn respond(
        &self,
        request: &Request,
        lifetime: &mut ExtendableEvent,
    ) -> Result<FetchResponse, SwError> {
        match self.strategy_for(request) {
            Strategy::CacheFirst => self.cache_first(request, lifetime).await,
            Strategy::NetworkFirst => self.network_first(request, lifetime).await,
        }
    }

    async fn cache_first(
        &self,
        request: &Request,
        lifetime: &mut ExtendableEvent,
    ) -> Result<FetchResponse, SwError> {
        let key = RequestKey::from_request(request);

        if let Some(entry) = self.store.match_any(&key).await {
            debug!(key = %key, "Cache hit (cache-first)");
            return Ok(FetchResponse::from_cache(&entry, ResponseSource::Cache));
        }

        let response = self.attempt(request).await.map_err(|err| {
            warn!(
                url = %request.url,
                method = %request.method,
                event = "fetch",
                error = %err,
                "Cross-origin fetch failed with nothing cached"
            );
            SwError::Network(err)
        })?;

        if response.ok() {
            self.store_in_background(
                lifetime,
                self.config.static_bucket(),
                CacheEntry::capture(key, &response),
            );
        }
        Ok(FetchResponse::from_network(&response))
    }

    async fn network_first(
        &self,
        request: &Request,
        lifetime: &mut ExtendableEvent,
    ) -> Result<FetchResponse, SwError> {
        let key = RequestKey::from_request(request);

        let err = match self.attempt(request).await {
            Ok(response) => {
                if response.ok() {
                    self.store_in_background(
                        lifetime,
                        self.config.dynamic_bucket(),
                        CacheEntry::capture(key, &response),
                    );
                } else {
                    debug!(
                        key = %key,
                        status = %response.status,
                        "Not caching non-2xx response"
                    );
                }
                return Ok(FetchResponse::from_network(&response));
            }
            Err(err) => err,
        };

        warn!(
            url = %request.url,
            method = %request.method,
            event = "fetch",
            error = %err,
            "Network request failed, falling back to cache"
        );

        if let Some(entry) = self.store.match_any(&key).await {
            return Ok(FetchResponse::from_cache(&entry, ResponseSource::Cache));
        }

        if request.is_navigation() {
            if let Some(shell) = self.shell_document().await {
                debug!(url = %request.url, "Serving shell document for offline navigation");
                return Ok(FetchResponse::from_cache(&shell, ResponseSource::ShellFallback));
            }
            warn!(url = %request.url, event = "fetch", "Shell document is not cached");
        }

        Err(SwError::Network(err))
    }

    async fn shell_document(&self) -> Option<CacheEntry> {
        let shell: Url = self.config.shell_url().ok()?;
        self.store.match_any(&RequestKey::get(&shell)).await
    }

    /// One network attempt, bounded by the request's or the config's
    /// timeout.
    async fn attempt(&self, request: &Request) -> Result<Response, NetError> {
        let timeout = request.timeout.or_else(|| self.config.network_timeout());
        with_timeout(timeout, || self.network.fetch(request)).await?
    }

    fn store_in_background(
        &self,
        lifetime: &mut ExtendableEvent,
        bucket: String,
        entry: CacheEntry,
    ) {
        let store = Arc::clone(&self.store);
        let writes = Arc::clone(&self.writes);
        lifetime.wait_until(async move {
            let open = writes.read().await;
            let key = entry.key.clone();
            if !*open {
                debug!(bucket = %bucket, key = %key, "Generation retired, response not stored");
                return;
            }
            if let Err(e) = store.put(&bucket, entry).await {
                warn!(bucket = %bucket, key = %key, error = %e, "Failed to store response");
            }
        });
    }
}
