//! # shellcache net
//!
//! The network side of the offline cache worker.
//!
//! ## Design Goals
//!
//! 1. **One seam**: everything that touches the wire goes through [`Network`]
//! 2. **Snapshots**: a [`Response`] is a fully-read, cloneable body so it can
//!    be returned to the page and stored in a bucket at the same time
//! 3. **Testable**: [`MockNetwork`] scripts routes, outages and call counts

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod loader;
pub mod mock;

pub use loader::{HttpLoader, LoaderConfig};
pub use mock::MockNetwork;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable (offline)")]
    Offline,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl NetError {
    /// Short category name, used as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            NetError::RequestFailed(_) => "request_failed",
            NetError::InvalidUrl(_) => "invalid_url",
            NetError::Timeout(_) => "timeout",
            NetError::Offline => "offline",
            NetError::Http(_) => "http",
        }
    }
}

impl From<shellcache_common::CommonError> for NetError {
    fn from(err: shellcache_common::CommonError) -> Self {
        match err {
            shellcache_common::CommonError::Timeout(limit) => NetError::Timeout(limit),
            other => NetError::RequestFailed(other.to_string()),
        }
    }
}

/// Unique identifier for a request, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin subresource or API call.
    #[default]
    SameOrigin,
    /// CORS request.
    Cors,
    /// Opaque cross-origin request.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::SameOrigin,
            timeout: None,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a top-level page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the request targets `origin`'s scheme, host and port.
    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }
}

/// HTTP response with its body fully read.
#[derive(Debug, Clone)]
pub struct Response {
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

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can perform a single network attempt for a request.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform the request once. An `Ok` response may carry any status;
    /// only transport failures are errors.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/api").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_mode() {
        let request = Request::navigate(Url::parse("https://example.com/").unwrap());
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);
    }

    #[test]
    fn test_same_origin() {
        let origin = Url::parse("https://app.example.com/").unwrap();
        let same = Request::parse("https://app.example.com/data?x=1").unwrap();
        let other_port = Request::parse("https://app.example.com:8443/data").unwrap();
        let other_host = Request::parse("https://fonts.googleapis.com/css2").unwrap();

        assert!(same.is_same_origin(&origin));
        assert!(!other_port.is_same_origin(&origin));
        assert!(!other_host.is_same_origin(&origin));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(Request::parse("not a url"), Err(NetError::InvalidUrl(_))));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_response_ok_range() {
        let url = Url::parse("https://example.com/").unwrap();
        assert!(Response::new(url.clone(), StatusCode::OK, "x").ok());
        assert!(Response::new(url.clone(), StatusCode::NO_CONTENT, "").ok());
        assert!(!Response::new(url.clone(), StatusCode::NOT_FOUND, "").ok());
        assert!(!Response::new(url, StatusCode::INTERNAL_SERVER_ERROR, "").ok());
    }

    #[test]
    fn test_response_json() {
        let url = Url::parse("https://example.com/").unwrap();
        let response = Response::new(url, StatusCode::OK, r#"{"temp": 21}"#);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["temp"], 21);
    }

    #[test]
    fn test_timeout_conversion() {
        let err: NetError = shellcache_common::CommonError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, NetError::Timeout(d) if d == Duration::from_secs(3)));
    }
}
