//! Per-generation worker configuration.
//!
//! One `WorkerConfig` describes one deployment: its version tag, the bucket
//! names derived from it, and the static manifest. Two configs with different
//! versions can live side by side in one process.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellcache_common::{CommonError, ResultExt};
use tracing::debug;
use url::Url;

/// Google Fonts stylesheet precached with the app shell.
pub const DEFAULT_FONT_URL: &str =
    "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&display=swap";

/// Deadline for a single network attempt unless configured otherwise.
pub const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 10_000;

/// Configuration for one worker generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generation tag, embedded in every bucket name.
    pub version: String,

    /// The app's origin. Requests to any other origin are cross-origin.
    pub origin: Url,

    /// Prefix shared by both bucket names.
    pub cache_prefix: String,

    /// Resources precached at install, in order. Paths resolve against
    /// `origin`; absolute URLs are kept as-is.
    pub manifest: Vec<String>,

    /// Document served to navigations when offline and uncached.
    pub shell_path: String,

    /// Page opened by the notification `view` action.
    pub root_path: String,

    /// Tag recognised by sync and periodic sync.
    pub sync_tag: String,

    /// Ask to skip the waiting state as soon as install finishes.
    pub skip_waiting_on_install: bool,

    /// Deadline for a single network attempt; `None` waits for the
    /// transport to give up on its own.
    pub network_timeout_ms: Option<u64>,

    /// Interval for periodic background refresh; `None` disables it.
    pub periodic_sync_interval_secs: Option<u64>,

    pub online_message: String,
    pub offline_message: String,

    pub notification_title: String,
    pub notification_body: String,
    pub notification_icon: String,
    pub notification_badge: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            origin: Url::parse("http://localhost:8080/").expect("static URL is valid"),
            cache_prefix: "app".to_string(),
            manifest: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/styles.css".to_string(),
                "/app.js".to_string(),
                "/manifest.json".to_string(),
                DEFAULT_FONT_URL.to_string(),
            ],
            shell_path: "/index.html".to_string(),
            root_path: "/".to_string(),
            sync_tag: "refresh-data".to_string(),
            skip_waiting_on_install: true,
            network_timeout_ms: Some(DEFAULT_NETWORK_TIMEOUT_MS),
            periodic_sync_interval_secs: None,
            online_message: "You're back online. Fresh data will load automatically.".to_string(),
            offline_message: "You're offline. Showing cached data.".to_string(),
            notification_title: "Update available".to_string(),
            notification_body: "New data is ready to view.".to_string(),
            notification_icon: "/icons/icon-192.png".to_string(),
            notification_badge: "/icons/icon-72.png".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Create a config for `version` served from `origin`, with defaults
    /// for everything else.
    pub fn new(version: impl Into<String>, origin: Url) -> Self {
        Self {
            version: version.into(),
            origin,
            ..Default::default()
        }
    }

    /// Replace the static manifest.
    pub fn with_manifest<I, S>(mut self, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = manifest.into_iter().map(Into::into).collect();
        self
    }

    /// Set the network deadline.
    pub fn with_network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, CommonError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CommonError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading worker config");
        let contents = std::fs::read_to_string(path)
            .context(format!("reading config {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Check that every derived name and URL can be built.
    pub fn validate(&self) -> Result<(), CommonError> {
        if self.version.trim().is_empty() {
            return Err(CommonError::config("version must not be empty"));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(CommonError::config("cache_prefix must not be empty"));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(CommonError::config(format!(
                "origin must be http(s), got `{}`",
                self.origin
            )));
        }
        if self.sync_tag.is_empty() {
            return Err(CommonError::config("sync_tag must not be empty"));
        }
        if self.network_timeout_ms == Some(0) {
            return Err(CommonError::config("network_timeout_ms must be positive"));
        }
        if self.periodic_sync_interval_secs == Some(0) {
            return Err(CommonError::config("periodic_sync_interval_secs must be positive"));
        }
        self.manifest_urls()?;
        self.shell_url()?;
        self.root_url()?;
        Ok(())
    }

    /// Name of the install-time bucket for this generation.
    pub fn static_bucket(&self) -> String {
        format!("{}-static-{}", self.cache_prefix, self.version)
    }

    /// Name of the runtime bucket for this generation.
    pub fn dynamic_bucket(&self) -> String {
        format!("{}-dynamic-{}", self.cache_prefix, self.version)
    }

    /// Whether `bucket` belongs to this generation.
    pub fn owns_bucket(&self, bucket: &str) -> bool {
        bucket == self.static_bucket() || bucket == self.dynamic_bucket()
    }

    /// Resolve a manifest-style reference against the origin.
    pub fn resolve(&self, reference: &str) -> Result<Url, CommonError> {
        self.origin
            .join(reference)
            .map_err(|e| CommonError::config_with_source(format!("invalid URL `{reference}`"), e))
    }

    /// The manifest, resolved to absolute URLs.
    pub fn manifest_urls(&self) -> Result<Vec<Url>, CommonError> {
        self.manifest.iter().map(|entry| self.resolve(entry)).collect()
    }

    pub fn shell_url(&self) -> Result<Url, CommonError> {
        self.resolve(&self.shell_path)
    }

    pub fn root_url(&self) -> Result<Url, CommonError> {
        self.resolve(&self.root_path)
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }

    pub fn periodic_sync_interval(&self) -> Option<Duration> {
        self.periodic_sync_interval_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://weather.example/").unwrap()
    }

    #[test]
    fn test_bucket_names_carry_version() {
        let config = WorkerConfig::new("v7", origin());
        assert_eq!(config.static_bucket(), "app-static-v7");
        assert_eq!(config.dynamic_bucket(), "app-dynamic-v7");
        assert!(config.owns_bucket("app-static-v7"));
        assert!(!config.owns_bucket("app-static-v6"));
    }

    #[test]
    fn test_manifest_resolution() {
        let config = WorkerConfig::new("v1", origin());
        let urls = config.manifest_urls().unwrap();

        assert_eq!(urls[0].as_str(), "https://weather.example/");
        assert_eq!(urls[1].as_str(), "https://weather.example/index.html");
        assert_eq!(urls.last().unwrap().host_str(), Some("fonts.googleapis.com"));
        assert_eq!(config.shell_url().unwrap().path(), "/index.html");
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let json = r#"{
            "version": "v2",
            "origin": "https://weather.example/",
            "manifest": ["/index.html"]
        }"#;
        let config = WorkerConfig::from_json(json).unwrap();

        assert_eq!(config.version, "v2");
        assert_eq!(config.manifest, vec!["/index.html"]);
        assert_eq!(config.sync_tag, "refresh-data");
        assert_eq!(config.network_timeout(), Some(Duration::from_secs(10)));
        assert!(config.skip_waiting_on_install);
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        assert!(WorkerConfig::from_json(r#"{"version": ""}"#).is_err());
        assert!(WorkerConfig::from_json(r#"{"origin": "ftp://files.example/"}"#).is_err());
        assert!(WorkerConfig::from_json(r#"{"network_timeout_ms": 0}"#).is_err());
        assert!(WorkerConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_timeout_can_be_disabled() {
        let config = WorkerConfig::new("v1", origin()).with_network_timeout(None);
        assert_eq!(config.network_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = WorkerConfig::load("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.category(), "internal");
    }
}
