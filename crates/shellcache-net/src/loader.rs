//! reqwest-backed [`Network`] implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{NetError, Network, Request, Response};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Timeout applied when the request carries none.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("shellcache/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Loader that performs real HTTP requests.
#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: Client,
    config: LoaderConfig,
}

impl HttpLoader {
    /// Create a new loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpLoader initialized");

        Ok(Self { client, config })
    }

    /// The loader's configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[async_trait]
impl Network for HttpLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(
            request_id = request.id.raw(),
            url = %request.url,
            method = %request.method,
            "Fetching resource"
        );

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
            } else {
                NetError::Http(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            request_id = request.id.raw(),
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("shellcache/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_reads_full_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/styles.css"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("body { margin: 0 }", "text/css"),
            )
            .mount(&server)
            .await;

        let loader = HttpLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/styles.css", server.uri())).unwrap();
        let response = loader.fetch(&Request::get(url)).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.text().unwrap(), "body { margin: 0 }");
        assert_eq!(response.headers["content-type"], "text/css");
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let loader = HttpLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/broken", server.uri())).unwrap();
        let response = loader.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let loader = HttpLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let request = Request::get(url).timeout(Duration::from_millis(50));

        let err = loader.fetch(&request).await.unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let loader = HttpLoader::new(LoaderConfig::default()).unwrap();
        // Port 9 (discard) is not served on loopback in test environments.
        let request = Request::parse("http://127.0.0.1:9/").unwrap();
        assert!(loader.fetch(&request).await.is_err());
    }
}
