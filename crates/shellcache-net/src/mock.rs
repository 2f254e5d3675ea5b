//! Scripted in-process [`Network`] for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use tracing::trace;

use crate::{NetError, Network, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond {
        status: StatusCode,
        body: Bytes,
        content_type: Option<&'static str>,
    },
    Fail(String),
}

/// A network whose answers are scripted per URL.
///
/// Unknown URLs answer `404 Not Found`, like a real origin would. Every
/// attempt is counted, including ones that fail.
#[derive(Debug, Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<(Method, String), Route>>,
    calls: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MockNetwork {
    /// Create an empty, online network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer GET `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.respond_to(Method::GET, url, status, body)
    }

    /// Answer `method` `url` with `status` and `body`.
    pub fn respond_to(
        &self,
        method: Method,
        url: &str,
        status: u16,
        body: impl Into<Bytes>,
    ) -> &Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.insert(
            method,
            url,
            Route::Respond {
                status,
                body: body.into(),
                content_type: None,
            },
        );
        self
    }

    /// Answer GET `url` with a 200 HTML document.
    pub fn respond_html(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.insert(
            Method::GET,
            url,
            Route::Respond {
                status: StatusCode::OK,
                body: body.into(),
                content_type: Some("text/html; charset=utf-8"),
            },
        );
        self
    }

    /// Make GET `url` fail at the transport level.
    pub fn fail(&self, url: &str, reason: &str) -> &Self {
        self.insert(Method::GET, url, Route::Fail(reason.to_string()));
        self
    }

    /// Toggle a full outage. While offline every request fails with
    /// [`NetError::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether the network is currently in an outage.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Number of attempts made for `url`, across all methods.
    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// Number of attempts made in total.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).values().sum()
    }

    fn insert(&self, method: Method, url: &str, route: Route) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((method, url.to_string()), route);
    }

    fn route_for(&self, request: &Request) -> Option<Route> {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(request.method.clone(), request.url.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(url.clone())
            .or_insert(0) += 1;

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_offline() {
            trace!(url = %url, "Mock network offline");
            return Err(NetError::Offline);
        }

        match self.route_for(request) {
            Some(Route::Respond {
                status,
                body,
                content_type,
            }) => {
                let mut response = Response::new(request.url.clone(), status, body);
                if let Some(content_type) = content_type {
                    response = response.with_header(
                        HeaderName::from_static("content-type"),
                        HeaderValue::from_static(content_type),
                    );
                }
                Ok(response)
            }
            Some(Route::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Ok(Response::new(request.url.clone(), StatusCode::NOT_FOUND, "Not Found")),
        }
    }
}
