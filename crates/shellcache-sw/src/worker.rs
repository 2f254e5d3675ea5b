//! One worker generation: its handlers for every inbound event.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use shellcache_common::with_timeout;
use shellcache_net::{NetError, Network, Request, Response};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStore, RequestKey};
use crate::clients::{ClientEvent, Clients};
use crate::config::WorkerConfig;
use crate::control::{Connectivity, ConnectivityCell, ControlMessage, WorkerNotice};
use crate::event::ExtendableEvent;
use crate::fetch::{FetchPolicy, FetchResponse};
use crate::lifecycle::{ActivateReport, GenerationState, InstallReport, RegistrationEvent};
use crate::push::{Notification, PushPayload, ACTION_VIEW};
use crate::sync::{RefreshContext, RefreshJob, RefreshTrigger};
use crate::{Result, SwError};

/// Shared services a worker is built from.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn CacheStore>,
    pub network: Arc<dyn Network>,
    pub clients: Arc<Clients>,
    pub refresh: Arc<dyn RefreshJob>,
    pub events: mpsc::UnboundedSender<RegistrationEvent>,
}

/// A worker generation.
pub struct Worker {
    config: Arc<WorkerConfig>,
    deps: WorkerDeps,
    policy: FetchPolicy,
    state: AtomicU8,
    skip_waiting: AtomicBool,
    connectivity: ConnectivityCell,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(config: WorkerConfig, deps: WorkerDeps) -> Self {
        let config = Arc::new(config);
        let policy = FetchPolicy::new(
            Arc::clone(&config),
            Arc::clone(&deps.store),
            Arc::clone(&deps.network),
        );
        Self {
            config,
            deps,
            policy,
            state: AtomicU8::new(GenerationState::Installing as u8),
            skip_waiting: AtomicBool::new(false),
            connectivity: ConnectivityCell::new(),
            periodic: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn state(&self) -> GenerationState {
        GenerationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `state`, publishing the change.
    pub(crate) fn set_state(&self, state: GenerationState) {
        let previous = GenerationState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous == state {
            return;
        }
        debug!(
            version = %self.config.version,
            from = ?previous,
            to = ?state,
            "Generation state changed"
        );
        let _ = self.deps.events.send(RegistrationEvent::StateChange {
            version: self.config.version.clone(),
            state,
        });
    }

    /// Whether this generation asked to skip the waiting state.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity.load()
    }

    pub(crate) fn set_periodic(&self, handle: JoinHandle<()>) {
        let previous = self
            .periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn stop_periodic(&self) {
        if let Some(handle) = self.periodic.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Take this generation out of service: stop its periodic refresh, wait
    /// for its in-flight cache writes and refuse new ones, then mark it
    /// superseded.
    pub(crate) async fn retire(&self) {
        self.stop_periodic();
        self.policy.close_writes().await;
        self.set_state(GenerationState::Superseded);
    }

    // ==================== Install ====================

    /// Precache the manifest into the static bucket. Entries that fail are
    /// logged and reported but do not fail the install.
    pub async fn on_install(&self) -> Result<InstallReport> {
        self.set_state(GenerationState::Installing);

        let bucket = self.config.static_bucket();
        self.deps.store.open(&bucket).await;
        let urls = self.config.manifest_urls()?;
        info!(version = %self.config.version, bucket = %bucket, entries = urls.len(), "Installing");

        let results = join_all(urls.into_iter().map(|url| async move {
            let result = self.fetch_once(&Request::get(url.clone())).await;
            (url, result)
        }))
        .await;

        let mut report = InstallReport {
            version: self.config.version.clone(),
            cached: Vec::new(),
            failed: Vec::new(),
        };

        for (url, result) in results {
            match result {
                Ok(response) if response.ok() => {
                    let entry = CacheEntry::capture(RequestKey::get(&url), &response);
                    self.deps.store.put(&bucket, entry).await?;
                    report.cached.push(url.to_string());
                }
                Ok(response) => {
                    warn!(url = %url, status = %response.status, "Precache entry rejected");
                    report.failed.push((url.to_string(), format!("HTTP {}", response.status)));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, category = e.category(), "Precache entry failed");
                    report.failed.push((url.to_string(), e.to_string()));
                }
            }
        }

        if self.config.skip_waiting_on_install {
            self.skip_waiting.store(true, Ordering::SeqCst);
        }
        self.set_state(GenerationState::Waiting);

        info!(
            version = %self.config.version,
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Install finished"
        );
        Ok(report)
    }

    async fn fetch_once(&self, request: &Request) -> std::result::Result<Response, NetError> {
        let timeout = request.timeout.or_else(|| self.config.network_timeout());
        with_timeout(timeout, || self.deps.network.fetch(request)).await?
    }

    // ==================== Activate ====================

    /// Delete every bucket this generation does not own and take control of
    /// the open pages. Safe to run again.
    pub async fn on_activate(&self) -> Result<ActivateReport> {
        match self.state() {
            GenerationState::Waiting | GenerationState::Activating | GenerationState::Active => {}
            other => {
                return Err(SwError::InvalidState(format!(
                    "cannot activate {} from {other:?}",
                    self.config.version
                )))
            }
        }
        if self.state() != GenerationState::Active {
            self.set_state(GenerationState::Activating);
        }

        let stale: Vec<String> = self
            .deps
            .store
            .keys()
            .await
            .into_iter()
            .filter(|name| !self.config.owns_bucket(name))
            .collect();

        let removed = join_all(stale.iter().map(|name| self.deps.store.delete(name))).await;
        let deleted: Vec<String> = stale
            .into_iter()
            .zip(removed)
            .filter_map(|(name, existed)| existed.then_some(name))
            .collect();
        for name in &deleted {
            info!(bucket = %name, "Deleted stale bucket");
        }

        let claimed = self.deps.clients.claim(&self.config.version).await;
        self.set_state(GenerationState::Active);

        info!(version = %self.config.version, deleted = deleted.len(), claimed, "Activated");
        Ok(ActivateReport {
            version: self.config.version.clone(),
            deleted,
            claimed,
        })
    }

    // ==================== Fetch ====================

    /// Answer a page request through this generation's fetch policy.
    pub async fn on_fetch(
        &self,
        request: &Request,
        lifetime: &mut ExtendableEvent,
    ) -> Result<FetchResponse> {
        if self.state() != GenerationState::Active {
            return Err(SwError::NotActive {
                version: self.config.version.clone(),
            });
        }
        self.policy.respond(request, lifetime).await
    }

    // ==================== Control channel ====================

    /// Handle a control message. `CLEAR_CACHE` completes in the background;
    /// await `lifetime` to observe it.
    pub async fn on_message(&self, message: ControlMessage, lifetime: &mut ExtendableEvent) {
        match message {
            ControlMessage::SkipWaiting => {
                info!(version = %self.config.version, "Skip waiting requested");
                self.skip_waiting.store(true, Ordering::SeqCst);
            }
            ControlMessage::ClearCache => {
                schedule_clear(Arc::clone(&self.deps.store), lifetime);
            }
        }
    }

    /// Record a connectivity change and tell every open page. Nothing is
    /// sent when the state did not change. Returns the number of pages
    /// reached.
    pub async fn on_connectivity_change(
        &self,
        online: bool,
        lifetime: &mut ExtendableEvent,
    ) -> usize {
        let next = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        if self.connectivity.swap(next) == next {
            return 0;
        }

        let notice = if online {
            WorkerNotice::Online {
                message: self.config.online_message.clone(),
            }
        } else {
            WorkerNotice::Offline {
                message: self.config.offline_message.clone(),
            }
        };
        let reached = self.deps.clients.broadcast(ClientEvent::Notice(notice)).await;
        info!(online, reached, "Connectivity changed");

        if online {
            let job = Arc::clone(&self.deps.refresh);
            let ctx = self.refresh_context(RefreshTrigger::Reconnect);
            lifetime.wait_until(run_refresh(job, ctx));
        }
        reached
    }

    // ==================== Background refresh ====================

    /// Reconnect-triggered sync. Returns whether `tag` was recognised.
    pub async fn on_sync(&self, tag: &str) -> bool {
        self.refresh_for(tag, RefreshTrigger::Sync).await
    }

    /// Scheduled sync. Returns whether `tag` was recognised.
    pub async fn on_periodic_sync(&self, tag: &str) -> bool {
        self.refresh_for(tag, RefreshTrigger::Periodic).await
    }

    async fn refresh_for(&self, tag: &str, trigger: RefreshTrigger) -> bool {
        if tag != self.config.sync_tag {
            debug!(tag, expected = %self.config.sync_tag, "Ignoring unknown sync tag");
            return false;
        }
        run_refresh(Arc::clone(&self.deps.refresh), self.refresh_context(trigger)).await;
        true
    }

    fn refresh_context(&self, trigger: RefreshTrigger) -> RefreshContext {
        RefreshContext {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.deps.store),
            network: Arc::clone(&self.deps.network),
            trigger,
        }
    }

    // ==================== Push ====================

    /// Render the notification for a push message.
    pub async fn on_push(&self, payload: Option<&[u8]>) -> Notification {
        let notification = Notification::from_payload(PushPayload::parse(payload), &self.config);
        debug!(title = %notification.title, "Showing notification");
        let _ = self
            .deps
            .events
            .send(RegistrationEvent::NotificationShown(notification.clone()));
        notification
    }

    /// Handle a click on `notification`. The `view` action opens the root
    /// page; anything else only dismisses it.
    pub async fn on_notification_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<Option<Url>> {
        if action != Some(ACTION_VIEW) {
            debug!(action = ?action, title = %notification.title, "Notification dismissed");
            return Ok(None);
        }

        let url = self.config.root_url()?;
        info!(url = %url, "Opening window from notification");
        let _ = self
            .deps
            .events
            .send(RegistrationEvent::WindowOpened { url: url.clone() });
        Ok(Some(url))
    }
}

/// Delete every bucket of every generation once `lifetime` runs its work.
pub(crate) fn schedule_clear(store: Arc<dyn CacheStore>, lifetime: &mut ExtendableEvent) {
    lifetime.wait_until(async move {
        let buckets = store.keys().await;
        let count = buckets.len();
        join_all(buckets.iter().map(|name| store.delete(name))).await;
        info!(buckets = count, "Cleared all caches");
    });
}

/// Run the refresh job, logging any failure.
async fn run_refresh(job: Arc<dyn RefreshJob>, ctx: RefreshContext) {
    let trigger = ctx.trigger;
    if let Err(e) = job.run(ctx).await {
        warn!(
            trigger = ?trigger,
            error = %e,
            category = e.category(),
            "Background refresh failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::event::EventKind;
    use crate::sync::NoopRefresh;
    use async_trait::async_trait;
    use shellcache_net::MockNetwork;
    use std::sync::atomic::AtomicUsize;

    struct FailingRefresh(AtomicUsize);

    #[async_trait]
    impl RefreshJob for FailingRefresh {
        async fn run(&self, _ctx: RefreshContext) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SwError::Network(NetError::Offline))
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new("v1", Url::parse("https://app.test/").unwrap())
            .with_manifest(["/", "/index.html", "/app.js"])
    }

    type Fixture = (
        Worker,
        Arc<MockNetwork>,
        Arc<MemoryCacheStore>,
        mpsc::UnboundedReceiver<RegistrationEvent>,
    );

    fn worker_with(refresh: Arc<dyn RefreshJob>) -> Fixture {
        let network = Arc::new(MockNetwork::new());
        let store = Arc::new(MemoryCacheStore::new());
        let (events, rx) = mpsc::unbounded_channel();
        let deps = WorkerDeps {
            store: store.clone(),
            network: network.clone(),
            clients: Arc::new(Clients::new()),
            refresh,
            events,
        };
        (Worker::new(config(), deps), network, store, rx)
    }

    fn worker() -> Fixture {
        worker_with(Arc::new(NoopRefresh))
    }

    #[tokio::test]
    async fn test_install_tolerates_failures() {
        let (worker, network, store, _rx) = worker();
        network.respond_html("https://app.test/", "<html>root</html>");
        network.respond_html("https://app.test/index.html", "<html>shell</html>");
        network.fail("https://app.test/app.js", "connection reset");

        let report = worker.on_install().await.unwrap();
        assert_eq!(report.cached.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "https://app.test/app.js");
        assert_eq!(worker.state(), GenerationState::Waiting);
        assert!(worker.skip_waiting_requested());
        assert_eq!(store.entries("app-static-v1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_install_rejects_non_success() {
        let (worker, network, store, _rx) = worker();
        network.respond("https://app.test/", 200, "root");
        network.respond("https://app.test/index.html", 500, "oops");
        network.respond("https://app.test/app.js", 200, "js");

        let report = worker.on_install().await.unwrap();
        assert_eq!(
            report.failed,
            vec![(
                "https://app.test/index.html".to_string(),
                "HTTP 500 Internal Server Error".to_string()
            )]
        );
        assert_eq!(store.entries("app-static-v1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_requires_active() {
        let (worker, _network, _store, _rx) = worker();
        let mut lifetime = ExtendableEvent::new(EventKind::Fetch);
        let request = Request::parse("https://app.test/").unwrap();
        let err = worker.on_fetch(&request, &mut lifetime).await.unwrap_err();
        assert!(matches!(err, SwError::NotActive { .. }));
    }

    #[tokio::test]
    async fn test_activate_gc_and_state_events() {
        let (worker, _network, store, mut rx) = worker();
        store.open("app-static-v0").await;
        store.open("app-dynamic-v0").await;
        worker.on_install().await.unwrap();

        let report = worker.on_activate().await.unwrap();
        assert_eq!(report.deleted, vec!["app-static-v0", "app-dynamic-v0"]);
        assert_eq!(store.keys().await, vec!["app-static-v1"]);
        assert_eq!(worker.state(), GenerationState::Active);

        let mut states = Vec::new();
        while let Ok(RegistrationEvent::StateChange { state, .. }) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![GenerationState::Waiting, GenerationState::Activating, GenerationState::Active]
        );

        let again = worker.on_activate().await.unwrap();
        assert!(again.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_reactivation_keeps_serving() {
        let (worker, network, _store, mut rx) = worker();
        network.respond_html("https://app.test/index.html", "<html>shell</html>");
        worker.on_install().await.unwrap();
        worker.on_activate().await.unwrap();
        while rx.try_recv().is_ok() {}

        worker.on_activate().await.unwrap();
        assert_eq!(worker.state(), GenerationState::Active);
        assert!(rx.try_recv().is_err());

        let mut lifetime = ExtendableEvent::new(EventKind::Fetch);
        let request = Request::parse("https://app.test/index.html").unwrap();
        let response = worker.on_fetch(&request, &mut lifetime).await.unwrap();
        assert_eq!(response.text(), "<html>shell</html>");
        lifetime.settled().await;
    }

    #[tokio::test]
    async fn test_retired_worker_stops_writing() {
        let (worker, network, store, _rx) = worker();
        worker.on_install().await.unwrap();
        worker.on_activate().await.unwrap();

        network.respond("https://app.test/api", 200, "data");
        network.set_latency(Some(std::time::Duration::from_millis(50)));
        let request = Request::parse("https://app.test/api").unwrap();
        let mut lifetime = ExtendableEvent::new(EventKind::Fetch);
        let (response, ()) = tokio::join!(worker.on_fetch(&request, &mut lifetime), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            worker.retire().await;
        });
        lifetime.settled().await;

        assert_eq!(response.unwrap().text(), "data");
        assert_eq!(worker.state(), GenerationState::Superseded);
        assert!(!store.has("app-dynamic-v1").await);
    }

    #[tokio::test]
    async fn test_activate_from_installing_is_rejected() {
        let (worker, _network, _store, _rx) = worker();
        assert!(matches!(
            worker.on_activate().await,
            Err(SwError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_connectivity_broadcast_only_on_change() {
        let (worker, _network, _store, _rx) = worker();
        let (_id, mut page) = worker
            .deps
            .clients
            .connect(Url::parse("https://app.test/").unwrap())
            .await;

        let mut lifetime = ExtendableEvent::new(EventKind::Connectivity);
        assert_eq!(worker.on_connectivity_change(false, &mut lifetime).await, 1);
        assert_eq!(worker.on_connectivity_change(false, &mut lifetime).await, 0);
        assert_eq!(worker.on_connectivity_change(true, &mut lifetime).await, 1);
        lifetime.settled().await;

        let first = page.recv().await.unwrap();
        assert!(matches!(first, ClientEvent::Notice(WorkerNotice::Offline { .. })));
        let second = page.recv().await.unwrap();
        assert!(matches!(second, ClientEvent::Notice(WorkerNotice::Online { .. })));
        assert_eq!(worker.connectivity(), Connectivity::Online);
    }

    #[tokio::test]
    async fn test_sync_ignores_unknown_tag_and_swallows_errors() {
        let job = Arc::new(FailingRefresh(AtomicUsize::new(0)));
        let (worker, _network, _store, _rx) = worker_with(job.clone());

        assert!(!worker.on_sync("something-else").await);
        assert_eq!(job.0.load(Ordering::SeqCst), 0);

        assert!(worker.on_sync("refresh-data").await);
        assert!(worker.on_periodic_sync("refresh-data").await);
        assert_eq!(job.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_notification_click_actions() {
        let (worker, _network, _store, mut rx) = worker();
        let notification = worker.on_push(Some(br#"{"title":"Hi"}"#)).await;
        assert!(matches!(rx.try_recv(), Ok(RegistrationEvent::NotificationShown(_))));

        let opened = worker.on_notification_click(&notification, Some("view")).await.unwrap();
        assert_eq!(opened, Some(Url::parse("https://app.test/").unwrap()));
        assert!(matches!(rx.try_recv(), Ok(RegistrationEvent::WindowOpened { .. })));

        let closed = worker.on_notification_click(&notification, Some("close")).await;
        assert_eq!(closed.unwrap(), None);
        let body = worker.on_notification_click(&notification, None).await;
        assert_eq!(body.unwrap(), None);
    }
}
