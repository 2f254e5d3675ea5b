//! Generation lifecycle and the registration that routes events.
//!
//! A registration holds at most one installing, one waiting and one active
//! generation. Installing a new version never disturbs the active one until
//! activation: the old generation is superseded first, then the new one
//! garbage-collects stale buckets and claims the open pages.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellcache_common::with_timeout;
use shellcache_net::{NetError, Network, Request};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::clients::Clients;
use crate::config::{WorkerConfig, DEFAULT_NETWORK_TIMEOUT_MS};
use crate::control::ControlMessage;
use crate::event::{EventHandle, EventKind, EventOutcome, ExtendableEvent, WorkerEvent};
use crate::fetch::FetchResponse;
use crate::push::Notification;
use crate::sync::{spawn_periodic_refresh, NoopRefresh, RefreshJob};
use crate::worker::{schedule_clear, Worker, WorkerDeps};
use crate::{Result, SwError};

/// Where a generation is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Installing = 0,
    Waiting = 1,
    Activating = 2,
    Active = 3,
    /// Replaced by a newer generation, or failed to install.
    Superseded = 4,
}

impl GenerationState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => GenerationState::Installing,
            1 => GenerationState::Waiting,
            2 => GenerationState::Activating,
            3 => GenerationState::Active,
            _ => GenerationState::Superseded,
        }
    }
}

/// Lifecycle notification published to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationEvent {
    StateChange {
        version: String,
        state: GenerationState,
    },
    /// Generation `version` now controls the open pages.
    ControllerChange { version: String },
    NotificationShown(Notification),
    WindowOpened { url: Url },
}

/// Result of precaching the manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallReport {
    pub version: String,
    /// URLs stored in the static bucket.
    pub cached: Vec<String>,
    /// URLs that could not be stored, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Result of an activation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivateReport {
    pub version: String,
    /// Buckets deleted by garbage collection.
    pub deleted: Vec<String>,
    /// Pages that switched to this generation.
    pub claimed: usize,
}

/// Result of [`Registration::install`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallOutcome {
    pub install: InstallReport,
    /// Present when the new generation was activated right away.
    pub activation: Option<ActivateReport>,
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<Worker>>,
    waiting: Option<Arc<Worker>>,
    active: Option<Arc<Worker>>,
}

/// The runtime shim: owns the generations and dispatches events to them.
pub struct Registration {
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clients: Arc<Clients>,
    refresh: Arc<dyn RefreshJob>,
    events: mpsc::UnboundedSender<RegistrationEvent>,
    /// Deadline for requests that arrive with no active generation.
    network_timeout: Option<Duration>,
    slots: Mutex<Slots>,
}

impl Registration {
    /// Create a registration with no generations, along with the receiver
    /// for its lifecycle events.
    pub fn new(
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let registration = Self {
            store,
            network,
            clients: Arc::new(Clients::new()),
            refresh: Arc::new(NoopRefresh),
            events,
            network_timeout: Some(Duration::from_millis(DEFAULT_NETWORK_TIMEOUT_MS)),
            slots: Mutex::new(Slots::default()),
        };
        (registration, receiver)
    }

    /// Use `job` for background refresh in generations installed from now on.
    pub fn with_refresh_job(mut self, job: Arc<dyn RefreshJob>) -> Self {
        self.refresh = job;
        self
    }

    /// Bound requests handled before any generation is active. `None`
    /// waits as long as the network does.
    pub fn with_network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// The active generation.
    pub async fn controller(&self) -> Option<Arc<Worker>> {
        self.slots.lock().await.active.clone()
    }

    /// The generation waiting to activate.
    pub async fn waiting(&self) -> Option<Arc<Worker>> {
        self.slots.lock().await.waiting.clone()
    }

    pub async fn installing(&self) -> Option<Arc<Worker>> {
        self.slots.lock().await.installing.clone()
    }

    // ==================== Lifecycle ====================

    /// Install a new generation. It activates immediately when it asked to
    /// skip waiting or when nothing is active yet; otherwise it waits.
    pub async fn install(&self, config: WorkerConfig) -> Result<InstallOutcome> {
        config.validate()?;

        let worker = Arc::new(Worker::new(
            config,
            WorkerDeps {
                store: Arc::clone(&self.store),
                network: Arc::clone(&self.network),
                clients: Arc::clone(&self.clients),
                refresh: Arc::clone(&self.refresh),
                events: self.events.clone(),
            },
        ));
        self.slots.lock().await.installing = Some(Arc::clone(&worker));

        let install = match worker.on_install().await {
            Ok(report) => report,
            Err(e) => {
                warn!(version = %worker.version(), error = %e, "Install failed");
                self.slots.lock().await.installing = None;
                worker.set_state(GenerationState::Superseded);
                return Err(e);
            }
        };

        let activate_now = {
            let mut slots = self.slots.lock().await;
            slots.installing = None;
            if let Some(previous) = slots.waiting.replace(Arc::clone(&worker)) {
                debug!(version = %previous.version(), "Waiting generation replaced");
                previous.set_state(GenerationState::Superseded);
            }
            worker.skip_waiting_requested() || slots.active.is_none()
        };

        let activation = if activate_now {
            self.activate().await?
        } else {
            info!(version = %worker.version(), "Generation waiting for activation");
            None
        };

        Ok(InstallOutcome {
            install,
            activation,
        })
    }

    /// Promote the waiting generation. Returns `None` when nothing waits.
    pub async fn activate(&self) -> Result<Option<ActivateReport>> {
        let mut slots = self.slots.lock().await;
        let Some(next) = slots.waiting.take() else {
            return Ok(None);
        };

        if let Some(previous) = slots.active.take() {
            previous.retire().await;
            info!(from = %previous.version(), to = %next.version(), "Superseding generation");
        }

        let report = match next.on_activate().await {
            Ok(report) => report,
            Err(e) => {
                next.set_state(GenerationState::Superseded);
                return Err(e);
            }
        };

        if let Some(interval) = next.config().periodic_sync_interval() {
            next.set_periodic(spawn_periodic_refresh(Arc::clone(&next), interval));
        }

        let _ = self.events.send(RegistrationEvent::ControllerChange {
            version: next.version().to_string(),
        });
        slots.active = Some(next);
        Ok(Some(report))
    }

    /// Activate the waiting generation now, if there is one.
    pub async fn skip_waiting(&self) -> Result<Option<ActivateReport>> {
        let Some(waiting) = self.waiting().await else {
            debug!("No waiting generation to activate");
            return Ok(None);
        };
        let mut lifetime = ExtendableEvent::new(EventKind::Message);
        waiting.on_message(ControlMessage::SkipWaiting, &mut lifetime).await;
        self.activate().await
    }

    // ==================== Events ====================

    /// Route a page request. With no active generation the request goes
    /// straight to the network.
    pub async fn handle_fetch(&self, request: Request) -> EventHandle {
        let mut lifetime = ExtendableEvent::new(EventKind::Fetch);
        let response = match self.controller().await {
            Some(worker) => worker.on_fetch(&request, &mut lifetime).await,
            None => self.fetch_uncontrolled(&request).await,
        };
        EventHandle::new(EventOutcome::Response(response), lifetime)
    }

    /// Deliver a control message from a page. `SKIP_WAITING` goes to the
    /// waiting generation; `CLEAR_CACHE` is fire-and-forget for the page and
    /// completes when the returned handle settles.
    pub async fn post_message(&self, message: ControlMessage) -> Result<EventHandle> {
        match message {
            ControlMessage::SkipWaiting => {
                let report = self.skip_waiting().await?;
                Ok(EventHandle::completed(
                    EventKind::Message,
                    EventOutcome::Activated(report),
                ))
            }
            ControlMessage::ClearCache => {
                let mut lifetime = ExtendableEvent::new(EventKind::Message);
                match self.controller().await {
                    Some(worker) => worker.on_message(message, &mut lifetime).await,
                    None => schedule_clear(Arc::clone(&self.store), &mut lifetime),
                }
                Ok(EventHandle::new(EventOutcome::Handled, lifetime))
            }
        }
    }

    /// Parse and deliver a raw control message.
    pub async fn post_message_json(&self, json: &str) -> Result<EventHandle> {
        self.post_message(ControlMessage::from_json(json)?).await
    }

    /// Report a connectivity change to the active generation.
    pub async fn set_online(&self, online: bool) -> EventHandle {
        let mut lifetime = ExtendableEvent::new(EventKind::Connectivity);
        let reached = match self.controller().await {
            Some(worker) => worker.on_connectivity_change(online, &mut lifetime).await,
            None => 0,
        };
        EventHandle::new(EventOutcome::Broadcast(reached), lifetime)
    }

    pub async fn sync(&self, tag: &str) -> EventHandle {
        let ran = match self.controller().await {
            Some(worker) => worker.on_sync(tag).await,
            None => false,
        };
        EventHandle::completed(EventKind::Sync, EventOutcome::Refreshed(ran))
    }

    pub async fn periodic_sync(&self, tag: &str) -> EventHandle {
        let ran = match self.controller().await {
            Some(worker) => worker.on_periodic_sync(tag).await,
            None => false,
        };
        EventHandle::completed(EventKind::PeriodicSync, EventOutcome::Refreshed(ran))
    }

    pub async fn push(&self, payload: Option<&[u8]>) -> Result<EventHandle> {
        let worker = self.require_controller().await?;
        let notification = worker.on_push(payload).await;
        Ok(EventHandle::completed(
            EventKind::Push,
            EventOutcome::Notified(notification),
        ))
    }

    pub async fn notification_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<EventHandle> {
        let worker = self.require_controller().await?;
        let opened = worker.on_notification_click(notification, action).await?;
        Ok(EventHandle::completed(
            EventKind::NotificationClick,
            EventOutcome::Opened(opened),
        ))
    }

    /// Dispatch any inbound event to its handler.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventHandle> {
        let kind = event.kind();
        debug!(event = %kind, "Dispatching");
        match event {
            WorkerEvent::Install(config) => {
                let outcome = self.install(*config).await?;
                Ok(EventHandle::completed(kind, EventOutcome::Installed(outcome)))
            }
            WorkerEvent::Activate => {
                let report = self.activate().await?;
                Ok(EventHandle::completed(kind, EventOutcome::Activated(report)))
            }
            WorkerEvent::Fetch(request) => Ok(self.handle_fetch(request).await),
            WorkerEvent::Message(message) => self.post_message(message).await,
            WorkerEvent::Sync { tag } => Ok(self.sync(&tag).await),
            WorkerEvent::PeriodicSync { tag } => Ok(self.periodic_sync(&tag).await),
            WorkerEvent::Push { payload } => self.push(payload.as_deref()).await,
            WorkerEvent::NotificationClick {
                notification,
                action,
            } => self.notification_click(&notification, action.as_deref()).await,
            WorkerEvent::Online => Ok(self.set_online(true).await),
            WorkerEvent::Offline => Ok(self.set_online(false).await),
        }
    }

    async fn fetch_uncontrolled(&self, request: &Request) -> Result<FetchResponse> {
        let timeout = request.timeout.or(self.network_timeout);
        let response = with_timeout(timeout, || self.network.fetch(request))
            .await
            .map_err(NetError::from)??;
        Ok(FetchResponse::from_network(&response))
    }

    async fn require_controller(&self) -> Result<Arc<Worker>> {
        self.controller()
            .await
            .ok_or_else(|| SwError::InvalidState("no active generation".to_string()))
    }
}
