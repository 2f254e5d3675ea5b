//! Worker events and their keep-alive handles.
//!
//! A handler that starts background work (storing a response, purging
//! buckets, refreshing data) registers it on the event's
//! [`ExtendableEvent`]. The runtime must await [`ExtendableEvent::settled`]
//! before it tears the worker down, otherwise that work is cut short.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use shellcache_net::Request;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::control::ControlMessage;
use crate::fetch::FetchResponse;
use crate::lifecycle::{ActivateReport, InstallOutcome};
use crate::push::Notification;
use crate::SwError;

/// Kind of event delivered to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    Sync,
    PeriodicSync,
    Push,
    NotificationClick,
    Connectivity,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Install => "install",
            EventKind::Activate => "activate",
            EventKind::Fetch => "fetch",
            EventKind::Message => "message",
            EventKind::Sync => "sync",
            EventKind::PeriodicSync => "periodicsync",
            EventKind::Push => "push",
            EventKind::NotificationClick => "notificationclick",
            EventKind::Connectivity => "connectivity",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== Extendable Event ====================

/// Work an event handler started and that must finish before teardown.
#[derive(Debug)]
pub struct ExtendableEvent {
    kind: EventKind,
    pending: Vec<JoinHandle<()>>,
}

impl ExtendableEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            pending: Vec::new(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Extend the event's lifetime until `work` completes. Must be called
    /// from within a tokio runtime.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.push(tokio::spawn(work));
    }

    /// Number of registered tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every registered task.
    pub async fn settled(mut self) {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(event = %self.kind, error = %e, "Extended work did not complete");
            }
        }
        if count > 0 {
            debug!(event = %self.kind, tasks = count, "Event settled");
        }
    }
}

impl Drop for ExtendableEvent {
    fn drop(&mut self) {
        let unfinished = self.pending();
        if unfinished > 0 {
            warn!(
                event = %self.kind,
                unfinished,
                "Event dropped before its work settled; work continues detached"
            );
        }
    }
}

// ==================== Dispatch ====================

/// An inbound event for the registration's dispatch table.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Install a new generation.
    Install(Box<WorkerConfig>),
    /// Activate the waiting generation.
    Activate,
    /// A request from a page.
    Fetch(Request),
    /// A control message from a page.
    Message(ControlMessage),
    /// Reconnect-triggered background sync.
    Sync { tag: String },
    /// Scheduled background sync.
    PeriodicSync { tag: String },
    /// A push message, with its raw payload if any.
    Push { payload: Option<Bytes> },
    /// The user clicked a notification or one of its actions.
    NotificationClick {
        notification: Notification,
        action: Option<String>,
    },
    /// Connectivity came back.
    Online,
    /// Connectivity was lost.
    Offline,
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install(_) => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message(_) => EventKind::Message,
            WorkerEvent::Sync { .. } => EventKind::Sync,
            WorkerEvent::PeriodicSync { .. } => EventKind::PeriodicSync,
            WorkerEvent::Push { .. } => EventKind::Push,
            WorkerEvent::NotificationClick { .. } => EventKind::NotificationClick,
            WorkerEvent::Online | WorkerEvent::Offline => EventKind::Connectivity,
        }
    }
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallOutcome),
    /// `None` when there was no waiting generation to activate.
    Activated(Option<ActivateReport>),
    Response(Result<FetchResponse, SwError>),
    /// Whether the sync tag was recognised and the refresh ran.
    Refreshed(bool),
    Notified(Notification),
    /// The window opened by a notification action, if any.
    Opened(Option<Url>),
    /// Number of pages that received a connectivity notice.
    Broadcast(usize),
    Handled,
}

impl EventOutcome {
    /// The fetch response, or an `InvalidState` error for other outcomes.
    pub fn into_response(self) -> Result<FetchResponse, SwError> {
        match self {
            EventOutcome::Response(response) => response,
            other => Err(SwError::InvalidState(format!(
                "expected a fetch response, got {other:?}"
            ))),
        }
    }
}

/// Result of dispatching one event: its outcome plus the work still running
/// on its behalf.
#[derive(Debug)]
pub struct EventHandle {
    pub outcome: EventOutcome,
    pub lifetime: ExtendableEvent,
}

impl EventHandle {
    pub fn new(outcome: EventOutcome, lifetime: ExtendableEvent) -> Self {
        Self { outcome, lifetime }
    }

    /// A handle with nothing left running.
    pub fn completed(kind: EventKind, outcome: EventOutcome) -> Self {
        Self::new(outcome, ExtendableEvent::new(kind))
    }

    pub fn kind(&self) -> EventKind {
        self.lifetime.kind()
    }

    /// Wait for the event's extended work, then hand back the outcome.
    pub async fn settled(self) -> EventOutcome {
        self.lifetime.settled().await;
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_settled_waits_for_all_work() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut event = ExtendableEvent::new(EventKind::Fetch);

        for delay in [5u64, 15, 25] {
            let done = Arc::clone(&done);
            event.wait_until(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        event.settled().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_work_does_not_poison_settle() {
        let mut event = ExtendableEvent::new(EventKind::Message);
        event.wait_until(async { panic!("store exploded") });
        event.wait_until(async {});
        event.settled().await;
    }

    #[tokio::test]
    async fn test_handle_settles_before_returning_outcome() {
        let flag = Arc::new(AtomicUsize::new(0));
        let mut lifetime = ExtendableEvent::new(EventKind::Sync);
        let f = Arc::clone(&flag);
        lifetime.wait_until(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.store(1, Ordering::SeqCst);
        });

        let handle = EventHandle::new(EventOutcome::Refreshed(true), lifetime);
        assert_eq!(handle.kind(), EventKind::Sync);
        let outcome = handle.settled().await;
        assert!(matches!(outcome, EventOutcome::Refreshed(true)));
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_response_rejects_other_outcomes() {
        assert!(matches!(
            EventOutcome::Handled.into_response(),
            Err(SwError::InvalidState(_))
        ));
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(WorkerEvent::Activate.kind(), EventKind::Activate);
        assert_eq!(WorkerEvent::Offline.kind(), EventKind::Connectivity);
        assert_eq!(EventKind::PeriodicSync.to_string(), "periodicsync");
    }
}
