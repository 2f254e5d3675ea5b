//! # shellcache worker
//!
//! The offline cache controller that sits between an app's pages and the
//! network. Every request the page makes is routed through the active
//! generation's fetch policy, which answers from the network or from a
//! versioned local store.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the manifest), waiting, activate
//!   (garbage-collect stale buckets, claim pages), superseded
//! - **Fetch policies**: cache-first for cross-origin assets, network-first
//!   with cache and shell fallback for same-origin traffic
//! - **Control channel**: `SKIP_WAITING` / `CLEAR_CACHE` from the page,
//!   `ONLINE` / `OFFLINE` notices back to every open page
//! - **Background refresh**: sync and periodic-sync hook under a fixed tag
//! - **Push**: payload parsing and notification actions
//!
//! ## Architecture
//!
//! ```text
//! Registration (runtime shim)
//!     │
//!     ├── installing / waiting / active (Worker, one per generation)
//!     │       ├── FetchPolicy ──► Network
//!     │       └── RefreshJob
//!     │
//!     ├── Clients (open pages) ◄── ClientEvent
//!     │
//!     └── CacheStore
//!             └── bucket "{prefix}-static-{version}" / "{prefix}-dynamic-{version}"
//!                     └── RequestKey → CacheEntry
//! ```

use shellcache_common::CommonError;
use shellcache_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod control;
pub mod event;
pub mod fetch;
pub mod lifecycle;
pub mod push;
pub mod sync;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, CacheStore, MemoryCacheStore, RequestKey};
pub use clients::{ClientEvent, ClientId, Clients};
pub use config::WorkerConfig;
pub use control::{Connectivity, ControlMessage, WorkerNotice};
pub use event::{EventHandle, EventKind, EventOutcome, ExtendableEvent, WorkerEvent};
pub use fetch::{FetchPolicy, FetchResponse, ResponseSource, Strategy};
pub use lifecycle::{
    ActivateReport, GenerationState, InstallOutcome, InstallReport, Registration,
    RegistrationEvent,
};
pub use push::{Notification, NotificationAction, PushPayload};
pub use sync::{spawn_periodic_refresh, NoopRefresh, RefreshContext, RefreshJob, RefreshTrigger};
pub use worker::{Worker, WorkerDeps};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    /// The network failure, re-raised when no fallback applies.
    #[error(transparent)]
    Network(#[from] NetError),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Generation {version} is not active")]
    NotActive { version: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl SwError {
    /// Short category name, used as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            SwError::Network(e) => e.category(),
            SwError::Common(e) => e.category(),
            SwError::NotActive { .. } => "not_active",
            SwError::InvalidState(_) => "invalid_state",
            SwError::InvalidMessage(_) => "invalid_message",
        }
    }
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, SwError>;
