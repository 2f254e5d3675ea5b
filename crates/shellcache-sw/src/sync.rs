//! Background refresh under the configured sync tag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shellcache_net::Network;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::WorkerConfig;
use crate::lifecycle::GenerationState;
use crate::worker::Worker;

/// What woke the refresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Reconnect-triggered sync.
    Sync,
    /// Scheduled tick.
    Periodic,
    /// Connectivity came back while the worker was running.
    Reconnect,
}

/// Everything a refresh job may touch.
#[derive(Clone)]
pub struct RefreshContext {
    pub config: Arc<WorkerConfig>,
    pub store: Arc<dyn CacheStore>,
    pub network: Arc<dyn Network>,
    pub trigger: RefreshTrigger,
}

/// The deferred refresh. Errors are logged by the worker and never reach
/// the caller, so a job may run without network access.
#[async_trait]
pub trait RefreshJob: Send + Sync {
    async fn run(&self, ctx: RefreshContext) -> crate::Result<()>;
}

/// Refresh that only records that it ran.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRefresh;

#[async_trait]
impl RefreshJob for NoopRefresh {
    async fn run(&self, ctx: RefreshContext) -> crate::Result<()> {
        info!(
            version = %ctx.config.version,
            trigger = ?ctx.trigger,
            bucket = %ctx.config.dynamic_bucket(),
            "Background refresh requested"
        );
        Ok(())
    }
}

/// Run the worker's periodic refresh every `interval` until the worker is
/// superseded. The first run happens one interval after the call.
pub fn spawn_periodic_refresh(worker: Arc<Worker>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tag = worker.config().sync_tag.clone();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if worker.state() == GenerationState::Superseded {
                debug!(version = %worker.version(), "Periodic refresh stopped");
                break;
            }
            worker.on_periodic_sync(&tag).await;
        }
    })
}
