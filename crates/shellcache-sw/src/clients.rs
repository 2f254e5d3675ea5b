//! Open page instances and the messages the worker sends them.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::control::WorkerNotice;

/// Identifier of an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Message delivered to a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// A control-channel notice (`ONLINE` / `OFFLINE`).
    Notice(WorkerNotice),
    /// The page is now controlled by generation `version`.
    ControllerChange { version: String },
}

/// A page instance.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Version of the generation controlling this page.
    pub controller: Option<String>,
    sender: mpsc::UnboundedSender<ClientEvent>,
}

/// Registry of open pages.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page. Dropping the receiver counts as closing the page.
    pub async fn connect(&self, url: Url) -> (ClientId, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(client = id.raw(), url = %url, "Page connected");
        self.clients.write().await.insert(
            id,
            Client {
                id,
                url,
                controller: None,
                sender,
            },
        );
        (id, receiver)
    }

    /// Forget a page.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Take control of every open page. Returns how many pages changed
    /// controller.
    pub async fn claim(&self, version: &str) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut() {
            if client.controller.as_deref() == Some(version) {
                continue;
            }
            client.controller = Some(version.to_string());
            let _ = client.sender.send(ClientEvent::ControllerChange {
                version: version.to_string(),
            });
            claimed += 1;
        }
        debug!(version, claimed, "Clients claimed");
        claimed
    }

    /// Send `event` to every open page. Pages whose receiver is gone are
    /// removed. Returns the number of pages reached.
    pub async fn broadcast(&self, event: ClientEvent) -> usize {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, client| client.sender.send(event.clone()).is_ok());
        let reached = clients.len();
        if reached < before {
            trace!(closed = before - reached, "Dropped closed pages");
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://app.test/").unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let clients = Clients::new();
        let (id, _rx) = clients.connect(page()).await;
        assert_eq!(clients.len().await, 1);
        assert!(clients.get(id).await.is_some());
        assert!(clients.disconnect(id).await);
        assert!(clients.is_empty().await);
    }

    #[tokio::test]
    async fn test_claim_sets_controller_once() {
        let clients = Clients::new();
        let (id, mut rx) = clients.connect(page()).await;

        assert_eq!(clients.claim("v1").await, 1);
        assert_eq!(clients.claim("v1").await, 0);
        assert_eq!(clients.get(id).await.unwrap().controller.as_deref(), Some("v1"));
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::ControllerChange { version: "v1".into() })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_pages() {
        let clients = Clients::new();
        let (_a, mut rx_a) = clients.connect(page()).await;
        let (_b, rx_b) = clients.connect(page()).await;
        drop(rx_b);

        let notice = ClientEvent::Notice(WorkerNotice::Offline {
            message: "offline".into(),
        });
        assert_eq!(clients.broadcast(notice.clone()).await, 1);
        assert_eq!(clients.len().await, 1);
        assert_eq!(rx_a.recv().await, Some(notice));
    }
}
