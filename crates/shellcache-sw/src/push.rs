//! Push payloads and the notifications rendered from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::WorkerConfig;

/// Action id that opens the app's root page.
pub const ACTION_VIEW: &str = "view";
/// Action id that only dismisses the notification.
pub const ACTION_CLOSE: &str = "close";

/// Body of a push message. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub data: Option<Value>,
}

impl PushPayload {
    /// Parse a raw payload. A missing payload yields the defaults; a payload
    /// that is not a JSON object is taken as the notification body.
    pub fn parse(raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return Self::default();
        };

        match serde_json::from_slice::<PushPayload>(raw) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON, using it as text");
                let text = String::from_utf8_lossy(raw).trim().to_string();
                Self {
                    body: (!text.is_empty()).then_some(text),
                    ..Self::default()
                }
            }
        }
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// Notification shown for a push message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub data: Option<Value>,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    /// Render `payload`, filling gaps from the config's defaults.
    pub fn from_payload(payload: PushPayload, config: &WorkerConfig) -> Self {
        Self {
            title: payload
                .title
                .unwrap_or_else(|| config.notification_title.clone()),
            body: payload
                .body
                .unwrap_or_else(|| config.notification_body.clone()),
            icon: payload
                .icon
                .unwrap_or_else(|| config.notification_icon.clone()),
            badge: config.notification_badge.clone(),
            data: payload.data,
            actions: vec![
                NotificationAction {
                    action: ACTION_VIEW.to_string(),
                    title: "View".to_string(),
                },
                NotificationAction {
                    action: ACTION_CLOSE.to_string(),
                    title: "Close".to_string(),
                },
            ],
        }
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.action == action)
    }
}
