//! Control channel contracts between pages and the worker.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::SwError;

/// Command sent by a page to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate the waiting generation now.
    SkipWaiting,
    /// Delete every bucket of every generation.
    ClearCache,
}

impl ControlMessage {
    /// Parse `{"type": "..."}` as sent by a page.
    pub fn from_json(json: &str) -> Result<Self, SwError> {
        serde_json::from_str(json).map_err(|e| SwError::InvalidMessage(format!("{e}: {json}")))
    }
}

/// Notice broadcast by the worker to every open page. Best effort: pages
/// that are not open never see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerNotice {
    Online { message: String },
    Offline { message: String },
}

impl WorkerNotice {
    pub fn to_json(&self) -> Result<String, SwError> {
        serde_json::to_string(self).map_err(|e| SwError::InvalidMessage(e.to_string()))
    }

    pub fn message(&self) -> &str {
        match self {
            WorkerNotice::Online { message } | WorkerNotice::Offline { message } => message,
        }
    }
}

/// Last known connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Unknown = 0,
    Online = 1,
    Offline = 2,
}

impl Connectivity {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Connectivity::Online,
            2 => Connectivity::Offline,
            _ => Connectivity::Unknown,
        }
    }
}

/// Atomic cell holding a [`Connectivity`].
#[derive(Debug)]
pub(crate) struct ConnectivityCell(AtomicU8);

impl ConnectivityCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Connectivity::Unknown as u8))
    }

    pub(crate) fn load(&self) -> Connectivity {
        Connectivity::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Store `next`, returning the previous value.
    pub(crate) fn swap(&self, next: Connectivity) -> Connectivity {
        Connectivity::from_u8(self.0.swap(next as u8, Ordering::SeqCst))
    }
}
