//! Cross-cutting store alerts.
//!
//! Conditions that every caller should react to the same way (pause sync,
//! show a disk-full banner) are broadcast here in addition to being returned
//! as errors from the failing call.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const ALERT_CAPACITY: usize = 64;

/// Which database raised the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Events,
    Storage,
    Copies,
}

impl StoreKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Storage => "storage",
            Self::Copies => "copies",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreAlertKind {
    /// Database or disk is full
    StorageExhausted,
    /// A lock could not be acquired in time
    Busy,
    /// The data directory or copies directory disappeared
    RootUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAlert {
    pub kind: StoreAlertKind,
    pub store: StoreKind,
}

/// Cloneable sender side of the alert channel
#[derive(Debug, Clone)]
pub struct StoreAlerts {
    sender: broadcast::Sender<StoreAlert>,
}

impl StoreAlerts {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(ALERT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreAlert> {
        self.sender.subscribe()
    }

    /// Broadcast an alert. Having no subscribers is fine.
    pub fn emit(&self, kind: StoreAlertKind, store: StoreKind) {
        tracing::warn!(store = store.as_str(), ?kind, "Store alert");
        let _ = self.sender.send(StoreAlert { kind, store });
    }
}

impl Default for StoreAlerts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_alerts() {
        let alerts = StoreAlerts::new();
        let mut receiver = alerts.subscribe();

        alerts.emit(StoreAlertKind::StorageExhausted, StoreKind::Copies);

        let alert = receiver.try_recv().unwrap();
        assert_eq!(alert.kind, StoreAlertKind::StorageExhausted);
        assert_eq!(alert.store, StoreKind::Copies);
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        let alerts = StoreAlerts::default();
        alerts.emit(StoreAlertKind::Busy, StoreKind::Events);
    }
}
