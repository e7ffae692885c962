//! Async façade over [`SyncState`] for runtime-hosted callers.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::alerts::{StoreAlert, StoreAlerts};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{Event, FileId};
use crate::state::{MaintenanceReport, SyncState};

/// Thread-safe handle that runs store work on the blocking pool.
#[derive(Clone)]
pub struct SyncStateService {
    state: Arc<SyncState>,
}

impl SyncStateService {
    /// Open the stores under `config.data_dir` without blocking the runtime.
    pub async fn open(config: StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let state = tokio::task::spawn_blocking(move || SyncState::open(config, alerts))
            .await
            .map_err(|error| Error::Database(format!("store task failed: {error}")))??;
        Ok(Self::from_state(state))
    }

    /// Wrap an already opened state (primarily for tests).
    pub fn from_state(state: SyncState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub const fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    /// Run `f` against the state on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SyncState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || f(&state))
            .await
            .map_err(|error| Error::Database(format!("store task failed: {error}")))?
    }

    pub async fn share_size(&self) -> Result<i64> {
        self.run(|state| state.events().get_share_size()).await
    }

    /// Delete unreferenced copies and their blobs.
    pub async fn clean_copies(&self) -> Result<Vec<String>> {
        self.run(|state| state.copies().clean_unreferenced()).await
    }

    /// See [`SyncState::record_move_to_future_path`].
    pub async fn record_move_to_future_path(
        &self,
        file_id: FileId,
        folder_path: String,
        name: String,
    ) -> Result<Event> {
        self.run(move |state| state.record_move_to_future_path(file_id, &folder_path, &name))
            .await
    }

    pub async fn startup_maintenance(&self) -> Result<MaintenanceReport> {
        self.run(SyncState::startup_maintenance).await
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<StoreAlert> {
        self.state.alerts().subscribe()
    }
}
