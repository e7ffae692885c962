//! The local sync state: the three stores opened over one data directory.

use serde::Serialize;

use crate::alerts::StoreAlerts;
use crate::config::StoreConfig;
use crate::copies::CopyStore;
use crate::error::{Error, Result};
use crate::events::EventStore;
use crate::index::KnownFileIndex;
use crate::models::{Event, FileId, NewEvent};
use crate::util::{normalize_relative_path, split_path};

/// Handle owning the event store, known-file index and copy store
pub struct SyncState {
    config: StoreConfig,
    alerts: StoreAlerts,
    events: EventStore,
    index: KnownFileIndex,
    copies: CopyStore,
}

/// What a startup maintenance pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub orphan_blobs: usize,
    pub stale_events: usize,
}

/// Summary counters for inspection tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateStatus {
    pub max_server_event_id: i64,
    pub max_checked_server_event_id: i64,
    pub local_events_processed: bool,
    pub known_files: i64,
    pub share_size: i64,
}

impl SyncState {
    /// Open (creating and migrating as needed) every store under
    /// `config.data_dir`
    pub fn open(config: StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let events = EventStore::open(config.events_db_path(), &config, alerts.clone())?;
        let index = KnownFileIndex::open(config.storage_db_path(), &config, alerts.clone())?;
        let copies = CopyStore::open(&config, alerts.clone())?;
        tracing::info!(data_dir = %config.data_dir.display(), "Opened sync state");
        Ok(Self {
            config,
            alerts,
            events,
            index,
            copies,
        })
    }

    /// Databases in memory; blobs still go under `config.data_dir`
    pub fn open_in_memory(config: StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let events = EventStore::open_in_memory(&config, alerts.clone())?;
        let index = KnownFileIndex::open_in_memory(&config, alerts.clone())?;
        let copies = CopyStore::open_in_memory(&config, alerts.clone())?;
        Ok(Self {
            config,
            alerts,
            events,
            index,
            copies,
        })
    }

    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub const fn alerts(&self) -> &StoreAlerts {
        &self.alerts
    }

    pub const fn events(&self) -> &EventStore {
        &self.events
    }

    pub const fn index(&self) -> &KnownFileIndex {
        &self.index
    }

    pub const fn copies(&self) -> &CopyStore {
        &self.copies
    }

    /// Drop orphan blobs, then remote events that can't be applied anymore
    pub fn startup_maintenance(&self) -> Result<MaintenanceReport> {
        let orphan_blobs = self.copies.reconcile_with_filesystem()?;
        let stale_events = self.events.delete_remote_events_not_applied()?;
        let report = MaintenanceReport {
            orphan_blobs,
            stale_events,
        };
        tracing::info!(?report, "Startup maintenance finished");
        Ok(report)
    }

    /// Record a local move of `file_id` into the folder that `folder_path`
    /// will name once every confirmed move is applied. An empty path is the
    /// root.
    ///
    /// Prediction and recording run under the event store's soft lock; a
    /// contended lock fails with [`Error::StoreBusy`] and records nothing.
    pub fn record_move_to_future_path(
        &self,
        file_id: FileId,
        folder_path: &str,
        name: &str,
    ) -> Result<Event> {
        let _lock = self.events.soft_lock()?;

        let folder_uuid = if split_path(folder_path).is_empty() {
            None
        } else {
            let folder = self
                .events
                .find_folders_by_future_path(folder_path, false)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::FolderNotFound(normalize_relative_path(folder_path)))?;
            let uuid = folder
                .uuid
                .ok_or_else(|| Error::FileInProcessing(normalize_relative_path(folder_path)))?;
            Some(uuid)
        };

        let event = self
            .events
            .record_event(file_id, NewEvent::moved(name, folder_uuid))?;
        tracing::debug!(%file_id, %folder_path, event_id = %event.id, "Recorded move to future path");
        Ok(event)
    }

    pub fn status(&self) -> Result<StateStatus> {
        Ok(StateStatus {
            max_server_event_id: self.events.get_max_server_event_id()?,
            max_checked_server_event_id: self.events.get_max_checked_server_event_id()?,
            local_events_processed: self.events.all_local_events_processed()?,
            known_files: self.index.count()?,
            share_size: self.events.get_share_size()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::alerts::StoreAlertKind;
    use crate::models::{KnownFile, NewFile};

    #[test]
    fn opens_layout_under_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path().join("data"));
        let state = SyncState::open(config.clone(), StoreAlerts::new()).unwrap();

        assert!(config.events_db_path().exists());
        assert!(config.storage_db_path().exists());
        assert!(config.copies_db_path().exists());
        assert_eq!(state.config(), &config);
    }

    #[test]
    fn rename_keeps_identity_and_copy() {
        let dir = TempDir::new().unwrap();
        let state = SyncState::open(StoreConfig::new(dir.path()), StoreAlerts::new()).unwrap();
        let events = state.events();

        let folder = events.create_file(&NewFile::folder("A", None)).unwrap();
        let created = events
            .record_event(folder.id, NewEvent::create("A", None))
            .unwrap();
        events.register_event(created.id, 1, Some("fa")).unwrap();

        let hash = state.copies().import_bytes(b"contents of b").unwrap();
        let file = events
            .create_file(&NewFile::file("b.txt", Some(folder.id)))
            .unwrap();
        events
            .record_event(
                file.id,
                NewEvent::create("b.txt", Some("fa".into())).with_content(&hash, 13),
            )
            .unwrap();
        state.copies().add_reference(&hash, "create", false).unwrap();
        state
            .index()
            .upsert(&KnownFile::file("A/b.txt", &hash, 1, 13).with_file_id(file.id))
            .unwrap();

        assert!(state.copies().copy_exists(&hash).unwrap());
        assert_eq!(state.copies().reference_count(&hash).unwrap(), Some(1));

        events.record_event(folder.id, NewEvent::moved("B", None)).unwrap();
        state.index().move_subtree("A", "B").unwrap();

        assert_eq!(events.find_file_by_relative_path("/B/b.txt").unwrap().id, file.id);
        assert!(events.find_file_by_relative_path("/A/b.txt").unwrap_err().is_not_found());
        assert_eq!(
            state.index().get("B/b.txt").unwrap().unwrap().events_file_id,
            Some(file.id)
        );
    }

    #[test]
    fn startup_maintenance_reports_removals() {
        let dir = TempDir::new().unwrap();
        let state = SyncState::open(StoreConfig::new(dir.path()), StoreAlerts::new()).unwrap();
        state.copies().import_bytes(b"orphan").unwrap();

        let placeholder = state
            .events()
            .create_file(&NewFile::file("r", None).with_uuid("fr"))
            .unwrap();
        state
            .events()
            .record_event(
                placeholder.id,
                NewEvent::create("r", None).received().with_server_event_id(1),
            )
            .unwrap();

        let report = state.startup_maintenance().unwrap();
        assert_eq!(
            report,
            MaintenanceReport {
                orphan_blobs: 1,
                stale_events: 1,
            }
        );

        let status = state.status().unwrap();
        assert_eq!(status.max_server_event_id, 0);
        assert!(status.local_events_processed);
    }

    /// `A` confirmed at the root, with a confirmed but not yet applied rename
    /// to `Z`; `x` a local file at the root.
    fn pending_rename(state: &SyncState) -> (FileId, FileId) {
        let events = state.events();
        let folder = events.create_file(&NewFile::folder("A", None)).unwrap();
        let created = events
            .record_event(folder.id, NewEvent::create("A", None))
            .unwrap();
        events.register_event(created.id, 1, Some("fa")).unwrap();
        events
            .record_event(
                folder.id,
                NewEvent::moved("Z", None).received().with_server_event_id(2),
            )
            .unwrap();

        let file = events.create_file(&NewFile::file("x", None)).unwrap();
        events
            .record_event(file.id, NewEvent::create("x", None).with_content("hx", 3))
            .unwrap();
        (folder.id, file.id)
    }

    #[test]
    fn move_follows_future_path() {
        let state = SyncState::open_in_memory(StoreConfig::new("unused"), StoreAlerts::new()).unwrap();
        let (_, file) = pending_rename(&state);

        let event = state.record_move_to_future_path(file, "Z", "x").unwrap();
        assert_eq!(event.folder_uuid.as_deref(), Some("fa"));
        assert_eq!(state.events().path_of(file).unwrap(), "A/x");

        assert!(matches!(
            state.record_move_to_future_path(file, "Missing", "x"),
            Err(Error::FolderNotFound(_))
        ));
    }

    #[test]
    fn future_path_move_waits_for_soft_lock() {
        let config = StoreConfig::new("unused")
            .with_soft_lock_timeout(Duration::from_millis(50))
            .with_soft_lock_poll_interval(Duration::from_millis(5));
        let alerts = StoreAlerts::new();
        let mut received = alerts.subscribe();
        let state = SyncState::open_in_memory(config, alerts).unwrap();
        let (folder, file) = pending_rename(&state);
        let before = state.events().get_file_events(file).unwrap().len();
        let other = state.events().create_file(&NewFile::file("y", None)).unwrap();
        state
            .events()
            .record_event(other.id, NewEvent::create("y", None))
            .unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        std::thread::scope(|scope| {
            let holder = scope.spawn(|| {
                let release_rx = release_rx;
                let events = state.events();
                let _lock = events.soft_lock().unwrap();
                let target = events.find_folders_by_future_path("Z", false).unwrap();
                assert_eq!(target[0].id, folder);
                events
                    .record_event(other.id, NewEvent::moved("y", target[0].uuid.clone()))
                    .unwrap();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
            locked_rx.recv().unwrap();

            assert!(matches!(
                state.record_move_to_future_path(file, "Z", "x"),
                Err(Error::StoreBusy)
            ));
            assert_eq!(received.try_recv().unwrap().kind, StoreAlertKind::Busy);
            assert_eq!(state.events().get_file_events(file).unwrap().len(), before);

            release_tx.send(()).unwrap();
            holder.join().unwrap();
        });

        assert!(state.record_move_to_future_path(file, "Z", "x").is_ok());
    }
}
