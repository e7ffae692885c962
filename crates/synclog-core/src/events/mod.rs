//! Event store: the append-only event log and the tree it reconstructs.
//!
//! Nodes are never renamed or re-parented directly. Every change is an
//! [`Event`]; a node's name, parent and content follow from its current
//! event. Local events (`occurred`/`conflicted`) become current as soon as
//! they are recorded, remote ones when [`EventStore::apply_event`] runs.

mod lock;
mod maintenance;
mod resolve;
pub(crate) mod rows;

use std::path::Path;

use parking_lot::ReentrantMutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::alerts::{StoreAlerts, StoreKind};
use crate::config::StoreConfig;
use crate::db::{migrations, Database};
use crate::error::{Error, Result};
use crate::models::{
    new_event_uuid, Event, EventId, EventState, EventType, File, FileId, NewEvent, NewFile,
};
use crate::util::now_millis;

pub use lock::SoftLockGuard;
pub use maintenance::FileWalk;

use rows::{
    conflicting_name_exists, ensure_server_event_id_free, get_event, get_file, parent_uuid,
    query_events, require_file, resolve_folder_uuid, EVENT_COLUMNS,
};

/// The event log and tree database
pub struct EventStore {
    db: Database,
    soft_lock: ReentrantMutex<()>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let db = Database::open(path, &migrations::EVENTS, StoreKind::Events, config, alerts)?;
        Ok(Self::with_database(db))
    }

    pub fn open_in_memory(config: &StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let db = Database::open_in_memory(&migrations::EVENTS, StoreKind::Events, config, alerts)?;
        Ok(Self::with_database(db))
    }

    fn with_database(db: Database) -> Self {
        Self {
            db,
            soft_lock: ReentrantMutex::new(()),
        }
    }

    pub(crate) const fn database(&self) -> &Database {
        &self.db
    }

    /// Insert a tree node without a current event
    pub fn create_file(&self, file: &NewFile) -> Result<File> {
        self.db.write(|tx| {
            if let Some(uuid) = file.uuid.as_deref() {
                if rows::get_file_by_uuid(tx, uuid)?.is_some() {
                    return Err(Error::InvalidInput(format!(
                        "file uuid '{uuid}' is already in use"
                    )));
                }
            }
            tx.execute(
                "INSERT INTO files (folder_id, name, uuid, is_folder, ignored, is_collaborated, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    file.folder_id.map(|id| id.0),
                    file.name,
                    file.uuid,
                    file.is_folder,
                    file.ignored,
                    file.is_collaborated,
                    now_millis(),
                ],
            )?;
            let id = FileId(tx.last_insert_rowid());
            tracing::debug!(%id, name = %file.name, "Created file");
            require_file(tx, id)
        })
    }

    /// Append an event for `file_id`.
    ///
    /// Missing attributes are filled from the node's current state. Local
    /// events are applied to the tree in the same transaction; a failure
    /// leaves nothing recorded.
    pub fn record_event(&self, file_id: FileId, event: NewEvent) -> Result<Event> {
        self.db.write(|tx| {
            let file = require_file(tx, file_id)?;
            let recorded = insert_event(tx, &file, event)?;
            if recorded.state.is_local() {
                apply_in_tx(tx, &file, &recorded)?;
            }
            get_event(tx, recorded.id)?
                .ok_or_else(|| Error::EventNotFound(recorded.id.to_string()))
        })
    }

    /// Make a received remote event the node's current event.
    pub fn apply_event(&self, event_id: EventId) -> Result<File> {
        self.db.write(|tx| {
            let event =
                get_event(tx, event_id)?.ok_or_else(|| Error::EventNotFound(event_id.to_string()))?;
            let file = require_file(tx, event.file_id)?;
            if event.state.is_local() {
                return Ok(file);
            }
            apply_in_tx(tx, &file, &event)?;
            tx.execute(
                "UPDATE events SET state = ?1 WHERE id = ?2",
                params![EventState::Downloaded, event_id.0],
            )?;
            require_file(tx, file.id)
        })
    }

    /// Record the network confirmation of an event.
    ///
    /// Assigns the server sequence number and, when given, the node's stable
    /// uuid. Local events move to `registered`.
    pub fn register_event(
        &self,
        event_id: EventId,
        server_event_id: i64,
        file_uuid: Option<&str>,
    ) -> Result<Event> {
        self.db.write(|tx| {
            let event =
                get_event(tx, event_id)?.ok_or_else(|| Error::EventNotFound(event_id.to_string()))?;
            ensure_server_event_id_free(tx, server_event_id, Some(event_id))?;

            let state = match event.state {
                EventState::Occurred | EventState::Conflicted | EventState::Sent => {
                    EventState::Registered
                }
                other => other,
            };
            tx.execute(
                "UPDATE events SET server_event_id = ?1, state = ?2 WHERE id = ?3",
                params![server_event_id, state, event_id.0],
            )?;

            if let Some(uuid) = file_uuid {
                tx.execute(
                    "UPDATE files SET uuid = ?1 WHERE id = ?2 AND uuid IS NULL",
                    params![uuid, event.file_id.0],
                )?;
                tx.execute(
                    "UPDATE events SET file_uuid = ?1 WHERE file_id = ?2 AND file_uuid IS NULL",
                    params![uuid, event.file_id.0],
                )?;
            }

            tracing::debug!(%event_id, server_event_id, "Registered event");
            get_event(tx, event_id)?.ok_or_else(|| Error::EventNotFound(event_id.to_string()))
        })
    }

    /// Hand a local event to the network layer
    pub fn mark_event_sent(&self, event_id: EventId) -> Result<()> {
        self.db.write(|tx| {
            tx.execute(
                "UPDATE events SET state = ?1 WHERE id = ?2 AND state IN (?3, ?4)",
                params![
                    EventState::Sent,
                    event_id.0,
                    EventState::Occurred,
                    EventState::Conflicted
                ],
            )?;
            Ok(())
        })
    }

    /// Remember that `event_id` was skipped for `file_id`
    pub fn skip_event(&self, file_id: FileId, event_id: EventId) -> Result<()> {
        self.db.write(|tx| {
            let changed = tx.execute(
                "UPDATE files SET last_skipped_event_id = ?1 WHERE id = ?2",
                params![event_id.0, file_id.0],
            )?;
            if changed == 0 {
                return Err(Error::FileNotFound(format!("id {file_id}")));
            }
            Ok(())
        })
    }

    /// Mark an event as verified up to date. Returns whether it was found.
    pub fn set_event_checked(&self, event_uuid: &str, server_event_id: i64) -> Result<bool> {
        tracing::debug!("set event {event_uuid} checked");
        self.db.write(|tx| {
            let changed = tx.execute(
                "UPDATE events SET checked = 1 WHERE uuid = ?1 AND server_event_id = ?2",
                params![event_uuid, server_event_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Drop every event and node
    pub fn clean(&self) -> Result<()> {
        self.db.write(|tx| {
            tx.execute_batch("DELETE FROM events; DELETE FROM files;")?;
            Ok(())
        })?;
        tracing::info!("Cleaned event store");
        Ok(())
    }

    pub fn get_max_server_event_id(&self) -> Result<i64> {
        self.scalar("SELECT COALESCE(MAX(server_event_id), 0) FROM events")
    }

    pub fn get_min_server_event_id(&self) -> Result<i64> {
        self.scalar("SELECT COALESCE(MIN(server_event_id), 0) FROM events")
    }

    pub fn get_max_checked_server_event_id(&self) -> Result<i64> {
        self.scalar("SELECT COALESCE(MAX(server_event_id), 0) FROM events WHERE checked = 1")
    }

    /// Confirmed events strictly between `from_id` and `to_id`
    pub fn get_events_count(&self, from_id: i64, to_id: i64) -> Result<i64> {
        self.db.read(|tx| {
            Ok(tx.query_row(
                "SELECT COUNT(*) FROM events
                 WHERE server_event_id IS NOT NULL AND server_event_id > ?1 AND server_event_id < ?2",
                params![from_id, to_id],
                |row| row.get(0),
            )?)
        })
    }

    pub fn event_exists(&self, server_event_id: i64) -> Result<bool> {
        self.db.read(|tx| {
            Ok(tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE server_event_id = ?1)",
                params![server_event_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Whether any event references `uuid` as its patch or reverse patch
    pub fn is_diff_file_uuid_known(&self, uuid: &str) -> Result<bool> {
        self.db.read(|tx| {
            Ok(tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE diff_file_uuid = ?1 OR rev_diff_file_uuid = ?1)",
                params![uuid],
                |row| row.get(0),
            )?)
        })
    }

    pub fn all_local_events_processed(&self) -> Result<bool> {
        self.db.read(|tx| {
            let pending: i64 = tx.query_row(
                "SELECT COUNT(*) FROM events WHERE state IN (?1, ?2)",
                params![EventState::Occurred, EventState::Conflicted],
                |row| row.get(0),
            )?;
            Ok(pending == 0)
        })
    }

    pub fn get_event_by_id(&self, event_id: EventId) -> Result<Option<Event>> {
        self.db.read(|tx| get_event(tx, event_id))
    }

    /// Confirmed event carrying the given event uuid
    pub fn get_registered_event_by_uuid(&self, uuid: &str) -> Result<Option<Event>> {
        self.db.read(|tx| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e WHERE e.uuid = ?1 AND e.server_event_id > 0"
            );
            Ok(tx
                .query_row(&sql, params![uuid], rows::parse_event)
                .optional()?)
        })
    }

    /// Events of one node, oldest first
    pub fn get_file_events(&self, file_id: FileId) -> Result<Vec<Event>> {
        self.db
            .read(|tx| query_events(tx, "e.file_id = ?1 ORDER BY e.id", params![file_id.0]))
    }

    pub fn get_file_by_id(&self, file_id: FileId) -> Result<Option<File>> {
        self.db.read(|tx| get_file(tx, file_id))
    }

    pub fn get_file_by_uuid(&self, uuid: &str) -> Result<Option<File>> {
        self.db.read(|tx| rows::get_file_by_uuid(tx, uuid))
    }

    /// Folder carrying `uuid`; `None` uuid means the root
    pub fn get_folder_by_uuid(&self, uuid: Option<&str>) -> Result<Option<File>> {
        let Some(uuid) = uuid else {
            return Ok(None);
        };
        self.db.read(|tx| match rows::get_file_by_uuid(tx, uuid)? {
            Some(folder) if folder.is_folder => Ok(Some(folder)),
            _ => Err(Error::FolderUuidNotFound(uuid.to_string())),
        })
    }

    /// Current path of a node
    pub fn path_of(&self, file_id: FileId) -> Result<String> {
        self.db.read(|tx| rows::path_of(tx, file_id))
    }

    pub fn is_deleted(&self, file_id: FileId) -> Result<bool> {
        self.db.read(|tx| rows::is_deleted(tx, file_id))
    }

    pub fn is_existing(&self, file_id: FileId) -> Result<bool> {
        self.db.read(|tx| rows::is_existing(tx, file_id))
    }

    /// Case-insensitive check for another non-deleted node named `name`
    /// under `folder_id`
    pub fn conflicting_name_exists(
        &self,
        folder_id: Option<FileId>,
        file_id: FileId,
        name: &str,
    ) -> Result<bool> {
        self.db
            .read(|tx| conflicting_name_exists(tx, folder_id, file_id, name, false))
    }

    /// Whether a root folder named `folder_name` is (or was) a collaboration root
    pub fn is_collaborated(&self, folder_name: &str) -> Result<bool> {
        if folder_name.is_empty() {
            return Ok(false);
        }
        self.db.read(|tx| {
            Ok(tx.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM files f JOIN events e ON e.file_id = f.id
                    WHERE f.is_folder = 1 AND f.folder_id IS NULL AND f.name = ?1
                      AND (f.is_collaborated = 1 OR e.erase_nested = 1)
                 )",
                params![folder_name],
                |row| row.get(0),
            )?)
        })
    }

    fn scalar(&self, sql: &str) -> Result<i64> {
        self.db.read(|tx| Ok(tx.query_row(sql, [], |row| row.get(0))?))
    }
}

/// Fill defaults from the node's current state and insert the event row.
fn insert_event(conn: &Connection, file: &File, new: NewEvent) -> Result<Event> {
    if let Some(server_event_id) = new.server_event_id {
        ensure_server_event_id_free(conn, server_event_id, None)?;
    }

    let current = match file.event_id {
        Some(id) => get_event(conn, id)?,
        None => None,
    };
    let current_hash = current.as_ref().and_then(|event| event.file_hash.clone());
    let current_size = current.as_ref().map_or(0, |event| event.file_size);

    let (file_name, name_before, file_hash, file_size, folder_uuid) = match new.kind {
        EventType::Create => {
            let name = new
                .file_name
                .filter(|name| !name.is_empty())
                .ok_or_else(|| Error::InvalidInput("create event needs a file name".into()))?;
            (
                Some(name),
                new.file_name_before_event,
                new.file_hash,
                new.file_size.unwrap_or(0),
                new.folder_uuid,
            )
        }
        EventType::Move => {
            let name = new
                .file_name
                .filter(|name| !name.is_empty())
                .ok_or_else(|| Error::InvalidInput("move event needs a file name".into()))?;
            (
                Some(name),
                new.file_name_before_event.or_else(|| Some(file.name.clone())),
                new.file_hash.or_else(|| current_hash.clone()),
                new.file_size.unwrap_or(current_size),
                new.folder_uuid,
            )
        }
        EventType::Update => (
            new.file_name.or_else(|| Some(file.name.clone())),
            new.file_name_before_event,
            new.file_hash,
            new.file_size.unwrap_or(0),
            match new.folder_uuid {
                Some(uuid) => Some(uuid),
                None => parent_uuid(conn, file.folder_id)?,
            },
        ),
        EventType::Delete => (
            new.file_name.or_else(|| Some(file.name.clone())),
            new.file_name_before_event.or_else(|| Some(file.name.clone())),
            new.file_hash,
            new.file_size.unwrap_or(0),
            match new.folder_uuid {
                Some(uuid) => Some(uuid),
                None => parent_uuid(conn, file.folder_id)?,
            },
        ),
    };

    let hash_before = new.file_hash_before_event.or(current_hash);
    let size_before = new.file_size_before_event.unwrap_or(current_size);
    let uuid = new.uuid.unwrap_or_else(new_event_uuid);
    let file_uuid = new.file_uuid.or_else(|| file.uuid.clone());

    conn.execute(
        "INSERT INTO events (
            file_id, uuid, type, is_folder, file_name, file_name_before_event,
            file_size, file_size_before_event, file_hash, file_hash_before_event,
            file_uuid, folder_uuid, state, server_event_id, last_event_id,
            diff_file_uuid, diff_file_size, rev_diff_file_uuid, rev_diff_file_size,
            timestamp, restore, erase_nested, checked
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                   ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            file.id.0,
            uuid,
            new.kind,
            file.is_folder,
            file_name,
            name_before,
            file_size,
            size_before,
            file_hash,
            hash_before,
            file_uuid,
            folder_uuid,
            new.state,
            new.server_event_id,
            file.event_id.map(|id| id.0),
            new.diff_file_uuid,
            new.diff_file_size,
            new.rev_diff_file_uuid,
            new.rev_diff_file_size,
            now_millis(),
            new.restore,
            new.erase_nested,
            new.checked,
        ],
    )?;

    let id = EventId(conn.last_insert_rowid());
    tracing::debug!(%id, file_id = %file.id, kind = %new.kind, state = %new.state, "Recorded event");
    get_event(conn, id)?.ok_or_else(|| Error::EventNotFound(id.to_string()))
}

/// Make `event` the node's current event, renaming and re-parenting for
/// create/move after checking the target name is free.
fn apply_in_tx(conn: &Connection, file: &File, event: &Event) -> Result<()> {
    match event.kind {
        EventType::Create | EventType::Move => {
            let folder_id = resolve_folder_uuid(conn, event.folder_uuid.as_deref())?;
            let name = event
                .file_name
                .as_deref()
                .ok_or_else(|| Error::InvalidInput(format!("event {} has no name", event.id)))?;
            if conflicting_name_exists(conn, folder_id, file.id, name, true)? {
                return Err(Error::NameConflict {
                    name: name.to_string(),
                    folder: folder_id.map(|id| id.0),
                });
            }
            conn.execute(
                "UPDATE files SET name = ?1, folder_id = ?2, event_id = ?3 WHERE id = ?4",
                params![name, folder_id.map(|id| id.0), event.id.0, file.id.0],
            )?;
        }
        EventType::Update | EventType::Delete => {
            conn.execute(
                "UPDATE files SET event_id = ?1 WHERE id = ?2",
                params![event.id.0, file.id.0],
            )?;
        }
    }

    if file.uuid.is_none() {
        if let Some(uuid) = event.file_uuid.as_deref() {
            conn.execute(
                "UPDATE files SET uuid = ?1 WHERE id = ?2",
                params![uuid, file.id.0],
            )?;
        }
    }
    Ok(())
}
