//! Row mapping and tree helpers shared by the event store operations.
//!
//! All helpers take a plain `&Connection` so they compose inside whatever
//! transaction the caller opened.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::models::{Event, EventHead, EventId, EventType, File, FileId};

/// Event columns, selected from `events e`
pub(crate) const EVENT_COLUMNS: &str = "e.id, e.file_id, e.uuid, e.type, e.is_folder, \
    e.file_name, e.file_name_before_event, e.file_size, e.file_size_before_event, \
    e.file_hash, e.file_hash_before_event, e.file_uuid, e.folder_uuid, e.state, \
    e.server_event_id, e.last_event_id, e.diff_file_uuid, e.diff_file_size, \
    e.rev_diff_file_uuid, e.rev_diff_file_size, e.timestamp, e.outdated, e.restore, \
    e.erase_nested, e.checked";

/// File columns plus the current event summary, selected from [`FILE_FROM`]
pub(crate) const FILE_COLUMNS: &str = "f.id, f.folder_id, f.name, f.uuid, f.event_id, \
    f.last_skipped_event_id, f.is_folder, f.ignored, f.excluded, f.is_collaborated, \
    f.created_at, h.type, h.file_hash, h.file_size, h.server_event_id";

pub(crate) const FILE_FROM: &str = "files f LEFT JOIN events h ON h.id = f.event_id";

/// Upper bound on tree depth; a longer parent chain means a cycle
pub(crate) const MAX_TREE_DEPTH: usize = 4096;

pub(crate) fn parse_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: EventId(row.get(0)?),
        file_id: FileId(row.get(1)?),
        uuid: row.get(2)?,
        kind: row.get(3)?,
        is_folder: row.get(4)?,
        file_name: row.get(5)?,
        file_name_before_event: row.get(6)?,
        file_size: row.get(7)?,
        file_size_before_event: row.get(8)?,
        file_hash: row.get(9)?,
        file_hash_before_event: row.get(10)?,
        file_uuid: row.get(11)?,
        folder_uuid: row.get(12)?,
        state: row.get(13)?,
        server_event_id: row.get(14)?,
        last_event_id: row.get::<_, Option<i64>>(15)?.map(EventId),
        diff_file_uuid: row.get(16)?,
        diff_file_size: row.get(17)?,
        rev_diff_file_uuid: row.get(18)?,
        rev_diff_file_size: row.get(19)?,
        timestamp: row.get(20)?,
        outdated: row.get(21)?,
        restore: row.get(22)?,
        erase_nested: row.get(23)?,
        checked: row.get(24)?,
    })
}

pub(crate) fn parse_file(row: &Row<'_>) -> rusqlite::Result<File> {
    let current = match row.get::<_, Option<EventType>>(11)? {
        Some(kind) => Some(EventHead {
            kind,
            file_hash: row.get(12)?,
            file_size: row.get(13)?,
            server_event_id: row.get(14)?,
        }),
        None => None,
    };
    Ok(File {
        id: FileId(row.get(0)?),
        folder_id: row.get::<_, Option<i64>>(1)?.map(FileId),
        name: row.get(2)?,
        uuid: row.get(3)?,
        event_id: row.get::<_, Option<i64>>(4)?.map(EventId),
        last_skipped_event_id: row.get::<_, Option<i64>>(5)?.map(EventId),
        is_folder: row.get(6)?,
        ignored: row.get(7)?,
        excluded: row.get(8)?,
        is_collaborated: row.get(9)?,
        created_at: row.get(10)?,
        current,
    })
}

pub(crate) fn get_file(conn: &Connection, id: FileId) -> Result<Option<File>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM {FILE_FROM} WHERE f.id = ?1");
    Ok(conn
        .query_row(&sql, params![id.0], parse_file)
        .optional()?)
}

pub(crate) fn require_file(conn: &Connection, id: FileId) -> Result<File> {
    get_file(conn, id)?.ok_or_else(|| Error::FileNotFound(format!("id {id}")))
}

pub(crate) fn get_file_by_uuid(conn: &Connection, uuid: &str) -> Result<Option<File>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM {FILE_FROM} WHERE f.uuid = ?1");
    Ok(conn.query_row(&sql, params![uuid], parse_file).optional()?)
}

pub(crate) fn get_event(conn: &Connection, id: EventId) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events e WHERE e.id = ?1");
    Ok(conn
        .query_row(&sql, params![id.0], parse_event)
        .optional()?)
}

pub(crate) fn query_files(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<File>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM {FILE_FROM} WHERE {filter}");
    let mut stmt = conn.prepare(&sql)?;
    let files = stmt
        .query_map(params, parse_file)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(files)
}

pub(crate) fn query_events(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events e WHERE {filter}");
    let mut stmt = conn.prepare(&sql)?;
    let events = stmt
        .query_map(params, parse_event)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Ids as a comma separated SQL list. Only integers are ever inlined.
pub(crate) fn id_list(ids: impl IntoIterator<Item = i64>) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// `?n, ?n+1, ...` placeholders for a bound list starting at `first`
pub(crate) fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Deleted/existing flags derived from a node and its ancestors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeState {
    /// Current event is a delete, the last event was skipped, or an ancestor
    /// is gone
    pub deleted: bool,
    /// Current event applied, not a delete, and every ancestor exists
    pub existing: bool,
}

struct NodeRow {
    folder_id: Option<i64>,
    event_id: Option<i64>,
    skipped: Option<i64>,
    kind: Option<EventType>,
    last_event: Option<i64>,
}

fn load_node_row(conn: &Connection, id: i64) -> Result<Option<NodeRow>> {
    Ok(conn
        .query_row(
            "SELECT f.folder_id, f.event_id, f.last_skipped_event_id, h.type,
                    (SELECT MAX(x.id) FROM events x WHERE x.file_id = f.id)
             FROM files f LEFT JOIN events h ON h.id = f.event_id
             WHERE f.id = ?1",
            params![id],
            |row| {
                Ok(NodeRow {
                    folder_id: row.get(0)?,
                    event_id: row.get(1)?,
                    skipped: row.get(2)?,
                    kind: row.get(3)?,
                    last_event: row.get(4)?,
                })
            },
        )
        .optional()?)
}

/// Walk from `id` to the root and derive its deleted/existing state.
///
/// Returns `None` when the node itself does not exist.
pub(crate) fn node_state(conn: &Connection, id: FileId) -> Result<Option<NodeState>> {
    let Some(mut row) = load_node_row(conn, id.0)? else {
        return Ok(None);
    };

    let mut deleted = false;
    let mut existing = true;
    let mut visited = HashSet::new();
    let mut current = id.0;

    loop {
        if !visited.insert(current) || visited.len() > MAX_TREE_DEPTH {
            return Err(Error::ConsistencyViolation(format!(
                "cycle in folder chain of file {id}"
            )));
        }

        let self_deleted = (row.event_id.is_some()
            && !matches!(row.kind, Some(kind) if kind != EventType::Delete))
            || (row.skipped.is_some() && row.skipped == row.last_event);
        let self_existing =
            row.event_id.is_some() && row.kind.is_some_and(|kind| kind != EventType::Delete);

        deleted |= self_deleted;
        existing &= self_existing;

        let Some(parent) = row.folder_id else {
            break;
        };
        match load_node_row(conn, parent)? {
            Some(parent_row) => {
                current = parent;
                row = parent_row;
            }
            None => {
                deleted = true;
                existing = false;
                break;
            }
        }
    }

    Ok(Some(NodeState { deleted, existing }))
}

pub(crate) fn is_deleted(conn: &Connection, id: FileId) -> Result<bool> {
    Ok(node_state(conn, id)?.is_some_and(|state| state.deleted))
}

pub(crate) fn is_existing(conn: &Connection, id: FileId) -> Result<bool> {
    Ok(node_state(conn, id)?.is_some_and(|state| state.existing))
}

/// Current path of a node, built from live names up the parent chain.
pub(crate) fn path_of(conn: &Connection, id: FileId) -> Result<String> {
    let mut names = Vec::new();
    let mut next = Some(id.0);
    let mut visited = HashSet::new();

    while let Some(current) = next {
        if !visited.insert(current) || visited.len() > MAX_TREE_DEPTH {
            return Err(Error::ConsistencyViolation(format!(
                "cycle in folder chain of file {id}"
            )));
        }
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT name, folder_id FROM files WHERE id = ?1",
                params![current],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((name, folder_id)) = row else {
            if current == id.0 {
                return Err(Error::FileNotFound(format!("id {id}")));
            }
            break;
        };
        names.push(name);
        next = folder_id;
    }

    names.reverse();
    Ok(names.join("/"))
}

/// Folder id for a parent uuid; `None` uuid means the root.
pub(crate) fn resolve_folder_uuid(
    conn: &Connection,
    folder_uuid: Option<&str>,
) -> Result<Option<FileId>> {
    let Some(uuid) = folder_uuid else {
        return Ok(None);
    };
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM files WHERE uuid = ?1 AND is_folder = 1",
            params![uuid],
            |row| row.get(0),
        )
        .optional()?;
    id.map(FileId)
        .map(Some)
        .ok_or_else(|| Error::FolderUuidNotFound(uuid.to_string()))
}

/// Uuid of a node's parent folder, `None` at the root.
pub(crate) fn parent_uuid(conn: &Connection, folder_id: Option<FileId>) -> Result<Option<String>> {
    let Some(folder_id) = folder_id else {
        return Ok(None);
    };
    let uuid: Option<Option<String>> = conn
        .query_row(
            "SELECT uuid FROM files WHERE id = ?1",
            params![folder_id.0],
            |row| row.get(0),
        )
        .optional()?;
    Ok(uuid.flatten())
}

/// Whether another live node under `folder_id` already uses `name`,
/// compared case-insensitively.
pub(crate) fn conflicting_name_exists(
    conn: &Connection,
    folder_id: Option<FileId>,
    file_id: FileId,
    name: &str,
    existing_only: bool,
) -> Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT id FROM files
         WHERE id <> ?1
           AND ((?2 IS NULL AND folder_id IS NULL) OR folder_id = ?2)
           AND name = ?3 COLLATE NOCASE",
    )?;
    let candidates = stmt
        .query_map(params![file_id.0, folder_id.map(|id| id.0), name], |row| {
            row.get::<_, i64>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for candidate in candidates {
        let Some(state) = node_state(conn, FileId(candidate))? else {
            continue;
        };
        let live = if existing_only {
            state.existing
        } else {
            !state.deleted
        };
        if live {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Reject a confirmation id that another event already carries.
pub(crate) fn ensure_server_event_id_free(
    conn: &Connection,
    server_event_id: i64,
    except: Option<EventId>,
) -> Result<()> {
    let taken: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM events WHERE server_event_id = ?1 AND id IS NOT ?2)",
        params![server_event_id, except.map(|id| id.0)],
        |row| row.get(0),
    )?;
    if taken {
        tracing::warn!(server_event_id, "Rejected duplicate server event id");
        return Err(Error::DuplicateServerEventId(server_event_id));
    }
    Ok(())
}
