//! Path resolution, conflict detection and future-path prediction.

use std::collections::HashSet;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::rows::{
    get_file, get_file_by_uuid, is_existing, node_state, parse_event, path_of, placeholders,
    query_events, query_files, require_file, EVENT_COLUMNS, MAX_TREE_DEPTH,
};
use super::EventStore;
use crate::error::{Error, Result};
use crate::models::{Event, File, FileId, FolderInfo};
use crate::util::{normalize_relative_path, split_path};

impl EventStore {
    /// Live folder at `path`; `Ok(None)` is the root.
    ///
    /// With `ignore_processing` unset, a folder that has no uuid yet fails
    /// with [`Error::FileInProcessing`].
    pub fn find_folder_by_relative_path(
        &self,
        path: &str,
        ignore_processing: bool,
    ) -> Result<Option<File>> {
        self.database()
            .read(|tx| find_folder(tx, &split_path(path), ignore_processing))
    }

    /// Live file or folder at `path`.
    ///
    /// Two live nodes at one path is a consistency violation.
    pub fn find_file_by_relative_path(&self, path: &str) -> Result<File> {
        self.database().read(|tx| find_file(tx, path))
    }

    /// All nodes named like the last segment of `path` in its parent folder.
    ///
    /// An unresolvable parent yields an empty list.
    pub fn find_files_by_relative_path(
        &self,
        path: &str,
        ignore_processing: bool,
        include_deleted: bool,
    ) -> Result<Vec<File>> {
        self.database()
            .read(|tx| find_files(tx, path, ignore_processing, include_deleted))
    }

    pub fn find_file_uuid_by_relative_path(&self, path: &str) -> Result<Option<String>> {
        Ok(self.find_file_by_relative_path(path)?.uuid)
    }

    /// Uuid of the folder at `path`; `None` for the root
    pub fn find_folder_uuid_by_relative_path(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .find_folder_by_relative_path(path, true)?
            .and_then(|folder| folder.uuid))
    }

    /// Confirmed node already claiming the name at `path`.
    ///
    /// Looks only at each node's latest confirmed event, so every peer reaches
    /// the same answer. When several nodes qualify the earliest confirmed one
    /// wins. `excluded_id` skips the node asking.
    pub fn find_conflicting_file_or_folder(
        &self,
        path: &str,
        excluded_id: Option<FileId>,
    ) -> Result<Option<(File, Event)>> {
        self.database()
            .read(|tx| find_conflicting(tx, path, excluded_id))
    }

    /// Folders that `path` will name once all confirmed moves are applied.
    ///
    /// Results are ordered by id.
    pub fn find_folders_by_future_path(
        &self,
        path: &str,
        include_deleted: bool,
    ) -> Result<Vec<File>> {
        self.database()
            .read(|tx| find_folders_by_future_path(tx, path, include_deleted))
    }

    /// Path of `event`'s node: its name joined to the parent's live path.
    pub fn get_path_from_event(&self, event: &Event) -> Result<String> {
        self.database().read(|tx| path_from_event(tx, event))
    }

    /// Path of `event`'s node rebuilt from confirmed folder events only.
    pub fn get_path_by_events(&self, event: &Event) -> Result<String> {
        self.database().read(|tx| path_by_events(tx, event))
    }

    /// Whether a later update or delete supersedes `event` for its node.
    pub fn is_file_changed(&self, event: &Event) -> Result<bool> {
        self.database().read(|tx| is_file_changed(tx, event))
    }

    /// Hash a peer may request by event uuid.
    ///
    /// With `shared_roots` given, the file must lie below one of them.
    pub fn get_file_hash_by_event_uuid(
        &self,
        event_uuid: &str,
        shared_roots: Option<&[String]>,
    ) -> Result<Option<String>> {
        self.database()
            .read(|tx| file_hash_by_event_uuid(tx, event_uuid, shared_roots))
    }

    /// Whether the node or one of its ancestors is in `shared_roots`.
    pub fn is_file_shared(&self, file_uuid: &str, shared_roots: &[String]) -> Result<bool> {
        self.database()
            .read(|tx| is_file_shared(tx, file_uuid, shared_roots))
    }

    /// Path and status of a folder by uuid; `None` uuid is the root.
    pub fn folder_info_by_uuid(&self, uuid: Option<&str>) -> Result<Option<FolderInfo>> {
        let Some(uuid) = uuid else {
            return Ok(Some(FolderInfo {
                path: String::new(),
                deleted: false,
                excluded: false,
            }));
        };
        self.database().read(|tx| {
            let Some(folder) = get_file_by_uuid(tx, uuid)? else {
                return Ok(None);
            };
            let deleted = node_state(tx, folder.id)?.is_some_and(|state| state.deleted);
            Ok(Some(FolderInfo {
                path: path_of(tx, folder.id)?,
                deleted,
                excluded: folder.excluded,
            }))
        })
    }
}

pub(crate) fn find_folder(
    conn: &Connection,
    segments: &[&str],
    ignore_processing: bool,
) -> Result<Option<File>> {
    if segments.is_empty() {
        return Ok(None);
    }
    let path = segments.join("/");
    tracing::debug!("Find folder by relative path: {path}");

    let values = (0..segments.len())
        .map(|n| format!("({n}, ?{})", n + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let level_param = segments.len() + 1;
    let sql = format!(
        "WITH RECURSIVE
            x (n, name) AS (VALUES {values}),
            y (id, n) AS (
                SELECT f.id, x.n
                FROM x JOIN files f ON f.name = x.name
                JOIN events e ON e.file_id = f.id
                WHERE x.n = 0 AND f.folder_id IS NULL
                  AND e.id = (SELECT MAX(e2.id) FROM events e2 WHERE e2.file_id = f.id)
                  AND e.folder_uuid IS NULL
                  AND e.type <> 'delete'
                UNION
                SELECT f.id, x.n
                FROM y JOIN x ON x.n = y.n + 1
                JOIN files f ON f.name = x.name AND f.folder_id = y.id
                WHERE 'delete' <> (SELECT e.type FROM events e WHERE e.file_id = f.id
                                   ORDER BY e.id DESC LIMIT 1)
            )
         SELECT y.id FROM y WHERE y.n = ?{level_param} ORDER BY y.id"
    );

    let mut bound: Vec<Value> = segments
        .iter()
        .map(|segment| Value::Text((*segment).to_string()))
        .collect();
    bound.push(Value::Integer(
        i64::try_from(segments.len() - 1).unwrap_or(i64::MAX),
    ));

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(bound), |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let folder = match ids.as_slice() {
        [] => None,
        [id] => get_file(conn, FileId(*id))?,
        _ => {
            tracing::error!(%path, ?ids, "Folder path resolves to several live folders");
            return Err(Error::ConsistencyViolation(format!(
                "folder path '{path}' resolves to {} live folders",
                ids.len()
            )));
        }
    };

    let Some(folder) = folder.filter(|folder| folder.is_folder) else {
        tracing::debug!("Folder not found {path}");
        return Err(Error::FolderNotFound(path));
    };

    if folder.uuid.is_none() && !ignore_processing {
        tracing::debug!("Folder in processing {}", folder.name);
        return Err(Error::FileInProcessing(folder.name));
    }

    Ok(Some(folder))
}

pub(crate) fn find_files(
    conn: &Connection,
    path: &str,
    ignore_processing: bool,
    include_deleted: bool,
) -> Result<Vec<File>> {
    let segments = split_path(path);
    let Some((name, parent)) = segments.split_last() else {
        return Err(Error::InvalidInput("file path can't be empty".into()));
    };

    let folder = match find_folder(conn, parent, ignore_processing) {
        Ok(folder) => folder,
        Err(error) if error.is_not_found() => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };

    let files = query_files(
        conn,
        "f.name = ?1 AND f.folder_id IS ?2 ORDER BY f.id",
        params![name, folder.map(|folder| folder.id.0)],
    )?;
    if include_deleted {
        return Ok(files);
    }

    let mut live = Vec::with_capacity(files.len());
    for file in files {
        if !node_state(conn, file.id)?.is_some_and(|state| state.deleted) {
            live.push(file);
        }
    }
    Ok(live)
}

pub(crate) fn find_file(conn: &Connection, path: &str) -> Result<File> {
    let mut existing = Vec::new();
    for file in find_files(conn, path, false, false)? {
        if is_existing(conn, file.id)? {
            existing.push(file);
        }
    }

    if existing.len() > 1 {
        let ids: Vec<i64> = existing.iter().map(|file| file.id.0).collect();
        tracing::error!(%path, ?ids, "File name is not unique in the database");
        return Err(Error::ConsistencyViolation(format!(
            "path '{path}' resolves to {} live files",
            existing.len()
        )));
    }

    existing
        .pop()
        .ok_or_else(|| Error::FileNotFound(normalize_relative_path(path)))
}

fn find_conflicting(
    conn: &Connection,
    path: &str,
    excluded_id: Option<FileId>,
) -> Result<Option<(File, Event)>> {
    let segments = split_path(path);
    let Some((name, parent)) = segments.split_last() else {
        return Err(Error::InvalidInput("path can't be empty".into()));
    };
    tracing::debug!("Find conflicting file or folder: {path}");

    let folder_uuid = match find_folder(conn, parent, true) {
        Ok(None) => None,
        Ok(Some(folder)) => match folder.uuid {
            Some(uuid) => Some(uuid),
            None => return Ok(None),
        },
        Err(error) if error.is_not_found() => {
            tracing::debug!("Folder not found");
            return Ok(None);
        }
        Err(error) => return Err(error),
    };

    let events = query_events(
        conn,
        "e.id = (SELECT MAX(x.id) FROM events x
                 WHERE x.file_id = e.file_id AND x.server_event_id IS NOT NULL)
         AND e.file_id IS NOT ?1
         AND e.folder_uuid IS ?2
         AND e.type IN ('create', 'move', 'update')
         AND e.file_name = ?3
         ORDER BY e.server_event_id",
        params![excluded_id.map(|id| id.0), folder_uuid, name],
    )?;

    let mut found = Vec::new();
    for event in events {
        let file = require_file(conn, event.file_id)?;
        if !node_state(conn, file.id)?.is_some_and(|state| state.deleted) {
            found.push((file, event));
        }
    }

    if found.len() > 1 {
        tracing::warn!(
            %path,
            candidates = found.len(),
            "Several confirmed nodes claim one name, taking the earliest confirmed"
        );
    }
    Ok(found.into_iter().next())
}

fn find_folders_by_future_path(
    conn: &Connection,
    path: &str,
    include_deleted: bool,
) -> Result<Vec<File>> {
    let segments = split_path(path);
    if segments.is_empty() {
        return Err(Error::InvalidInput("folder path can't be empty".into()));
    }
    tracing::debug!("Find folder by future path: {path}");

    let mut folder_uuids: Vec<String> = Vec::new();
    for (level, name) in segments.iter().enumerate() {
        let folder_filter = if level == 0 {
            "e.folder_uuid IS NULL".to_string()
        } else {
            format!("e.folder_uuid IN ({})", placeholders(2, folder_uuids.len()))
        };
        let delete_filter = if include_deleted {
            "OR (e.type = 'delete' AND e.file_name_before_event = ?1)"
        } else {
            ""
        };
        let sql = format!(
            "SELECT e.file_uuid FROM events e
             WHERE e.id = (SELECT MAX(x.id) FROM events x
                           WHERE x.file_id = e.file_id
                             AND x.server_event_id IS NOT NULL
                             AND x.is_folder = 1)
               AND {folder_filter}
               AND ((e.type <> 'delete' AND e.file_name = ?1) {delete_filter})
               AND e.file_uuid IS NOT NULL
             ORDER BY e.id"
        );

        let mut bound = vec![(*name).to_string()];
        if level > 0 {
            bound.append(&mut folder_uuids);
        }
        let mut stmt = conn.prepare(&sql)?;
        folder_uuids = stmt
            .query_map(params_from_iter(bound), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if folder_uuids.is_empty() {
            return Ok(Vec::new());
        }
    }

    if !include_deleted && folder_uuids.len() > 1 {
        tracing::error!(%path, ?folder_uuids, "Future path resolves to several folders");
        return Err(Error::ConsistencyViolation(format!(
            "future path '{path}' resolves to {} folders",
            folder_uuids.len()
        )));
    }

    let filter = format!(
        "f.uuid IN ({}) ORDER BY f.id",
        placeholders(1, folder_uuids.len())
    );
    query_files(conn, &filter, params_from_iter(folder_uuids))
}

fn event_name(event: &Event) -> Result<&str> {
    event
        .display_name()
        .ok_or_else(|| Error::InvalidInput(format!("event {} has no file name", event.id)))
}

fn path_from_event(conn: &Connection, event: &Event) -> Result<String> {
    let name = event_name(event)?;
    let Some(folder_uuid) = event.folder_uuid.as_deref() else {
        return Ok(name.to_string());
    };
    let folder = get_file_by_uuid(conn, folder_uuid)?
        .ok_or_else(|| Error::FolderUuidNotFound(folder_uuid.to_string()))?;
    Ok(format!("{}/{name}", path_of(conn, folder.id)?))
}

fn path_by_events(conn: &Connection, event: &Event) -> Result<String> {
    let mut names = vec![event_name(event)?.to_string()];
    let mut folder_uuid = event.folder_uuid.clone();
    let mut visited = HashSet::new();

    while let Some(uuid) = folder_uuid {
        if !visited.insert(uuid.clone()) || visited.len() > MAX_TREE_DEPTH {
            return Err(Error::ConsistencyViolation(format!(
                "cycle in confirmed folder events at '{uuid}'"
            )));
        }
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE e.server_event_id IS NOT NULL AND e.is_folder = 1 AND e.file_uuid = ?1
             ORDER BY e.id DESC LIMIT 1"
        );
        let folder_event = conn
            .query_row(&sql, params![uuid], parse_event)
            .optional()?
            .ok_or_else(|| Error::FolderUuidNotFound(uuid.clone()))?;
        names.push(event_name(&folder_event)?.to_string());
        folder_uuid = folder_event.folder_uuid;
    }

    names.reverse();
    Ok(names.join("/"))
}

pub(crate) fn is_file_changed(conn: &Connection, event: &Event) -> Result<bool> {
    let local_changes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events
         WHERE file_id = ?1 AND id > ?2 AND server_event_id IS NULL
           AND type IN ('update', 'delete')",
        params![event.file_id.0, event.id.0],
        |row| row.get(0),
    )?;
    if local_changes > 0 {
        return Ok(true);
    }

    let Some(server_event_id) = event.server_event_id.filter(|id| *id > 0) else {
        return Ok(false);
    };
    let confirmed_changes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events
         WHERE file_id = ?1 AND type IN ('update', 'delete')
           AND server_event_id IS NOT NULL AND server_event_id > ?2",
        params![event.file_id.0, server_event_id],
        |row| row.get(0),
    )?;
    Ok(confirmed_changes > 0)
}

fn file_hash_by_event_uuid(
    conn: &Connection,
    event_uuid: &str,
    shared_roots: Option<&[String]>,
) -> Result<Option<String>> {
    if event_uuid.is_empty() {
        return Err(Error::InvalidInput("event uuid can't be empty".into()));
    }

    let event = query_events(conn, "e.uuid = ?1 ORDER BY e.id LIMIT 1", params![event_uuid])?
        .pop()
        .ok_or_else(|| Error::EventNotFound(event_uuid.to_string()))?;
    let file = get_file(conn, event.file_id)?
        .filter(|file| !file.is_folder)
        .ok_or_else(|| Error::FileNotFound(format!("event {event_uuid}")))?;
    let file_label = file.uuid.clone().unwrap_or_else(|| file.id.to_string());

    if let Some(roots) = shared_roots {
        let shared = match file.uuid.as_deref() {
            Some(uuid) => is_file_shared(conn, uuid, roots)?,
            None => false,
        };
        if !shared {
            return Err(Error::FileNotShared(file_label));
        }
    }

    if is_file_changed(conn, &event)? {
        return Err(Error::FileChanged(file_label));
    }

    Ok(event.served_hash().map(str::to_string))
}

fn is_file_shared(conn: &Connection, file_uuid: &str, shared_roots: &[String]) -> Result<bool> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE chain (id, folder_id, uuid, depth) AS (
            SELECT id, folder_id, uuid, 0 FROM files WHERE uuid = ?1
            UNION
            SELECT f.id, f.folder_id, f.uuid, c.depth + 1
            FROM files f JOIN chain c ON f.id = c.folder_id
            WHERE c.depth < ?2
         )
         SELECT uuid FROM chain WHERE uuid IS NOT NULL",
    )?;
    let depth = i64::try_from(MAX_TREE_DEPTH).unwrap_or(i64::MAX);
    let uuids = stmt
        .query_map(params![file_uuid, depth], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(shared_roots.iter().any(|root| uuids.contains(root)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::tests::{confirmed, store};
    use super::*;
    use crate::models::{NewEvent, NewFile};

    #[test]
    fn root_and_nested_folders_resolve() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let (b, _) = confirmed(&store, NewFile::folder("B", Some(a.id)), Some("fa"), 2, "fb");

        assert_eq!(store.find_folder_by_relative_path("", false).unwrap(), None);
        assert_eq!(
            store
                .find_folder_by_relative_path("/A/B/", false)
                .unwrap()
                .map(|folder| folder.id),
            Some(b.id)
        );
        assert!(matches!(
            store.find_folder_by_relative_path("A/C", false),
            Err(Error::FolderNotFound(_))
        ));
        assert_eq!(
            store.find_folder_uuid_by_relative_path("A").unwrap().as_deref(),
            Some("fa")
        );
    }

    #[test]
    fn unconfirmed_folder_is_in_processing() {
        let store = store();
        let folder = store.create_file(&NewFile::folder("P", None)).unwrap();
        store
            .record_event(folder.id, NewEvent::create("P", None))
            .unwrap();

        assert!(store.find_folder_by_relative_path("P", true).unwrap().is_some());
        let err = store.find_folder_by_relative_path("P", false).unwrap_err();
        assert!(matches!(err, Error::FileInProcessing(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn file_path_is_not_a_folder() {
        let store = store();
        confirmed(&store, NewFile::file("x.txt", None), None, 1, "fx");
        assert!(matches!(
            store.find_folder_by_relative_path("x.txt", true),
            Err(Error::FolderNotFound(_))
        ));
    }

    #[test]
    fn rename_moves_resolution() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let (file, _) = confirmed(
            &store,
            NewFile::file("b.txt", Some(a.id)),
            Some("fa"),
            2,
            "fb",
        );
        assert_eq!(store.find_file_by_relative_path("/A/b.txt").unwrap().id, file.id);

        store.record_event(a.id, NewEvent::moved("B", None)).unwrap();

        assert_eq!(store.find_file_by_relative_path("/B/b.txt").unwrap().id, file.id);
        let err = store.find_file_by_relative_path("/A/b.txt").unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn path_round_trip_for_live_nodes() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let (b, _) = confirmed(&store, NewFile::folder("B", Some(a.id)), Some("fa"), 2, "fb");
        let (c, _) = confirmed(&store, NewFile::file("c", Some(b.id)), Some("fb"), 3, "fc");
        let (d, _) = confirmed(&store, NewFile::file("d", None), None, 4, "fd");

        for node in [a, b, c, d] {
            let path = store.path_of(node.id).unwrap();
            assert_eq!(store.find_file_by_relative_path(&path).unwrap().id, node.id);
        }
    }

    #[test]
    fn deleted_files_are_filtered() {
        let store = store();
        let (file, _) = confirmed(&store, NewFile::file("gone", None), None, 1, "fg");
        store.record_event(file.id, NewEvent::delete()).unwrap();

        assert!(store.find_files_by_relative_path("gone", true, false).unwrap().is_empty());
        assert_eq!(
            store.find_files_by_relative_path("gone", true, true).unwrap().len(),
            1
        );
        assert!(matches!(
            store.find_file_by_relative_path("gone"),
            Err(Error::FileNotFound(_))
        ));
        assert!(store
            .find_files_by_relative_path("missing/gone", true, false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn racing_creates_resolve_to_earliest_confirmed() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");

        // Remote create, confirmed first but not applied locally.
        let remote = store
            .create_file(&NewFile::file("x", Some(a.id)).with_uuid("remote-x"))
            .unwrap();
        let remote_event = store
            .record_event(
                remote.id,
                NewEvent::create("x", Some("fa".into()))
                    .with_content("h-remote", 1)
                    .received()
                    .with_server_event_id(10),
            )
            .unwrap();

        // Local create of the same name, confirmed later.
        let local = store.create_file(&NewFile::file("x", Some(a.id))).unwrap();
        let local_event = store
            .record_event(
                local.id,
                NewEvent::create("x", Some("fa".into())).with_content("h-local", 2),
            )
            .unwrap();
        store
            .register_event(local_event.id, 11, Some("local-x"))
            .unwrap();

        let (file, event) = store
            .find_conflicting_file_or_folder("/A/x", Some(local.id))
            .unwrap()
            .unwrap();
        assert_eq!(file.id, remote.id);
        assert_eq!(event.id, remote_event.id);

        let (file, _) = store
            .find_conflicting_file_or_folder("/A/x", None)
            .unwrap()
            .unwrap();
        assert_eq!(file.id, remote.id);

        assert!(matches!(
            store.apply_event(remote_event.id),
            Err(Error::NameConflict { .. })
        ));
    }

    #[test]
    fn conflict_ignores_unconfirmed_and_missing_parents() {
        let store = store();
        let file = store.create_file(&NewFile::file("y", None)).unwrap();
        store.record_event(file.id, NewEvent::create("y", None)).unwrap();

        assert_eq!(store.find_conflicting_file_or_folder("y", None).unwrap(), None);
        assert_eq!(
            store.find_conflicting_file_or_folder("no/such/y", None).unwrap(),
            None
        );
    }

    #[test]
    fn future_path_follows_confirmed_moves() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let (sub, _) = confirmed(&store, NewFile::folder("S", Some(a.id)), Some("fa"), 2, "fs");

        // Remote rename of A to Z, confirmed but not applied yet.
        store
            .record_event(
                a.id,
                NewEvent::moved("Z", None).received().with_server_event_id(3),
            )
            .unwrap();

        let future = store.find_folders_by_future_path("Z/S", false).unwrap();
        assert_eq!(future.iter().map(|f| f.id).collect::<Vec<_>>(), vec![sub.id]);
        assert_eq!(store.find_folders_by_future_path("Z/S", false).unwrap(), future);
        assert!(store.find_folders_by_future_path("A/S", false).unwrap().is_empty());

        // The live tree still has the old name.
        assert!(store.find_folder_by_relative_path("A/S", false).unwrap().is_some());
    }

    #[test]
    fn future_path_can_include_deleted() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        store
            .record_event(a.id, NewEvent::delete().received().with_server_event_id(2))
            .unwrap();

        assert!(store.find_folders_by_future_path("A", false).unwrap().is_empty());
        assert_eq!(store.find_folders_by_future_path("A", true).unwrap().len(), 1);
    }

    #[test]
    fn paths_from_events() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let (_, event) = confirmed(&store, NewFile::file("f", Some(a.id)), Some("fa"), 2, "ff");

        assert_eq!(store.get_path_from_event(&event).unwrap(), "A/f");
        assert_eq!(store.get_path_by_events(&event).unwrap(), "A/f");

        // Confirmed but unapplied rename shows up only in the event-based path.
        store
            .record_event(
                a.id,
                NewEvent::moved("B", None).received().with_server_event_id(3),
            )
            .unwrap();
        assert_eq!(store.get_path_from_event(&event).unwrap(), "A/f");
        assert_eq!(store.get_path_by_events(&event).unwrap(), "B/f");
    }

    #[test]
    fn file_hash_served_until_changed() {
        let store = store();
        let (root, _) = confirmed(&store, NewFile::folder("Shared", None), None, 1, "root");
        let file = store
            .create_file(&NewFile::file("f", Some(root.id)))
            .unwrap();
        let created = store
            .record_event(
                file.id,
                NewEvent::create("f", Some("root".into())).with_content("h1", 4),
            )
            .unwrap();
        let created = store.register_event(created.id, 2, Some("ff")).unwrap();
        let event_uuid = created.uuid.clone().unwrap();

        assert_eq!(
            store.get_file_hash_by_event_uuid(&event_uuid, None).unwrap().as_deref(),
            Some("h1")
        );
        assert_eq!(
            store
                .get_file_hash_by_event_uuid(&event_uuid, Some(&["root".to_string()]))
                .unwrap()
                .as_deref(),
            Some("h1")
        );
        assert!(matches!(
            store.get_file_hash_by_event_uuid(&event_uuid, Some(&["other".to_string()])),
            Err(Error::FileNotShared(_))
        ));
        assert!(store.is_file_shared("ff", &["root".to_string()]).unwrap());

        store.record_event(file.id, NewEvent::update("h2", 5)).unwrap();
        assert!(store.is_file_changed(&created).unwrap());
        assert!(matches!(
            store.get_file_hash_by_event_uuid(&event_uuid, None),
            Err(Error::FileChanged(_))
        ));
        assert!(matches!(
            store.get_file_hash_by_event_uuid("nope", None),
            Err(Error::EventNotFound(_))
        ));
    }

    #[test]
    fn folder_info() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        confirmed(&store, NewFile::folder("B", Some(a.id)), Some("fa"), 2, "fb");

        let info = store.folder_info_by_uuid(Some("fb")).unwrap().unwrap();
        assert_eq!(info.path, "A/B");
        assert!(!info.deleted);
        assert_eq!(store.folder_info_by_uuid(None).unwrap().unwrap().path, "");
        assert_eq!(store.folder_info_by_uuid(Some("zz")).unwrap(), None);
    }
}
