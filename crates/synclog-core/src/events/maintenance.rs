//! Tree walks and housekeeping over the event store.

use std::collections::{HashSet, VecDeque};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use super::rows::{get_file_by_uuid, id_list, placeholders, query_files};
use super::EventStore;
use crate::error::{Error, Result};
use crate::models::{EventState, EventType, File, FileId};

/// What a subtree walk yields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileWalk {
    pub include_folders: bool,
    pub include_self: bool,
    pub include_deleted: bool,
}

impl FileWalk {
    #[must_use]
    pub const fn with_folders(mut self) -> Self {
        self.include_folders = true;
        self
    }

    #[must_use]
    pub const fn with_self(mut self) -> Self {
        self.include_self = true;
        self
    }

    #[must_use]
    pub const fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

struct ChildRow {
    file_id: i64,
    is_folder: bool,
    file_uuid: Option<String>,
    kind: EventType,
}

impl EventStore {
    /// Walk the subtree below `folder_uuid` level by level.
    ///
    /// Membership follows each node's latest event. Every query expands at
    /// most `page_size` folders, returns at most `page_size` children and runs
    /// in its own read transaction; `callback` runs between transactions.
    pub fn for_each_file_page(
        &self,
        folder_uuid: Option<&str>,
        walk: FileWalk,
        mut callback: impl FnMut(Vec<File>) -> Result<()>,
    ) -> Result<()> {
        let page_size = self.database().config().page_size.max(1);

        if walk.include_self {
            if let Some(uuid) = folder_uuid {
                let folder = self
                    .database()
                    .read(|tx| get_file_by_uuid(tx, uuid))?
                    .filter(|folder| folder.is_folder)
                    .ok_or_else(|| Error::FolderUuidNotFound(uuid.to_string()))?;
                callback(vec![folder])?;
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut pending: VecDeque<String> = VecDeque::new();
        let mut at_root = match folder_uuid {
            Some(uuid) => {
                visited.insert(uuid.to_string());
                pending.push_back(uuid.to_string());
                false
            }
            None => true,
        };

        while at_root || !pending.is_empty() {
            let chunk: Vec<String> = if at_root {
                Vec::new()
            } else {
                let take = pending.len().min(page_size);
                pending.drain(..take).collect()
            };
            let root_level = at_root;
            at_root = false;

            let mut after = 0;
            loop {
                let (children, files) = self.database().read(|tx| {
                    let children = latest_children(tx, root_level, &chunk, after, page_size)?;
                    let selected: Vec<i64> = children
                        .iter()
                        .filter(|child| walk.include_deleted || child.kind != EventType::Delete)
                        .filter(|child| !child.is_folder || walk.include_folders)
                        .map(|child| child.file_id)
                        .collect();
                    let files = if selected.is_empty() {
                        Vec::new()
                    } else {
                        let filter = format!("f.id IN ({}) ORDER BY f.id", id_list(selected));
                        query_files(tx, &filter, [])?
                    };
                    Ok((children, files))
                })?;

                let next = children
                    .last()
                    .filter(|_| children.len() == page_size)
                    .map(|child| child.file_id);
                for child in children {
                    let live = walk.include_deleted || child.kind != EventType::Delete;
                    if !live || !child.is_folder {
                        continue;
                    }
                    if let Some(uuid) = child.file_uuid {
                        if visited.insert(uuid.clone()) {
                            pending.push_back(uuid);
                        }
                    }
                }

                if !files.is_empty() {
                    callback(files)?;
                }
                match next {
                    Some(last) => after = last,
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Collect a whole subtree walk
    pub fn get_files_by_folder_uuid(
        &self,
        folder_uuid: Option<&str>,
        walk: FileWalk,
    ) -> Result<Vec<File>> {
        let mut all = Vec::new();
        self.for_each_file_page(folder_uuid, walk, |page| {
            all.extend(page);
            Ok(())
        })?;
        Ok(all)
    }

    /// Set `excluded` on every descendant of `folder_id`.
    ///
    /// Newly excluded files drop their current and skipped event pointers and
    /// their latest remote event goes back to `received`. Newly excluded
    /// folders drop their current event and their latest remote event is
    /// marked `downloaded`. The folder itself is left to the caller.
    ///
    /// Each page of children is marked in its own write transaction, so an
    /// interrupted call can simply be repeated.
    pub fn mark_child_excluded(&self, folder_id: FileId, is_excluded: bool) -> Result<()> {
        let page_size = self.database().config().page_size.max(1);
        let limit = page_limit(page_size);
        let mut marked = 0;
        let mut pending = VecDeque::from([folder_id.0]);
        let mut visited = HashSet::from([folder_id.0]);

        while !pending.is_empty() {
            let take = pending.len().min(page_size);
            let parents = id_list(pending.drain(..take));

            let mut after = 0;
            loop {
                let (children, changed) = self.database().write(|tx| {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT id, is_folder FROM files
                         WHERE folder_id IN ({parents}) AND id > ?1
                         ORDER BY id LIMIT ?2"
                    ))?;
                    let children = stmt
                        .query_map(params![after, limit], |row| {
                            Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    drop(stmt);
                    if children.is_empty() {
                        return Ok((children, 0));
                    }

                    let ids = id_list(children.iter().map(|(id, _)| *id));
                    if is_excluded {
                        reset_latest_remote_events(tx, &ids, false, EventState::Received)?;
                        reset_latest_remote_events(tx, &ids, true, EventState::Downloaded)?;
                    }
                    let mut changed = tx.execute(
                        &format!(
                            "UPDATE files SET excluded = ?1, event_id = NULL, last_skipped_event_id = NULL
                             WHERE is_folder = 0 AND excluded <> ?1 AND id IN ({ids})"
                        ),
                        [is_excluded],
                    )?;
                    changed += tx.execute(
                        &format!(
                            "UPDATE files SET excluded = ?1, event_id = NULL
                             WHERE is_folder = 1 AND excluded <> ?1 AND id IN ({ids})"
                        ),
                        [is_excluded],
                    )?;
                    Ok((children, changed))
                })?;
                marked += changed;

                for (id, is_folder) in &children {
                    if *is_folder && visited.insert(*id) {
                        pending.push_back(*id);
                    }
                }
                match children.last() {
                    Some((id, _)) if children.len() == page_size => after = *id,
                    _ => break,
                }
            }
        }
        tracing::debug!(%folder_id, is_excluded, marked, "Marked children excluded");
        Ok(())
    }

    /// Drop remote events that can no longer be applied.
    ///
    /// Covers events of excluded nodes, of placeholders never applied, and
    /// events newer than the current or skipped one. Excluded nodes go too,
    /// along with placeholders whose create event was dropped. Returns the
    /// number of events deleted.
    pub fn delete_remote_events_not_applied(&self) -> Result<usize> {
        let (events, files) = self.database().write(|tx| {
            let mut stmt = tx.prepare(
                "SELECT e.id, e.file_id, e.type FROM events e JOIN files f ON f.id = e.file_id
                 WHERE e.erase_nested = 0
                   AND e.state IN (?1, ?2)
                   AND (f.excluded = 1
                        OR (f.event_id IS NULL AND f.last_skipped_event_id IS NULL)
                        OR (e.id > f.event_id AND f.last_skipped_event_id IS NULL)
                        OR (f.last_skipped_event_id IS NOT NULL
                            AND f.last_skipped_event_id < e.id AND f.event_id IS NULL)
                        OR (f.last_skipped_event_id IS NOT NULL
                            AND f.last_skipped_event_id < e.id
                            AND f.event_id <= f.last_skipped_event_id))",
            )?;
            let stale = stmt
                .query_map(
                    rusqlite::params![EventState::Received, EventState::Downloaded],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, EventType>(2)?,
                        ))
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            let mut events = 0;
            for chunk in stale.chunks(500) {
                events += tx.execute(
                    &format!(
                        "DELETE FROM events WHERE id IN ({})",
                        id_list(chunk.iter().map(|(id, _, _)| *id))
                    ),
                    [],
                )?;
            }

            let mut files = tx.execute("DELETE FROM files WHERE excluded = 1", [])?;

            let placeholders: Vec<i64> = stale
                .iter()
                .filter(|(_, _, kind)| *kind == EventType::Create)
                .map(|(_, file_id, _)| *file_id)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            for chunk in placeholders.chunks(500) {
                files += tx.execute(
                    &format!(
                        "DELETE FROM files
                         WHERE id IN ({}) AND event_id IS NULL
                           AND NOT EXISTS (SELECT 1 FROM events e WHERE e.file_id = files.id)
                           AND NOT EXISTS (SELECT 1 FROM files c WHERE c.folder_id = files.id)",
                        id_list(chunk.iter().copied())
                    ),
                    [],
                )?;
            }
            Ok((events, files))
        })?;

        tracing::debug!("Deleted {events} remote not applied events and {files} files");
        Ok(events)
    }

    /// Total size of live files, walked breadth-first from the root.
    ///
    /// Children are read in keyset pages of at most `page_size` rows, each in
    /// its own transaction.
    pub fn get_share_size(&self) -> Result<i64> {
        let page_size = self.database().config().page_size.max(1);
        let limit = page_limit(page_size);
        let mut total: i64 = 0;
        let mut visited: HashSet<i64> = HashSet::new();
        let mut pending: VecDeque<i64> = VecDeque::new();
        let mut at_root = true;

        while at_root || !pending.is_empty() {
            let parent_filter = if at_root {
                at_root = false;
                "f.folder_id IS NULL".to_string()
            } else {
                let take = pending.len().min(page_size);
                format!("f.folder_id IN ({})", id_list(pending.drain(..take)))
            };
            let filter = format!("{parent_filter} AND f.id > ?1 ORDER BY f.id LIMIT ?2");

            let mut after = 0;
            loop {
                let children = self
                    .database()
                    .read(|tx| query_files(tx, &filter, params![after, limit]))?;

                for child in &children {
                    let Some(current) = child.current.as_ref() else {
                        continue;
                    };
                    if current.kind == EventType::Delete {
                        continue;
                    }
                    if child.is_folder {
                        if visited.insert(child.id.0) {
                            pending.push_back(child.id.0);
                        }
                    } else {
                        total += current.file_size;
                    }
                }
                match children.last() {
                    Some(child) if children.len() == page_size => after = child.id.0,
                    _ => break,
                }
            }
        }

        tracing::debug!("Share size is {total} byte(s)");
        Ok(total)
    }
}

/// One keyset page of the nodes whose latest event places them in one of
/// `folders` (or at the root), ordered by node id and starting after `after`.
fn latest_children(
    conn: &Connection,
    root: bool,
    folders: &[String],
    after: i64,
    page_size: usize,
) -> Result<Vec<ChildRow>> {
    let folder_filter = if root {
        "e.folder_uuid IS NULL".to_string()
    } else {
        format!("e.folder_uuid IN ({})", placeholders(3, folders.len()))
    };
    let sql = format!(
        "SELECT e.file_id, e.is_folder, e.file_uuid, e.type FROM events e
         WHERE e.id = (SELECT MAX(x.id) FROM events x WHERE x.file_id = e.file_id)
           AND {folder_filter}
           AND e.file_id > ?1
         ORDER BY e.file_id
         LIMIT ?2"
    );
    let mut bound = vec![Value::Integer(after), Value::Integer(page_limit(page_size))];
    bound.extend(folders.iter().cloned().map(Value::Text));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bound), |row| {
            Ok(ChildRow {
                file_id: row.get(0)?,
                is_folder: row.get(1)?,
                file_uuid: row.get(2)?,
                kind: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn page_limit(page_size: usize) -> i64 {
    i64::try_from(page_size).unwrap_or(i64::MAX)
}

/// Move the latest remote non-delete event of each not yet excluded node in
/// `ids` into `state`.
fn reset_latest_remote_events(
    conn: &Connection,
    ids: &str,
    folders: bool,
    state: EventState,
) -> Result<usize> {
    Ok(conn.execute(
        &format!(
            "UPDATE events SET state = ?1
             WHERE id IN (
                SELECT e.id FROM events e JOIN files f ON f.id = e.file_id
                WHERE f.id IN ({ids}) AND f.is_folder = ?2 AND f.excluded = 0
                  AND e.type <> 'delete'
                  AND e.id = (SELECT MAX(x.id) FROM events x
                              WHERE x.file_id = e.file_id AND x.state NOT IN (?3, ?4))
             )"
        ),
        rusqlite::params![state, folders, EventState::Occurred, EventState::Conflicted],
    )?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::tests::{confirmed, store};
    use super::*;
    use crate::alerts::StoreAlerts;
    use crate::config::StoreConfig;
    use crate::models::{NewEvent, NewFile};

    fn names(files: &[File]) -> Vec<&str> {
        files.iter().map(|file| file.name.as_str()).collect()
    }

    #[test]
    fn walk_lists_files_level_by_level() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let (b, _) = confirmed(&store, NewFile::folder("B", Some(a.id)), Some("fa"), 2, "fb");
        confirmed(&store, NewFile::file("one", Some(a.id)), Some("fa"), 3, "f1");
        confirmed(&store, NewFile::file("two", Some(b.id)), Some("fb"), 4, "f2");
        let (gone, _) = confirmed(&store, NewFile::file("gone", Some(b.id)), Some("fb"), 5, "f3");
        store.record_event(gone.id, NewEvent::delete()).unwrap();

        let files = store.get_files_by_folder_uuid(Some("fa"), FileWalk::default()).unwrap();
        assert_eq!(names(&files), vec!["one", "two"]);

        let files = store
            .get_files_by_folder_uuid(Some("fa"), FileWalk::default().with_folders().with_self())
            .unwrap();
        assert_eq!(names(&files), vec!["A", "B", "one", "two"]);

        let files = store
            .get_files_by_folder_uuid(Some("fa"), FileWalk::default().with_deleted())
            .unwrap();
        assert_eq!(names(&files), vec!["one", "two", "gone"]);

        let files = store.get_files_by_folder_uuid(None, FileWalk::default().with_folders()).unwrap();
        assert_eq!(names(&files), vec!["A", "B", "one", "two"]);
    }

    #[test]
    fn walk_pages_are_bounded() {
        let config = StoreConfig::new("unused").with_page_size(2);
        let store = EventStore::open_in_memory(&config, StoreAlerts::new()).unwrap();
        confirmed(&store, NewFile::folder("R", None), None, 1, "fr");
        let root = store.get_file_by_uuid("fr").unwrap().unwrap();
        for n in 0..5 {
            let name = format!("f{n}");
            confirmed(&store, NewFile::file(&name, Some(root.id)), Some("fr"), 10 + n, &name);
        }

        let mut pages = Vec::new();
        store
            .for_each_file_page(Some("fr"), FileWalk::default(), |page| {
                pages.push(page.len());
                Ok(())
            })
            .unwrap();
        assert_eq!(pages, vec![2, 2, 1]);
    }

    #[test]
    fn walk_requires_known_self() {
        let store = store();
        let err = store
            .get_files_by_folder_uuid(Some("nope"), FileWalk::default().with_self())
            .unwrap_err();
        assert!(matches!(err, Error::FolderUuidNotFound(_)));
    }

    #[test]
    fn exclusion_reaches_every_depth() {
        let config = StoreConfig::new("unused").with_page_size(1);
        let store = EventStore::open_in_memory(&config, StoreAlerts::new()).unwrap();
        let (top, _) = confirmed(&store, NewFile::folder("top", None), None, 1, "u0");

        let mut parent = top.clone();
        let mut ids = Vec::new();
        for depth in 1..40 {
            let uuid = format!("u{depth}");
            let parent_uuid = parent.uuid.clone();
            let (folder, _) = confirmed(
                &store,
                NewFile::folder(format!("d{depth}"), Some(parent.id)),
                parent_uuid.as_deref(),
                depth + 1,
                &uuid,
            );
            ids.push(folder.id);
            parent = folder;
        }
        let leaf_parent = parent.uuid.clone();
        let (leaf, _) = confirmed(
            &store,
            NewFile::file("leaf", Some(parent.id)),
            leaf_parent.as_deref(),
            100,
            "leaf",
        );
        ids.push(leaf.id);

        store.mark_child_excluded(top.id, true).unwrap();
        for id in &ids {
            let file = store.get_file_by_id(*id).unwrap().unwrap();
            assert!(file.excluded, "{} not excluded", file.name);
            assert_eq!(file.event_id, None);
        }
        assert!(!store.get_file_by_id(top.id).unwrap().unwrap().excluded);

        let leaf_events = store.get_file_events(leaf.id).unwrap();
        assert_eq!(leaf_events[0].state, EventState::Received);
        let folder_events = store.get_file_events(ids[0]).unwrap();
        assert_eq!(folder_events[0].state, EventState::Downloaded);

        store.mark_child_excluded(top.id, false).unwrap();
        assert!(!store.get_file_by_id(leaf.id).unwrap().unwrap().excluded);
    }

    #[test]
    fn exclusion_resets_remote_events() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let remote = store
            .create_file(&NewFile::file("r", Some(a.id)).with_uuid("fr"))
            .unwrap();
        let event = store
            .record_event(
                remote.id,
                NewEvent::create("r", Some("fa".into()))
                    .received()
                    .with_server_event_id(2),
            )
            .unwrap();
        store.apply_event(event.id).unwrap();

        store.mark_child_excluded(a.id, true).unwrap();
        let event = store.get_event_by_id(event.id).unwrap().unwrap();
        assert_eq!(event.state, EventState::Received);
        let remote = store.get_file_by_id(remote.id).unwrap().unwrap();
        assert!(remote.excluded);
        assert_eq!(remote.event_id, None);
    }

    #[test]
    fn unapplied_remote_events_are_dropped() {
        let store = store();
        let (kept, kept_event) = confirmed(&store, NewFile::file("kept", None), None, 1, "fk");

        // Placeholder for a remote create that never got applied.
        let placeholder = store
            .create_file(&NewFile::file("later", None).with_uuid("fl"))
            .unwrap();
        store
            .record_event(
                placeholder.id,
                NewEvent::create("later", None).received().with_server_event_id(2),
            )
            .unwrap();

        // Applied remote update stays, a newer unapplied one goes.
        let applied = store
            .record_event(
                kept.id,
                NewEvent::update("h1", 1).received().with_server_event_id(3),
            )
            .unwrap();
        store.apply_event(applied.id).unwrap();
        store
            .record_event(
                kept.id,
                NewEvent::update("h2", 2).received().with_server_event_id(4),
            )
            .unwrap();

        assert_eq!(store.delete_remote_events_not_applied().unwrap(), 2);
        assert_eq!(store.get_file_by_id(placeholder.id).unwrap(), None);
        let ids: Vec<_> = store
            .get_file_events(kept.id)
            .unwrap()
            .into_iter()
            .map(|event| event.id)
            .collect();
        assert_eq!(ids, vec![kept_event.id, applied.id]);
    }

    #[test]
    fn excluded_nodes_are_dropped() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let (inner, _) = confirmed(&store, NewFile::file("x", Some(a.id)), Some("fa"), 2, "fx");
        store.mark_child_excluded(a.id, true).unwrap();

        store.delete_remote_events_not_applied().unwrap();
        assert_eq!(store.get_file_by_id(inner.id).unwrap(), None);
        assert!(store.get_file_by_id(a.id).unwrap().is_some());
    }

    #[test]
    fn share_size_counts_live_files() {
        let store = store();
        let (a, _) = confirmed(&store, NewFile::folder("A", None), None, 1, "fa");
        let f1 = store.create_file(&NewFile::file("f1", Some(a.id))).unwrap();
        store
            .record_event(
                f1.id,
                NewEvent::create("f1", Some("fa".into())).with_content("h1", 100),
            )
            .unwrap();
        let f2 = store.create_file(&NewFile::file("f2", None)).unwrap();
        store
            .record_event(f2.id, NewEvent::create("f2", None).with_content("h2", 20))
            .unwrap();
        let f3 = store.create_file(&NewFile::file("f3", None)).unwrap();
        store
            .record_event(f3.id, NewEvent::create("f3", None).with_content("h3", 7))
            .unwrap();
        store.record_event(f3.id, NewEvent::delete()).unwrap();

        assert_eq!(store.get_share_size().unwrap(), 120);
    }

    /// `folder` with `count` local files named `{prefix}{n}` of `size` bytes
    fn fill(store: &EventStore, folder: Option<&File>, prefix: &str, count: usize, size: i64) -> Vec<FileId> {
        (0..count)
            .map(|n| {
                let name = format!("{prefix}{n}");
                let file = store
                    .create_file(&NewFile::file(&name, folder.map(|folder| folder.id)))
                    .unwrap();
                let folder_uuid = folder.and_then(|folder| folder.uuid.clone());
                store
                    .record_event(
                        file.id,
                        NewEvent::create(&name, folder_uuid).with_content(format!("h-{name}"), size),
                    )
                    .unwrap();
                file.id
            })
            .collect()
    }

    #[test]
    fn wide_folders_are_read_in_pages() {
        let config = StoreConfig::new("unused").with_page_size(2);
        let store = EventStore::open_in_memory(&config, StoreAlerts::new()).unwrap();
        let (wide, _) = confirmed(&store, NewFile::folder("wide", None), None, 1, "fw");
        let (sub, _) = confirmed(&store, NewFile::folder("sub", Some(wide.id)), Some("fw"), 2, "fs");
        let mut inside = vec![sub.id];
        inside.extend(fill(&store, Some(&wide), "w", 5, 10));
        inside.extend(fill(&store, Some(&sub), "s", 3, 1));
        fill(&store, None, "r", 3, 100);

        assert_eq!(store.get_share_size().unwrap(), 353);

        let mut pages = Vec::new();
        store
            .for_each_file_page(Some("fw"), FileWalk::default(), |page| {
                assert!(page.len() <= 2);
                pages.push(page.len());
                Ok(())
            })
            .unwrap();
        assert_eq!(pages.iter().sum::<usize>(), 8);

        let everything = store.get_files_by_folder_uuid(None, FileWalk::default()).unwrap();
        assert_eq!(everything.len(), 11);

        store.mark_child_excluded(wide.id, true).unwrap();
        for id in &inside {
            assert!(store.get_file_by_id(*id).unwrap().unwrap().excluded);
        }
        assert!(!store.get_file_by_id(wide.id).unwrap().unwrap().excluded);

        // Marking again is a no-op and still terminates.
        store.mark_child_excluded(wide.id, true).unwrap();
    }
}
