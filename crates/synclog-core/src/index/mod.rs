//! Known-file index: path to fingerprint cache used by the watcher.
//!
//! The index is a hint. When it disagrees with the filesystem or the event
//! store, the filesystem wins and the entry is rewritten.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::alerts::{StoreAlerts, StoreKind};
use crate::config::StoreConfig;
use crate::db::{migrations, Database};
use crate::error::{Error, Result};
use crate::models::{FileId, KnownFile};
use crate::util::{is_within, join_path, normalize_relative_path};

const COLUMNS: &str =
    "relative_path, is_folder, file_hash, mtime, size, events_file_id, was_updated";

/// Matches `?1` itself and everything below it; an empty `?1` matches all
const UNDER_PREFIX: &str = "(?1 = '' OR relative_path = ?1
    OR substr(relative_path, 1, length(?1) + 1) = ?1 || '/')";

/// Persistent path index backed by `storage.db`
pub struct KnownFileIndex {
    db: Database,
}

impl KnownFileIndex {
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let db = Database::open(path, &migrations::STORAGE, StoreKind::Storage, config, alerts)?;
        Ok(Self { db })
    }

    pub fn open_in_memory(config: &StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let db =
            Database::open_in_memory(&migrations::STORAGE, StoreKind::Storage, config, alerts)?;
        Ok(Self { db })
    }

    pub fn get(&self, path: &str) -> Result<Option<KnownFile>> {
        let path = normalize_relative_path(path);
        self.db.read(|tx| get_entry(tx, &path))
    }

    /// Insert or replace the entry for `file.relative_path`
    pub fn upsert(&self, file: &KnownFile) -> Result<()> {
        let path = normalize_relative_path(&file.relative_path);
        if path.is_empty() {
            return Err(Error::InvalidInput("known file path can't be empty".into()));
        }
        self.db.write(|tx| {
            tx.execute(
                &format!(
                    "INSERT INTO known_files ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(relative_path) DO UPDATE SET
                        is_folder = excluded.is_folder,
                        file_hash = excluded.file_hash,
                        mtime = excluded.mtime,
                        size = excluded.size,
                        events_file_id = excluded.events_file_id,
                        was_updated = excluded.was_updated"
                ),
                params![
                    path,
                    file.is_folder,
                    file.file_hash,
                    file.mtime,
                    file.size,
                    file.events_file_id.map(|id| id.0),
                    file.was_updated,
                ],
            )?;
            Ok(())
        })
    }

    /// Remove one entry; returns whether it existed
    pub fn delete(&self, path: &str) -> Result<bool> {
        let path = normalize_relative_path(path);
        self.db.write(|tx| {
            Ok(tx.execute("DELETE FROM known_files WHERE relative_path = ?1", params![path])? > 0)
        })
    }

    /// Rewrite `old_prefix` and everything below it to live under
    /// `new_prefix`, keeping relative structure.
    ///
    /// Runs as one transaction. Stale entries already under `new_prefix`
    /// are replaced. Returns the number of entries moved.
    pub fn move_subtree(&self, old_prefix: &str, new_prefix: &str) -> Result<usize> {
        let old_prefix = normalize_relative_path(old_prefix);
        let new_prefix = normalize_relative_path(new_prefix);
        if old_prefix == new_prefix {
            return Ok(0);
        }
        if old_prefix.is_empty()
            || new_prefix.is_empty()
            || is_within(&old_prefix, &new_prefix)
            || is_within(&new_prefix, &old_prefix)
        {
            return Err(Error::InvalidInput(format!(
                "can't move '{old_prefix}' to '{new_prefix}'"
            )));
        }

        let moved = self.db.write(|tx| {
            let entries = select_under(tx, &old_prefix)?;

            let stale = tx.execute(
                &format!("DELETE FROM known_files WHERE {UNDER_PREFIX}"),
                params![new_prefix],
            )?;
            if stale > 0 {
                tracing::warn!(stale, %new_prefix, "Replaced stale known files at move target");
            }

            let mut stmt =
                tx.prepare("UPDATE known_files SET relative_path = ?1 WHERE relative_path = ?2")?;
            for entry in &entries {
                let rest = entry
                    .relative_path
                    .strip_prefix(old_prefix.as_str())
                    .unwrap_or_default()
                    .trim_start_matches('/');
                let target = if rest.is_empty() {
                    new_prefix.clone()
                } else {
                    join_path(&new_prefix, rest)
                };
                stmt.execute(params![target, entry.relative_path])?;
            }
            Ok(entries.len())
        })?;

        tracing::debug!(moved, %old_prefix, %new_prefix, "Moved known files");
        Ok(moved)
    }

    /// Forget cached hashes and mtimes of all files, keeping the rows
    pub fn clear_hashes(&self) -> Result<usize> {
        let cleared = self.db.write(|tx| {
            Ok(tx.execute(
                "UPDATE known_files SET file_hash = NULL, mtime = 0 WHERE is_folder = 0",
                [],
            )?)
        })?;
        tracing::info!(cleared, "Cleared known file hashes");
        Ok(cleared)
    }

    /// Paths of known files or folders, optionally limited to `parent_dir`
    /// and skipping anything below `exclude_dirs`
    pub fn known_paths(
        &self,
        is_folder: bool,
        parent_dir: Option<&str>,
        exclude_dirs: &[String],
    ) -> Result<Vec<String>> {
        let parent = parent_dir.map(normalize_relative_path);
        let excluded: Vec<String> = exclude_dirs
            .iter()
            .map(|dir| normalize_relative_path(dir))
            .collect();

        let paths = self.db.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT relative_path FROM known_files WHERE is_folder = ?1 ORDER BY relative_path",
            )?;
            let paths = stmt
                .query_map(params![is_folder], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(paths)
        })?;

        Ok(paths
            .into_iter()
            .filter(|path| match parent.as_deref() {
                Some(parent) => is_within(parent, path),
                None => true,
            })
            .filter(|path| !excluded.iter().any(|dir| is_within(dir, path)))
            .collect())
    }

    pub fn get_by_file_id(&self, file_id: FileId) -> Result<Option<KnownFile>> {
        self.db.read(|tx| {
            let sql = format!("SELECT {COLUMNS} FROM known_files WHERE events_file_id = ?1");
            Ok(tx
                .query_row(&sql, params![file_id.0], parse_known_file)
                .optional()?)
        })
    }

    /// Re-point the entry tracking `old` to `new`; returns whether one was found
    pub fn change_file_id(&self, old: FileId, new: FileId) -> Result<bool> {
        let changed = self.db.write(|tx| {
            Ok(tx.execute(
                "UPDATE known_files SET events_file_id = ?1 WHERE events_file_id = ?2",
                params![new.0, old.0],
            )?)
        })?;
        if changed == 0 {
            tracing::warn!(%old, "Could not find known file with events file id");
        } else {
            tracing::debug!(%old, %new, "Changed events file id");
        }
        Ok(changed > 0)
    }

    /// `prefix` and everything below it, ordered by path
    pub fn subtree(&self, prefix: &str) -> Result<Vec<KnownFile>> {
        let prefix = normalize_relative_path(prefix);
        self.db.read(|tx| select_under(tx, &prefix))
    }

    pub fn delete_subtree(&self, prefix: &str) -> Result<usize> {
        let prefix = normalize_relative_path(prefix);
        self.db.write(|tx| {
            Ok(tx.execute(
                &format!("DELETE FROM known_files WHERE {UNDER_PREFIX}"),
                params![prefix],
            )?)
        })
    }

    /// Drop every entry below `dirs`; returns the deleted file paths
    pub fn delete_directories(&self, dirs: &[String]) -> Result<Vec<String>> {
        if dirs.is_empty() {
            return Ok(Vec::new());
        }
        self.db.write(|tx| {
            let mut deleted_files = Vec::new();
            for dir in dirs {
                let dir = normalize_relative_path(dir);
                if dir.is_empty() {
                    continue;
                }
                for entry in select_under(tx, &dir)? {
                    if !entry.is_folder {
                        deleted_files.push(entry.relative_path);
                    }
                }
                tx.execute(
                    &format!("DELETE FROM known_files WHERE {UNDER_PREFIX}"),
                    params![dir],
                )?;
            }
            Ok(deleted_files)
        })
    }

    /// Whether any entry carries `hash`
    pub fn hash_known(&self, hash: &str) -> Result<bool> {
        if hash.is_empty() {
            return Ok(false);
        }
        self.db.read(|tx| {
            Ok(tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM known_files WHERE file_hash = ?1)",
                params![hash],
                |row| row.get(0),
            )?)
        })
    }

    /// Most recently modified files first
    pub fn last_files(&self, limit: usize, offset: usize) -> Result<Vec<KnownFile>> {
        self.db.read(|tx| {
            let sql = format!(
                "SELECT {COLUMNS} FROM known_files WHERE is_folder = 0
                 ORDER BY mtime DESC, relative_path LIMIT ?1 OFFSET ?2"
            );
            let mut stmt = tx.prepare(&sql)?;
            let files = stmt
                .query_map(params![limit as i64, offset as i64], parse_known_file)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(files)
        })
    }

    /// Drop entries no tree node claims; folders take their subtree along.
    ///
    /// Returns whether anything was found.
    pub fn delete_entries_without_file_id(&self) -> Result<bool> {
        self.db.write(|tx| {
            let sql = format!("SELECT {COLUMNS} FROM known_files WHERE events_file_id IS NULL");
            let mut stmt = tx.prepare(&sql)?;
            let orphans = stmt
                .query_map([], parse_known_file)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            for orphan in &orphans {
                if orphan.is_folder {
                    tx.execute(
                        &format!("DELETE FROM known_files WHERE {UNDER_PREFIX}"),
                        params![orphan.relative_path],
                    )?;
                } else {
                    tx.execute(
                        "DELETE FROM known_files WHERE relative_path = ?1",
                        params![orphan.relative_path],
                    )?;
                }
                tracing::debug!(
                    path = %orphan.relative_path,
                    is_folder = orphan.is_folder,
                    "Deleted known file with empty events file id"
                );
            }
            Ok(!orphans.is_empty())
        })
    }

    pub fn clean(&self) -> Result<()> {
        self.db.write(|tx| {
            tx.execute("DELETE FROM known_files", [])?;
            Ok(())
        })?;
        tracing::info!("Cleaned known file index");
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        self.db
            .read(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM known_files", [], |row| row.get(0))?))
    }
}

fn parse_known_file(row: &Row<'_>) -> rusqlite::Result<KnownFile> {
    Ok(KnownFile {
        relative_path: row.get(0)?,
        is_folder: row.get(1)?,
        file_hash: row.get(2)?,
        mtime: row.get(3)?,
        size: row.get(4)?,
        events_file_id: row.get::<_, Option<i64>>(5)?.map(FileId),
        was_updated: row.get(6)?,
    })
}

fn get_entry(conn: &Connection, path: &str) -> Result<Option<KnownFile>> {
    let sql = format!("SELECT {COLUMNS} FROM known_files WHERE relative_path = ?1");
    Ok(conn
        .query_row(&sql, params![path], parse_known_file)
        .optional()?)
}

fn select_under(conn: &Connection, prefix: &str) -> Result<Vec<KnownFile>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM known_files WHERE {UNDER_PREFIX} ORDER BY relative_path"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params![prefix], parse_known_file)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}
