//! Content-addressable copy store.
//!
//! Blobs live as `copies/<hash>`; reference counts live in `copies.db`.
//! Counts are only ever adjusted here, blobs are only removed by
//! [`CopyStore::clean_unreferenced`] and [`CopyStore::reconcile_with_filesystem`].
//! File I/O never happens inside a database transaction.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, OptionalExtension};

use crate::alerts::{StoreAlertKind, StoreAlerts, StoreKind};
use crate::config::{StoreConfig, COPIES_DB_NAME};
use crate::db::{migrations, Database};
use crate::error::{Error, Result};
use crate::models::Copy;

const COPIES_LOG_TARGET: &str = "synclog::copies";
const DOWNLOAD_SUFFIX: &str = ".download";
const INFO_SUFFIX: &str = ".info";

/// Reference-counted blob storage under `<data_dir>/copies`
pub struct CopyStore {
    db: Database,
    copies_dir: PathBuf,
    extended_logging: bool,
    /// Postponed deltas per hash, flushed by `commit_batched_changes`
    pending: Mutex<HashMap<String, i64>>,
    /// Shared by count writers, exclusive for `clean_unreferenced`
    cleanup: RwLock<()>,
}

impl CopyStore {
    pub fn open(config: &StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let copies_dir = config.copies_dir();
        fs::create_dir_all(&copies_dir)?;
        let db = Database::open(
            config.copies_db_path(),
            &migrations::COPIES,
            StoreKind::Copies,
            config,
            alerts,
        )?;
        Ok(Self::with_database(db, copies_dir, config))
    }

    /// In-memory counts; blobs still go to the configured copies directory
    pub fn open_in_memory(config: &StoreConfig, alerts: StoreAlerts) -> Result<Self> {
        let db = Database::open_in_memory(&migrations::COPIES, StoreKind::Copies, config, alerts)?;
        Ok(Self::with_database(db, config.copies_dir(), config))
    }

    fn with_database(db: Database, copies_dir: PathBuf, config: &StoreConfig) -> Self {
        let store = Self {
            db,
            copies_dir,
            extended_logging: config.extended_copy_logging,
            pending: Mutex::new(HashMap::new()),
            cleanup: RwLock::new(()),
        };
        if store.extended_logging {
            tracing::debug!(target: COPIES_LOG_TARGET, "Copies init");
        }
        store
    }

    pub fn copies_dir(&self) -> &Path {
        &self.copies_dir
    }

    /// Add one owner of `hash`.
    ///
    /// With `postponed` the delta is kept in memory until
    /// [`commit_batched_changes`](Self::commit_batched_changes). Returns the
    /// stored count, or the pending delta when postponed.
    pub fn add_reference(&self, hash: &str, reason: &str, postponed: bool) -> Result<i64> {
        check_hash(hash)?;
        let count = if postponed {
            let mut pending = self.pending.lock();
            let delta = pending.entry(hash.to_string()).or_default();
            *delta += 1;
            *delta
        } else {
            let _writer = self.cleanup.read();
            self.db.write(|tx| {
                Ok(tx.query_row(
                    "INSERT INTO copies (hash, count) VALUES (?1, 1)
                     ON CONFLICT(hash) DO UPDATE SET count = count + 1
                     RETURNING count",
                    params![hash],
                    |row| row.get(0),
                )?)
            })?
        };

        tracing::debug!("File copy reference added, {hash}, count: {count}, postponed is {postponed}");
        self.log_extended("added", hash, count, postponed, reason);
        Ok(count)
    }

    /// Drop one owner of `hash`.
    ///
    /// Removing from an unknown hash deliberately records a count of `-1`, so
    /// that immediate and postponed accounting agree for every interleaving.
    /// A later add brings the row back to zero; otherwise
    /// [`clean_unreferenced`](Self::clean_unreferenced) reaps it like any
    /// other row at or below zero.
    pub fn remove_reference(&self, hash: &str, reason: &str, postponed: bool) -> Result<i64> {
        check_hash(hash)?;
        let count = if postponed {
            let mut pending = self.pending.lock();
            let delta = pending.entry(hash.to_string()).or_default();
            *delta -= 1;
            *delta
        } else {
            let _writer = self.cleanup.read();
            self.db.write(|tx| {
                let known: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM copies WHERE hash = ?1)",
                    params![hash],
                    |row| row.get(0),
                )?;
                if !known {
                    tracing::warn!("Trying to remove copy reference for non-existent copy {hash}");
                }
                Ok(tx.query_row(
                    "INSERT INTO copies (hash, count) VALUES (?1, -1)
                     ON CONFLICT(hash) DO UPDATE SET count = count - 1
                     RETURNING count",
                    params![hash],
                    |row| row.get(0),
                )?)
            })?
        };

        tracing::debug!(
            "File copy reference removed, {hash}, count: {count}, postponed is {postponed}"
        );
        self.log_extended("removed", hash, count, postponed, reason);
        Ok(count)
    }

    /// Flush postponed deltas in one transaction.
    ///
    /// Cleanup is held off from taking the deltas until they are committed or
    /// merged back after a failure, so a flush in flight is never mistaken for
    /// "nothing pending". Returns the number of hashes written.
    pub fn commit_batched_changes(&self) -> Result<usize> {
        let _writer = self.cleanup.read();
        let changes = std::mem::take(&mut *self.pending.lock());
        let changes: Vec<(String, i64)> =
            changes.into_iter().filter(|(_, delta)| *delta != 0).collect();
        if changes.is_empty() {
            return Ok(0);
        }

        let result = self.db.write(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO copies (hash, count) VALUES (?1, ?2)
                 ON CONFLICT(hash) DO UPDATE SET count = count + excluded.count",
            )?;
            for (hash, delta) in &changes {
                stmt.execute(params![hash, delta])?;
            }
            Ok(())
        });

        if let Err(error) = result {
            let mut pending = self.pending.lock();
            for (hash, delta) in changes {
                *pending.entry(hash).or_default() += delta;
            }
            return Err(error);
        }

        tracing::debug!("Committed last copies changes for {} hashes", changes.len());
        if self.extended_logging {
            tracing::debug!(target: COPIES_LOG_TARGET, ?changes, "Committed last copies changes");
        }
        Ok(changes.len())
    }

    /// Number of hashes with a non-zero postponed delta
    pub fn pending_changes(&self) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|delta| **delta != 0)
            .count()
    }

    /// Discard postponed deltas without writing them
    pub fn clear_batched_changes(&self) {
        self.pending.lock().clear();
    }

    pub fn get_copy(&self, hash: &str) -> Result<Option<Copy>> {
        self.db.read(|tx| {
            Ok(tx
                .query_row(
                    "SELECT id, hash, count FROM copies WHERE hash = ?1",
                    params![hash],
                    |row| {
                        Ok(Copy {
                            id: row.get(0)?,
                            hash: row.get(1)?,
                            count: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Stored count for `hash`, ignoring postponed deltas
    pub fn reference_count(&self, hash: &str) -> Result<Option<i64>> {
        Ok(self.get_copy(hash)?.map(|copy| copy.count))
    }

    pub fn copy_file_path(&self, hash: &str) -> Result<PathBuf> {
        check_hash(hash)?;
        Ok(self.copies_dir.join(hash))
    }

    pub fn copy_exists(&self, hash: &str) -> Result<bool> {
        Ok(self.copy_file_path(hash)?.is_file())
    }

    /// Blob size in bytes, 0 when the blob is missing
    pub fn get_copy_size(&self, hash: &str) -> Result<u64> {
        match fs::metadata(self.copy_file_path(hash)?) {
            Ok(metadata) => Ok(metadata.len()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(0),
            Err(error) => Err(error.into()),
        }
    }

    /// Store `bytes` as a blob keyed by their blake3 hash.
    ///
    /// Does not add a reference.
    pub fn import_bytes(&self, bytes: &[u8]) -> Result<String> {
        let hash = blake3::hash(bytes).to_hex().to_string();
        let target = self.copy_file_path(&hash)?;
        if !target.is_file() {
            let temp = self.copies_dir.join(format!("{hash}{DOWNLOAD_SUFFIX}"));
            fs::create_dir_all(&self.copies_dir)?;
            fs::write(&temp, bytes)?;
            fs::rename(&temp, &target)?;
            tracing::debug!(%hash, size = bytes.len(), "Imported copy");
        }
        Ok(hash)
    }

    /// Copy the file at `path` into the store keyed by its blake3 hash.
    ///
    /// Does not add a reference.
    pub fn import_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let mut hasher = blake3::Hasher::new();
        let mut source = fs::File::open(path)?;
        io::copy(&mut source, &mut hasher)?;
        let hash = hasher.finalize().to_hex().to_string();

        let target = self.copy_file_path(&hash)?;
        if !target.is_file() {
            let temp = self.copies_dir.join(format!("{hash}{DOWNLOAD_SUFFIX}"));
            fs::create_dir_all(&self.copies_dir)?;
            fs::copy(path, &temp)?;
            fs::rename(&temp, &target)?;
            tracing::debug!(%hash, path = %path.display(), "Imported copy");
        }
        Ok(hash)
    }

    /// Delete rows with a count of zero or less, then their blobs.
    ///
    /// Refuses to run while postponed deltas are pending. No count can change
    /// from the pending check until the last blob is gone, and the count is
    /// re-checked by the deleting statement itself. Returns the deleted hashes.
    pub fn clean_unreferenced(&self) -> Result<Vec<String>> {
        let _cleaner = self.cleanup.write();
        let pending = self.pending_changes();
        if pending > 0 {
            return Err(Error::PendingReferenceChanges(pending));
        }

        let deleted = self.db.write(|tx| {
            let mut stmt = tx.prepare("DELETE FROM copies WHERE count <= 0 RETURNING hash")?;
            let hashes = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hashes)
        })?;

        for hash in &deleted {
            self.delete_blob(hash)?;
        }

        if !deleted.is_empty() {
            tracing::info!("Cleaned {} unreferenced copies", deleted.len());
        }
        Ok(deleted)
    }

    /// Remove blobs that have no row.
    ///
    /// Keeps `copies.db` and its sidecars, partial downloads, `.info` files
    /// and anything that is not a regular file. Returns the number of blobs
    /// removed.
    pub fn reconcile_with_filesystem(&self) -> Result<usize> {
        let known: HashSet<String> = self.db.read(|tx| {
            let mut stmt = tx.prepare("SELECT hash FROM copies")?;
            let hashes = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(hashes)
        })?;

        let entries = match fs::read_dir(&self.copies_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::warn!(
                    "Can't remove copies files. Copies directory {} is missing",
                    self.copies_dir.display()
                );
                self.db
                    .alerts()
                    .emit(StoreAlertKind::RootUnavailable, StoreKind::Copies);
                return Ok(0);
            }
            Err(error) => return Err(error.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(COPIES_DB_NAME)
                || name.ends_with(DOWNLOAD_SUFFIX)
                || name.ends_with(INFO_SUFFIX)
                || known.contains(&name)
                || !entry.file_type()?.is_file()
            {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        if removed > 0 {
            tracing::info!("Removed {removed} copies not in database");
        }
        Ok(removed)
    }

    /// Drop every row and postponed delta, and with `with_files` every blob
    pub fn clean(&self, with_files: bool) -> Result<()> {
        let _cleaner = self.cleanup.write();
        let hashes = self.db.write(|tx| {
            let mut stmt = tx.prepare("DELETE FROM copies RETURNING hash")?;
            let hashes = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hashes)
        })?;
        self.clear_batched_changes();

        if with_files {
            for hash in &hashes {
                self.delete_blob(hash)?;
            }
        }
        tracing::info!("Cleaned copies data base");
        Ok(())
    }

    fn delete_blob(&self, hash: &str) -> Result<()> {
        match fs::remove_file(self.copy_file_path(hash)?) {
            Ok(()) => {
                if self.extended_logging {
                    tracing::debug!(target: COPIES_LOG_TARGET, %hash, "Copy file deleted");
                }
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn log_extended(&self, action: &str, hash: &str, count: i64, postponed: bool, reason: &str) {
        if !self.extended_logging {
            return;
        }
        let exists = self.copies_dir.join(hash).is_file();
        tracing::debug!(
            target: COPIES_LOG_TARGET,
            "File copy reference {action}, {hash}, count: {count}, postponed is {postponed}. \
             File exists: {exists}. Reason: {reason}"
        );
    }
}

/// Hashes double as blob file names
fn check_hash(hash: &str) -> Result<()> {
    if hash.is_empty() || hash.contains(['/', '\\']) || hash.starts_with('.') {
        return Err(Error::InvalidInput(format!("invalid copy hash '{hash}'")));
    }
    Ok(())
}
