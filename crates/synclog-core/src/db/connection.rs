//! Database connection management
//!
//! Every store operation runs inside a scoped transaction obtained from
//! [`Database::read`] or [`Database::write`]: a pooled connection is checked
//! out, the closure runs inside `BEGIN`, the transaction commits when the
//! closure succeeds and rolls back otherwise, and the connection goes back to
//! the pool on every path.

use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};

use super::migrations::{self, Schema};
use crate::alerts::{StoreAlertKind, StoreAlerts, StoreKind};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

const DISK_FULL_MESSAGE: &str = "database or disk is full";

struct Pool {
    idle: Vec<Connection>,
    open: usize,
}

/// A pooled `SQLite` database with scoped transactions
pub struct Database {
    kind: StoreKind,
    path: Option<PathBuf>,
    config: StoreConfig,
    alerts: StoreAlerts,
    max_connections: usize,
    pool: Mutex<Pool>,
    returned: Condvar,
}

/// Connection checked out of the pool, returned on drop
struct PooledConnection<'a> {
    db: &'a Database,
    conn: Option<Connection>,
}

impl PooledConnection<'_> {
    fn get(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Database("connection already returned to the pool".into()))
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.db.release(conn);
        }
    }
}

impl Database {
    /// Open the database file at `path`, creating and migrating it as needed.
    ///
    /// A file that cannot be opened or upgraded is quarantined and rebuilt
    /// from scratch.
    pub fn open(
        path: impl AsRef<Path>,
        schema: &'static Schema,
        kind: StoreKind,
        config: &StoreConfig,
        alerts: StoreAlerts,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match Self::open_migrated(&path, schema, config) {
            Ok(conn) => conn,
            Err(error) if Self::is_rebuildable_error(&error) => {
                tracing::warn!(
                    "Cannot open {} database at {}: {}. Rebuilding it.",
                    schema.name,
                    path.display(),
                    error
                );
                quarantine_corrupted_db_files(&path)?;
                Self::open_migrated(&path, schema, config)?
            }
            Err(error) => return Err(error),
        };

        tracing::debug!("Opened {} database at {}", schema.name, path.display());
        Ok(Self::with_connection(
            kind,
            Some(path),
            config,
            alerts,
            config.max_connections.max(1),
            conn,
        ))
    }

    /// Open an in-memory database (useful for testing)
    ///
    /// An in-memory database lives in its single connection, so the pool is
    /// capped at one.
    pub fn open_in_memory(
        schema: &'static Schema,
        kind: StoreKind,
        config: &StoreConfig,
        alerts: StoreAlerts,
    ) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        configure(&conn, config)?;
        migrations::run(&mut conn, schema)?;
        Ok(Self::with_connection(kind, None, config, alerts, 1, conn))
    }

    fn with_connection(
        kind: StoreKind,
        path: Option<PathBuf>,
        config: &StoreConfig,
        alerts: StoreAlerts,
        max_connections: usize,
        conn: Connection,
    ) -> Self {
        Self {
            kind,
            path,
            config: config.clone(),
            alerts,
            max_connections,
            pool: Mutex::new(Pool {
                idle: vec![conn],
                open: 1,
            }),
            returned: Condvar::new(),
        }
    }

    fn open_migrated(path: &Path, schema: &Schema, config: &StoreConfig) -> Result<Connection> {
        let mut conn = Connection::open(path)?;
        configure(&conn, config)?;
        migrations::run(&mut conn, schema)?;
        Ok(conn)
    }

    fn is_rebuildable_error(error: &Error) -> bool {
        match error {
            Error::Migration { .. } => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt
            ),
            other => other
                .to_string()
                .to_ascii_lowercase()
                .contains("file is not a database"),
        }
    }

    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub const fn alerts(&self) -> &StoreAlerts {
        &self.alerts
    }

    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Run `f` inside an immediate (write-locking) transaction
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut pooled = self.acquire()?;
        let result = pooled
            .get()
            .and_then(|conn| Self::run_in_transaction(conn, TransactionBehavior::Immediate, f));
        drop(pooled);
        result.map_err(|error| self.classify(error))
    }

    /// Run `f` inside a deferred transaction marked query-only
    pub fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut pooled = self.acquire()?;
        let conn = pooled.get()?;
        let result = conn
            .pragma_update(None, "query_only", true)
            .map_err(Error::from)
            .and_then(|()| Self::run_in_transaction(conn, TransactionBehavior::Deferred, f));
        if let Err(error) = conn.pragma_update(None, "query_only", false) {
            tracing::warn!(
                "Failed to clear query_only on {} connection: {error}",
                self.kind.as_str()
            );
        }
        drop(pooled);
        result.map_err(|error| self.classify(error))
    }

    fn run_in_transaction<T>(
        conn: &mut Connection,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = conn.transaction_with_behavior(behavior)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(error) => {
                tx.rollback().ok();
                Err(error)
            }
        }
    }

    /// Map disk-full and lock failures to their distinct errors and raise the
    /// matching alert.
    fn classify(&self, error: Error) -> Error {
        if let Error::Sqlite(rusqlite::Error::SqliteFailure(failure, message)) = &error {
            match failure.code {
                ErrorCode::DiskFull => {
                    self.alerts
                        .emit(StoreAlertKind::StorageExhausted, self.kind);
                    return Error::StorageExhausted(
                        message.clone().unwrap_or_else(|| DISK_FULL_MESSAGE.to_string()),
                    );
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    self.alerts.emit(StoreAlertKind::Busy, self.kind);
                    return Error::StoreBusy;
                }
                _ => {}
            }
        }
        if matches!(error, Error::Sqlite(_)) && error.to_string().contains(DISK_FULL_MESSAGE) {
            self.alerts
                .emit(StoreAlertKind::StorageExhausted, self.kind);
            return Error::StorageExhausted(DISK_FULL_MESSAGE.to_string());
        }
        error
    }

    fn acquire(&self) -> Result<PooledConnection<'_>> {
        let mut pool = self.pool.lock();
        loop {
            if let Some(conn) = pool.idle.pop() {
                return Ok(PooledConnection {
                    db: self,
                    conn: Some(conn),
                });
            }
            if pool.open < self.max_connections {
                if let Some(path) = self.path.as_deref() {
                    pool.open += 1;
                    drop(pool);
                    return match Self::connect(path, &self.config) {
                        Ok(conn) => Ok(PooledConnection {
                            db: self,
                            conn: Some(conn),
                        }),
                        Err(error) => {
                            self.pool.lock().open -= 1;
                            self.returned.notify_one();
                            Err(error)
                        }
                    };
                }
            }
            self.returned.wait(&mut pool);
        }
    }

    fn connect(path: &Path, config: &StoreConfig) -> Result<Connection> {
        let conn = Connection::open(path)?;
        configure(&conn, config)?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        self.pool.lock().idle.push(conn);
        self.returned.notify_one();
    }
}

/// Configure `SQLite` for concurrent access
fn configure(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.busy_timeout(config.busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

/// Move a broken database file aside as `<name>.corrupt-<millis>` and remove
/// its `-wal`/`-shm`/`-journal` sidecars.
pub fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
        return Ok(());
    };

    if db_path.exists() {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted DB file from {} to {}",
            db_path.display(),
            backup_path.display()
        );
    }

    let sidecar_prefix = format!("{base_name}-");
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(&sidecar_prefix) {
            let path = entry.path();
            std::fs::remove_file(&path)?;
            tracing::warn!("Removed stale DB sidecar {}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::COPIES;
    use rusqlite::params;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn count_copies(db: &Database) -> i64 {
        db.read(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM copies", [], |row| row.get(0))?))
            .unwrap()
    }

    fn memory_db(alerts: StoreAlerts) -> Database {
        let config = StoreConfig::new("unused");
        Database::open_in_memory(&COPIES, StoreKind::Copies, &config, alerts).unwrap()
    }

    #[test]
    fn test_write_commits_on_success() {
        let db = memory_db(StoreAlerts::new());
        db.write(|tx| {
            tx.execute("INSERT INTO copies (hash, count) VALUES (?1, 1)", params!["h1"])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count_copies(&db), 1);
    }

    #[test]
    fn test_write_rolls_back_on_error() {
        let db = memory_db(StoreAlerts::new());
        let result: Result<()> = db.write(|tx| {
            tx.execute("INSERT INTO copies (hash, count) VALUES (?1, 1)", params!["h1"])?;
            Err(Error::InvalidInput("abort".into()))
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(count_copies(&db), 0);
    }

    #[test]
    fn test_read_is_query_only() {
        let db = memory_db(StoreAlerts::new());
        let result = db.read(|tx| {
            tx.execute("INSERT INTO copies (hash, count) VALUES ('h1', 1)", [])?;
            Ok(())
        });
        assert!(result.is_err());

        db.write(|tx| {
            tx.execute("INSERT INTO copies (hash, count) VALUES ('h1', 1)", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count_copies(&db), 1);
    }

    #[test]
    fn test_disk_full_is_classified_and_alerted() {
        let alerts = StoreAlerts::new();
        let mut receiver = alerts.subscribe();
        let db = memory_db(alerts);

        let result: Result<()> = db.write(|_| {
            Err(Error::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
                Some(DISK_FULL_MESSAGE.to_string()),
            )))
        });

        assert!(matches!(result, Err(Error::StorageExhausted(_))));
        let alert = receiver.try_recv().unwrap();
        assert_eq!(alert.kind, StoreAlertKind::StorageExhausted);
        assert_eq!(alert.store, StoreKind::Copies);
    }

    #[test]
    fn test_busy_is_classified() {
        let db = memory_db(StoreAlerts::new());
        let result: Result<()> = db.write(|_| {
            Err(Error::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            )))
        });
        assert!(matches!(result, Err(Error::StoreBusy)));
    }

    #[test]
    fn test_pool_serves_concurrent_sessions() {
        let tmp = tempdir().unwrap();
        let config = StoreConfig::new(tmp.path()).with_max_connections(2);
        let db = Arc::new(
            Database::open(
                tmp.path().join("copies.db"),
                &COPIES,
                StoreKind::Copies,
                &config,
                StoreAlerts::new(),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    db.write(|tx| {
                        tx.execute(
                            "INSERT INTO copies (hash, count) VALUES (?1, 1)",
                            params![format!("h{i}")],
                        )?;
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count_copies(&db), 8);
    }

    #[test]
    fn test_corrupted_file_is_quarantined_and_rebuilt() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("copies.db");
        std::fs::write(&db_path, vec![0x42_u8; 4096]).unwrap();
        std::fs::write(tmp.path().join("copies.db-wal"), b"wal").unwrap();

        let config = StoreConfig::new(tmp.path());
        let db = Database::open(
            &db_path,
            &COPIES,
            StoreKind::Copies,
            &config,
            StoreAlerts::new(),
        )
        .unwrap();
        assert_eq!(count_copies(&db), 0);

        let backups = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("copies.db.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn test_newer_schema_is_rebuilt() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("copies.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER PRIMARY KEY);
                 INSERT INTO schema_version (version) VALUES (42);",
            )
            .unwrap();
        }

        let config = StoreConfig::new(tmp.path());
        let db = Database::open(
            &db_path,
            &COPIES,
            StoreKind::Copies,
            &config,
            StoreAlerts::new(),
        )
        .unwrap();
        assert_eq!(count_copies(&db), 0);
    }
}
