//! Database migrations
//!
//! Each database file has its own `Schema`: an ordered list of versioned
//! migrations. Applied versions are stamped into a `schema_version` table.

use crate::error::{Error, Result};
use rusqlite::{params, Connection};

/// One forward step of a schema
#[derive(Debug)]
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// Versioned schema of one database file
#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub migrations: &'static [Migration],
}

impl Schema {
    pub fn current_version(&self) -> i32 {
        self.migrations
            .iter()
            .map(|migration| migration.version)
            .max()
            .unwrap_or(0)
    }
}

const SCHEMA_VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
)";

/// Event log and tree
pub const EVENTS: Schema = Schema {
    name: "events",
    migrations: &[
        Migration {
            version: 1,
            description: "initial schema",
            statements: &[
                SCHEMA_VERSION_TABLE,
                "CREATE TABLE IF NOT EXISTS files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    folder_id INTEGER,
                    name TEXT NOT NULL,
                    uuid TEXT UNIQUE,
                    event_id INTEGER,
                    last_skipped_event_id INTEGER,
                    is_folder INTEGER NOT NULL DEFAULT 0,
                    ignored INTEGER NOT NULL DEFAULT 0,
                    excluded INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_files_folder_id ON files(folder_id)",
                "CREATE INDEX IF NOT EXISTS idx_files_name ON files(name COLLATE NOCASE)",
                "CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                    uuid TEXT,
                    type TEXT NOT NULL,
                    is_folder INTEGER NOT NULL DEFAULT 0,
                    file_name TEXT,
                    file_name_before_event TEXT,
                    file_size INTEGER NOT NULL DEFAULT 0,
                    file_size_before_event INTEGER NOT NULL DEFAULT 0,
                    file_hash TEXT,
                    file_hash_before_event TEXT,
                    file_uuid TEXT,
                    folder_uuid TEXT,
                    state TEXT NOT NULL,
                    server_event_id INTEGER UNIQUE,
                    last_event_id INTEGER,
                    diff_file_uuid TEXT,
                    diff_file_size INTEGER NOT NULL DEFAULT 0,
                    rev_diff_file_uuid TEXT,
                    rev_diff_file_size INTEGER NOT NULL DEFAULT 0,
                    timestamp INTEGER NOT NULL,
                    outdated INTEGER NOT NULL DEFAULT 0,
                    restore INTEGER NOT NULL DEFAULT 0,
                    erase_nested INTEGER NOT NULL DEFAULT 0,
                    checked INTEGER NOT NULL DEFAULT 0
                )",
                "CREATE INDEX IF NOT EXISTS idx_events_file_id ON events(file_id, id)",
                "CREATE INDEX IF NOT EXISTS idx_events_uuid ON events(uuid)",
            ],
        },
        Migration {
            version: 2,
            description: "collaboration roots and uuid lookups",
            statements: &[
                "ALTER TABLE files ADD COLUMN is_collaborated INTEGER NOT NULL DEFAULT 0",
                "CREATE INDEX IF NOT EXISTS idx_events_file_uuid ON events(file_uuid)",
                "CREATE INDEX IF NOT EXISTS idx_events_folder_uuid ON events(folder_uuid)",
                "CREATE INDEX IF NOT EXISTS idx_events_diff_file_uuid ON events(diff_file_uuid)",
            ],
        },
    ],
};

/// Known-file index
pub const STORAGE: Schema = Schema {
    name: "storage",
    migrations: &[
        Migration {
            version: 1,
            description: "initial schema",
            statements: &[
                SCHEMA_VERSION_TABLE,
                "CREATE TABLE IF NOT EXISTS known_files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    relative_path TEXT NOT NULL UNIQUE,
                    is_folder INTEGER NOT NULL DEFAULT 0,
                    file_hash TEXT,
                    mtime INTEGER NOT NULL DEFAULT 0,
                    size INTEGER NOT NULL DEFAULT 0,
                    events_file_id INTEGER
                )",
                "CREATE INDEX IF NOT EXISTS idx_known_files_events_file_id
                    ON known_files(events_file_id)",
                "CREATE INDEX IF NOT EXISTS idx_known_files_hash ON known_files(file_hash)",
            ],
        },
        Migration {
            version: 2,
            description: "track updated entries",
            statements: &[
                "ALTER TABLE known_files ADD COLUMN was_updated INTEGER NOT NULL DEFAULT 0",
            ],
        },
    ],
};

/// Copy reference counts
pub const COPIES: Schema = Schema {
    name: "copies",
    migrations: &[Migration {
        version: 1,
        description: "initial schema",
        statements: &[
            SCHEMA_VERSION_TABLE,
            "CREATE TABLE IF NOT EXISTS copies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                count INTEGER NOT NULL DEFAULT 0
            )",
        ],
    }],
};

/// Run all pending migrations of `schema`
pub fn run(conn: &mut Connection, schema: &Schema) -> Result<()> {
    let version = get_version(conn)?;
    let current = schema.current_version();

    if version > current {
        return Err(Error::Migration {
            schema: schema.name,
            version,
            reason: format!("database is newer than supported version {current}"),
        });
    }

    for migration in schema.migrations.iter().filter(|m| m.version > version) {
        apply(conn, schema, migration)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &mut Connection, schema: &Schema, migration: &Migration) -> Result<()> {
    let failed = |error: rusqlite::Error| Error::Migration {
        schema: schema.name,
        version: migration.version,
        reason: error.to_string(),
    };

    let tx = conn.transaction().map_err(failed)?;
    for stmt in migration.statements {
        tx.execute_batch(stmt).map_err(failed)?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![migration.version],
    )
    .map_err(failed)?;
    tx.commit().map_err(failed)?;

    tracing::info!(
        "Migrated {} database to version {} ({})",
        schema.name,
        migration.version,
        migration.description
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        for schema in [&EVENTS, &STORAGE, &COPIES] {
            let mut conn = setup();
            run(&mut conn, schema).unwrap();
            assert_eq!(get_version(&conn).unwrap(), schema.current_version());
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn, &EVENTS).unwrap();
        run(&mut conn, &EVENTS).unwrap();

        assert_eq!(get_version(&conn).unwrap(), 2);
        assert!(table_exists(&conn, "files"));
        assert!(table_exists(&conn, "events"));
    }

    #[test]
    fn test_upgrade_from_v1_adds_columns() {
        let mut conn = setup();
        let v1 = Schema {
            name: "storage",
            migrations: &STORAGE.migrations[..1],
        };
        run(&mut conn, &v1).unwrap();
        assert_eq!(get_version(&conn).unwrap(), 1);

        run(&mut conn, &STORAGE).unwrap();
        assert_eq!(get_version(&conn).unwrap(), 2);
        conn.execute(
            "INSERT INTO known_files (relative_path, was_updated) VALUES ('a', 1)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_newer_database_is_rejected() {
        let mut conn = setup();
        run(&mut conn, &COPIES).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (99)", [])
            .unwrap();

        let err = run(&mut conn, &COPIES).unwrap_err();
        assert!(matches!(err, Error::Migration { version: 99, .. }));
    }
}
