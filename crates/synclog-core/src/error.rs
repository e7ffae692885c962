//! Error types for synclog-core

use thiserror::Error;

/// Result type alias using synclog-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in synclog-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error that is not a `SQLite` failure (pool, open, quarantine)
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Schema upgrade failed
    #[error("Migration of {schema} to version {version} failed: {reason}")]
    Migration {
        schema: &'static str,
        version: i32,
        reason: String,
    },

    /// Path does not resolve to a live folder
    #[error("Folder not found by path '{0}'")]
    FolderNotFound(String),

    /// Path does not resolve to a live file
    #[error("File not found by path '{0}'")]
    FileNotFound(String),

    /// No folder carries the given stable identifier
    #[error("Folder not found by uuid '{0}'")]
    FolderUuidNotFound(String),

    /// Node exists but has no stable identifier yet
    #[error("File (folder) is in processing: {0}")]
    FileInProcessing(String),

    /// No event with the given identifier
    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// The event was superseded by a later update or delete of the same file
    #[error("File with uuid '{0}' has been changed or deleted")]
    FileChanged(String),

    /// The file is not inside any of the shared roots
    #[error("File with uuid '{0}' is not shared")]
    FileNotShared(String),

    /// Another existing node already uses this name in the target folder
    #[error("Name '{name}' is already taken in folder {folder:?}")]
    NameConflict { name: String, folder: Option<i64> },

    /// A confirmation sequence number was assigned twice
    #[error("Server event id {0} is already registered")]
    DuplicateServerEventId(i64),

    /// Copy cleanup requested while batched reference changes are unflushed
    #[error("{0} batched reference change(s) pending; flush before cleaning")]
    PendingReferenceChanges(usize),

    /// Soft lock (or the database lock) could not be acquired in time
    #[error("Store is busy, lock could not be acquired")]
    StoreBusy,

    /// Database or disk is full
    #[error("Storage exhausted: {0}")]
    StorageExhausted(String),

    /// Internal invariant broken, never fixed silently
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),
}

impl Error {
    /// Whether the error means "no such node/event" rather than a failure.
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FolderNotFound(_)
                | Self::FileNotFound(_)
                | Self::FolderUuidNotFound(_)
                | Self::EventNotFound(_)
        )
    }

    /// Whether retrying the same call later can succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreBusy | Self::FileInProcessing(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_processing_are_retryable() {
        assert!(Error::StoreBusy.is_retryable());
        assert!(Error::FileInProcessing("a".into()).is_retryable());
        assert!(!Error::StorageExhausted("full".into()).is_retryable());
        assert!(!Error::ConsistencyViolation("dup".into()).is_retryable());
    }

    #[test]
    fn not_found_classification() {
        assert!(Error::FolderNotFound("a/b".into()).is_not_found());
        assert!(Error::FileNotFound("a/b".into()).is_not_found());
        assert!(!Error::FileInProcessing("a".into()).is_not_found());
    }
}
