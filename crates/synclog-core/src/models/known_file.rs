//! Known-file index entry

use serde::{Deserialize, Serialize};

use super::FileId;

/// Cached fingerprint of one relative path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownFile {
    /// Normalised relative path, unique
    pub relative_path: String,
    pub is_folder: bool,
    pub file_hash: Option<String>,
    /// Last observed modification time (Unix seconds)
    pub mtime: i64,
    pub size: i64,
    /// Tree node the path was last associated with
    pub events_file_id: Option<FileId>,
    pub was_updated: bool,
}

impl KnownFile {
    #[must_use]
    pub fn file(relative_path: impl Into<String>, hash: impl Into<String>, mtime: i64, size: i64) -> Self {
        Self {
            relative_path: relative_path.into(),
            is_folder: false,
            file_hash: Some(hash.into()),
            mtime,
            size,
            events_file_id: None,
            was_updated: false,
        }
    }

    #[must_use]
    pub fn folder(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            is_folder: true,
            file_hash: None,
            mtime: 0,
            size: 0,
            events_file_id: None,
            was_updated: false,
        }
    }

    #[must_use]
    pub const fn with_file_id(mut self, file_id: FileId) -> Self {
        self.events_file_id = Some(file_id);
        self
    }
}
