//! Tree node model

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{EventId, EventType};

/// Stable internal id of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub i64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Summary of a node's current event, joined in when the node is loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHead {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub file_hash: Option<String>,
    pub file_size: i64,
    pub server_event_id: Option<i64>,
}

/// One persistent identity for a path slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    /// Parent folder, `None` for the root
    pub folder_id: Option<FileId>,
    pub name: String,
    /// Cross-node identifier, absent while the node is in processing
    pub uuid: Option<String>,
    /// Current event
    pub event_id: Option<EventId>,
    pub last_skipped_event_id: Option<EventId>,
    pub is_folder: bool,
    pub ignored: bool,
    /// Removed from sync scope by policy
    pub excluded: bool,
    /// Root of a shared/collaborative folder
    pub is_collaborated: bool,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Current event summary, if the current event still exists
    pub current: Option<EventHead>,
}

impl File {
    /// Not yet known to peers.
    pub const fn is_in_processing(&self) -> bool {
        self.uuid.is_none()
    }

    /// Has no current event yet.
    pub const fn is_new(&self) -> bool {
        self.event_id.is_none()
    }

    /// Current event was produced locally and is not confirmed yet.
    pub fn is_locally_modified(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|head| head.server_event_id.is_none())
    }

    pub fn file_hash(&self) -> Option<&str> {
        self.current.as_ref().and_then(|head| head.file_hash.as_deref())
    }

    pub fn size(&self) -> i64 {
        self.current.as_ref().map_or(0, |head| head.file_size)
    }
}

/// A node to insert into the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub name: String,
    pub folder_id: Option<FileId>,
    pub is_folder: bool,
    pub uuid: Option<String>,
    pub is_collaborated: bool,
    pub ignored: bool,
}

impl NewFile {
    #[must_use]
    pub fn file(name: impl Into<String>, folder_id: Option<FileId>) -> Self {
        Self {
            name: name.into(),
            folder_id,
            is_folder: false,
            uuid: None,
            is_collaborated: false,
            ignored: false,
        }
    }

    #[must_use]
    pub fn folder(name: impl Into<String>, folder_id: Option<FileId>) -> Self {
        Self {
            is_folder: true,
            ..Self::file(name, folder_id)
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub const fn collaborated(mut self) -> Self {
        self.is_collaborated = true;
        self
    }
}

/// Location and status of a folder found by uuid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub path: String,
    pub deleted: bool,
    pub excluded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(current: Option<EventHead>) -> File {
        File {
            id: FileId(1),
            folder_id: None,
            name: "a.txt".into(),
            uuid: None,
            event_id: current.as_ref().map(|_| EventId(1)),
            last_skipped_event_id: None,
            is_folder: false,
            ignored: false,
            excluded: false,
            is_collaborated: false,
            created_at: 0,
            current,
        }
    }

    #[test]
    fn placeholder_is_new_and_in_processing() {
        let file = file_with(None);
        assert!(file.is_new());
        assert!(file.is_in_processing());
        assert!(!file.is_locally_modified());
        assert_eq!(file.size(), 0);
    }

    #[test]
    fn unconfirmed_head_is_local_modification() {
        let file = file_with(Some(EventHead {
            kind: EventType::Update,
            file_hash: Some("h1".into()),
            file_size: 42,
            server_event_id: None,
        }));
        assert!(file.is_locally_modified());
        assert_eq!(file.file_hash(), Some("h1"));
        assert_eq!(file.size(), 42);
    }
}
