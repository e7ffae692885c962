//! Event model

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use super::FileId;

/// Local sequence id of an event, assigned on insert and strictly increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unknown enum label read from the database
#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseLabelError {
    kind: &'static str,
    value: String,
}

/// What happened to the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Move,
    Delete,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Move => "move",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "move" => Ok(Self::Move),
            "delete" => Ok(Self::Delete),
            other => Err(ParseLabelError {
                kind: "event type",
                value: other.to_string(),
            }),
        }
    }
}

/// Local-vs-remote processing stage of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    /// Happened locally, not yet confirmed
    Occurred,
    /// Happened locally and collided with a confirmed remote event
    Conflicted,
    /// Local event confirmed by the network layer
    Registered,
    /// Local event handed to the network layer
    Sent,
    /// Remote event known but not applied yet
    Received,
    /// Remote event applied to the local tree
    Downloaded,
}

impl EventState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Occurred => "occurred",
            Self::Conflicted => "conflicted",
            Self::Registered => "registered",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Downloaded => "downloaded",
        }
    }

    /// Local events are applied to the tree as soon as they are recorded.
    pub const fn is_local(self) -> bool {
        matches!(self, Self::Occurred | Self::Conflicted)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "occurred" => Ok(Self::Occurred),
            "conflicted" => Ok(Self::Conflicted),
            "registered" => Ok(Self::Registered),
            "sent" => Ok(Self::Sent),
            "received" => Ok(Self::Received),
            "downloaded" => Ok(Self::Downloaded),
            other => Err(ParseLabelError {
                kind: "event state",
                value: other.to_string(),
            }),
        }
    }
}

macro_rules! sql_label {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|error| FromSqlError::Other(Box::new(error)))
            }
        }
    };
}

sql_label!(EventType);
sql_label!(EventState);

/// An immutable fact about one tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Local sequence id
    pub id: EventId,
    /// Node the event belongs to
    pub file_id: FileId,
    /// Globally unique event identifier
    pub uuid: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub is_folder: bool,
    /// Node name after the event
    pub file_name: Option<String>,
    /// Node name before a move or delete
    pub file_name_before_event: Option<String>,
    pub file_size: i64,
    pub file_size_before_event: i64,
    pub file_hash: Option<String>,
    pub file_hash_before_event: Option<String>,
    /// Stable identifier of the node itself
    pub file_uuid: Option<String>,
    /// Stable identifier of the parent folder, `None` for the root
    pub folder_uuid: Option<String>,
    pub state: EventState,
    /// Confirmation sequence number, `None` until the network layer confirms
    pub server_event_id: Option<i64>,
    /// Current event of the node when this one was recorded
    pub last_event_id: Option<EventId>,
    pub diff_file_uuid: Option<String>,
    pub diff_file_size: i64,
    pub rev_diff_file_uuid: Option<String>,
    pub rev_diff_file_size: i64,
    /// Record timestamp (Unix ms)
    pub timestamp: i64,
    pub outdated: bool,
    pub restore: bool,
    /// Children were erased together with the containing folder
    pub erase_nested: bool,
    /// Network layer verified the event is up to date
    pub checked: bool,
}

impl Event {
    /// Whether the network layer has confirmed this event.
    pub const fn is_confirmed(&self) -> bool {
        self.server_event_id.is_some()
    }

    /// Name the node carried at this point of its history.
    ///
    /// Deletes fall back to the name before the event.
    pub fn display_name(&self) -> Option<&str> {
        let name = if self.kind == EventType::Delete {
            self.file_name_before_event
                .as_deref()
                .or(self.file_name.as_deref())
        } else {
            self.file_name.as_deref()
        };
        name.filter(|name| !name.is_empty())
    }

    /// Hash the event makes available: the new hash, or the old one for deletes.
    pub fn served_hash(&self) -> Option<&str> {
        self.file_hash
            .as_deref()
            .or(self.file_hash_before_event.as_deref())
    }
}

/// An event to append to the log
///
/// Fields left as `None` are filled from the node's current state when the
/// event is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub kind: EventType,
    pub state: EventState,
    pub uuid: Option<String>,
    pub file_name: Option<String>,
    pub file_name_before_event: Option<String>,
    pub file_hash: Option<String>,
    pub file_hash_before_event: Option<String>,
    pub file_size: Option<i64>,
    pub file_size_before_event: Option<i64>,
    pub file_uuid: Option<String>,
    /// Target folder for create/move (`None` = root); inherited for update/delete
    pub folder_uuid: Option<String>,
    pub server_event_id: Option<i64>,
    pub diff_file_uuid: Option<String>,
    pub diff_file_size: i64,
    pub rev_diff_file_uuid: Option<String>,
    pub rev_diff_file_size: i64,
    pub erase_nested: bool,
    pub restore: bool,
    pub checked: bool,
}

impl NewEvent {
    fn new(kind: EventType) -> Self {
        Self {
            kind,
            state: EventState::Occurred,
            uuid: None,
            file_name: None,
            file_name_before_event: None,
            file_hash: None,
            file_hash_before_event: None,
            file_size: None,
            file_size_before_event: None,
            file_uuid: None,
            folder_uuid: None,
            server_event_id: None,
            diff_file_uuid: None,
            diff_file_size: 0,
            rev_diff_file_uuid: None,
            rev_diff_file_size: 0,
            erase_nested: false,
            restore: false,
            checked: false,
        }
    }

    /// Node appears under `folder_uuid` with `name`
    #[must_use]
    pub fn create(name: impl Into<String>, folder_uuid: Option<String>) -> Self {
        let mut event = Self::new(EventType::Create);
        event.file_name = Some(name.into());
        event.folder_uuid = folder_uuid;
        event
    }

    /// Node content changes
    #[must_use]
    pub fn update(hash: impl Into<String>, size: i64) -> Self {
        Self::new(EventType::Update).with_content(hash, size)
    }

    /// Node is renamed and/or re-parented
    #[must_use]
    pub fn moved(name: impl Into<String>, folder_uuid: Option<String>) -> Self {
        let mut event = Self::new(EventType::Move);
        event.file_name = Some(name.into());
        event.folder_uuid = folder_uuid;
        event
    }

    /// Node is removed
    #[must_use]
    pub fn delete() -> Self {
        Self::new(EventType::Delete)
    }

    #[must_use]
    pub fn with_content(mut self, hash: impl Into<String>, size: i64) -> Self {
        self.file_hash = Some(hash.into());
        self.file_size = Some(size);
        self
    }

    #[must_use]
    pub const fn with_state(mut self, state: EventState) -> Self {
        self.state = state;
        self
    }

    /// Mark as a remote event that still has to be applied
    #[must_use]
    pub const fn received(self) -> Self {
        self.with_state(EventState::Received)
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub fn with_file_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.file_uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub fn in_folder(mut self, folder_uuid: impl Into<String>) -> Self {
        self.folder_uuid = Some(folder_uuid.into());
        self
    }

    #[must_use]
    pub const fn with_server_event_id(mut self, server_event_id: i64) -> Self {
        self.server_event_id = Some(server_event_id);
        self
    }

    #[must_use]
    pub fn with_diff(mut self, uuid: impl Into<String>, size: i64) -> Self {
        self.diff_file_uuid = Some(uuid.into());
        self.diff_file_size = size;
        self
    }

    #[must_use]
    pub fn with_rev_diff(mut self, uuid: impl Into<String>, size: i64) -> Self {
        self.rev_diff_file_uuid = Some(uuid.into());
        self.rev_diff_file_size = size;
        self
    }

    #[must_use]
    pub const fn erasing_nested(mut self) -> Self {
        self.erase_nested = true;
        self
    }

    #[must_use]
    pub const fn checked(mut self) -> Self {
        self.checked = true;
        self
    }
}

/// Generate a new event identifier (UUID v7, 32 hex chars)
#[must_use]
pub fn new_event_uuid() -> String {
    Uuid::now_v7().simple().to_string()
}
