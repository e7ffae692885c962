//! Data models for synclog

mod copy;
mod event;
mod file;
mod known_file;

pub use copy::Copy;
pub use event::{new_event_uuid, Event, EventId, EventState, EventType, NewEvent, ParseLabelError};
pub use file::{EventHead, File, FileId, FolderInfo, NewFile};
pub use known_file::KnownFile;
