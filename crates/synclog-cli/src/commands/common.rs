use std::path::Path;

use serde::Serialize;
use synclog_core::{
    Event, File, KnownFile, StateStatus, StoreAlerts, StoreConfig, SyncState, SyncStateService,
};

use crate::error::CliError;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FileItem {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub uuid: Option<String>,
    pub is_folder: bool,
    pub deleted: bool,
    pub excluded: bool,
    pub event_id: Option<i64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ConflictItem {
    pub file: FileItem,
    pub event_id: i64,
    pub event_type: String,
    pub server_event_id: Option<i64>,
}

pub async fn open_service(data_dir: Option<&Path>) -> Result<SyncStateService, CliError> {
    let config = StoreConfig::from_env_with_data_dir(data_dir)?;
    Ok(SyncStateService::open(config, StoreAlerts::new()).await?)
}

pub fn normalize_path_arg(path: &str) -> Result<String, CliError> {
    let normalized = synclog_core::util::normalize_relative_path(path);
    if normalized.is_empty() {
        return Err(CliError::EmptyPath);
    }
    Ok(normalized)
}

pub fn normalize_hash_arg(hash: &str) -> Result<String, CliError> {
    let trimmed = hash.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyHash);
    }
    Ok(trimmed.to_string())
}

pub fn file_item(state: &SyncState, file: &File) -> Result<FileItem, CliError> {
    let events = state.events();
    Ok(FileItem {
        id: file.id.0,
        name: file.name.clone(),
        path: events.path_of(file.id)?,
        uuid: file.uuid.clone(),
        is_folder: file.is_folder,
        deleted: events.is_deleted(file.id)?,
        excluded: file.excluded,
        event_id: file.event_id.map(|id| id.0),
    })
}

pub fn conflict_item(
    state: &SyncState,
    file: &File,
    event: &Event,
) -> Result<ConflictItem, CliError> {
    Ok(ConflictItem {
        file: file_item(state, file)?,
        event_id: event.id.0,
        event_type: event.kind.to_string(),
        server_event_id: event.server_event_id,
    })
}

pub fn format_file_line(item: &FileItem) -> String {
    let kind = if item.is_folder { "folder" } else { "file" };
    let uuid = item.uuid.as_deref().unwrap_or("(in processing)");
    let mut line = format!("{:>6}  {kind:<6}  {}  {uuid}", item.id, item.path);
    if item.deleted {
        line.push_str("  [deleted]");
    }
    if item.excluded {
        line.push_str("  [excluded]");
    }
    line
}

pub fn format_conflict_line(item: &ConflictItem) -> String {
    let server = item
        .server_event_id
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    format!(
        "{}  ({} event {}, server id {server})",
        format_file_line(&item.file),
        item.event_type,
        item.event_id
    )
}

pub fn format_known_file_line(file: &KnownFile) -> String {
    let kind = if file.is_folder { "folder" } else { "file" };
    let hash = file.file_hash.as_deref().unwrap_or("-");
    let node = file
        .events_file_id
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    format!(
        "{kind:<6}  {}  hash {hash}  size {}  mtime {}  node {node}",
        file.relative_path, file.size, file.mtime
    )
}

pub fn format_status_lines(status: &StateStatus) -> Vec<String> {
    vec![
        format!("Max server event id:  {}", status.max_server_event_id),
        format!("Max checked event id: {}", status.max_checked_server_event_id),
        format!(
            "Local events:         {}",
            if status.local_events_processed {
                "all processed"
            } else {
                "pending"
            }
        ),
        format!("Known files:          {}", status.known_files),
        format!("Share size:           {} bytes", status.share_size),
    ]
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
