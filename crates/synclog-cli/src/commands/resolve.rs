use synclog_core::{FileId, SyncState, SyncStateService};

use crate::commands::common::{
    conflict_item, file_item, format_conflict_line, format_file_line, normalize_path_arg,
    print_json, ConflictItem, FileItem,
};
use crate::error::CliError;

pub async fn run_resolve(
    service: &SyncStateService,
    path: &str,
    as_folder: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let path = if as_folder {
        synclog_core::util::normalize_relative_path(path)
    } else {
        normalize_path_arg(path)?
    };
    let item = service
        .run(move |state| Ok(resolve_item(state, &path, as_folder)))
        .await??;

    if as_json {
        print_json(&item)?;
    } else {
        match &item {
            Some(item) => println!("{}", format_file_line(item)),
            None => println!("(root)"),
        }
    }

    Ok(())
}

pub async fn run_conflict(
    service: &SyncStateService,
    path: &str,
    exclude: Option<i64>,
    as_json: bool,
) -> Result<(), CliError> {
    let path = normalize_path_arg(path)?;
    let item = service
        .run(move |state| Ok(conflict_for(state, &path, exclude)))
        .await??;

    if as_json {
        print_json(&item)?;
    } else {
        match &item {
            Some(item) => println!("{}", format_conflict_line(item)),
            None => println!("No conflicting node."),
        }
    }

    Ok(())
}

pub async fn run_future_path(
    service: &SyncStateService,
    path: &str,
    include_deleted: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let path = normalize_path_arg(path)?;
    let items = service
        .run(move |state| Ok(future_folders(state, &path, include_deleted)))
        .await??;

    if as_json {
        print_json(&items)?;
    } else if items.is_empty() {
        println!("No folders found.");
    } else {
        for item in &items {
            println!("{}", format_file_line(item));
        }
    }

    Ok(())
}

/// Node at `path`; `None` only when a folder lookup lands on the root.
pub fn resolve_item(
    state: &SyncState,
    path: &str,
    as_folder: bool,
) -> Result<Option<FileItem>, CliError> {
    let file = if as_folder {
        state.events().find_folder_by_relative_path(path, true)?
    } else {
        Some(state.events().find_file_by_relative_path(path)?)
    };
    file.map(|file| file_item(state, &file)).transpose()
}

pub fn conflict_for(
    state: &SyncState,
    path: &str,
    exclude: Option<i64>,
) -> Result<Option<ConflictItem>, CliError> {
    let found = state
        .events()
        .find_conflicting_file_or_folder(path, exclude.map(FileId))?;
    found
        .map(|(file, event)| conflict_item(state, &file, &event))
        .transpose()
}

pub fn future_folders(
    state: &SyncState,
    path: &str,
    include_deleted: bool,
) -> Result<Vec<FileItem>, CliError> {
    state
        .events()
        .find_folders_by_future_path(path, include_deleted)?
        .iter()
        .map(|folder| file_item(state, folder))
        .collect()
}
