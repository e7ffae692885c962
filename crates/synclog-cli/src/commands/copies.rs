use serde::Serialize;
use synclog_core::SyncStateService;

use crate::commands::common::{normalize_hash_arg, print_json};
use crate::error::CliError;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CopyCountItem {
    pub hash: String,
    pub count: Option<i64>,
    pub blob_exists: bool,
}

pub async fn run_clean(service: &SyncStateService, as_json: bool) -> Result<(), CliError> {
    let removed = service.clean_copies().await?;

    if as_json {
        print_json(&removed)?;
    } else if removed.is_empty() {
        println!("No unreferenced copies.");
    } else {
        for hash in &removed {
            println!("Removed {hash}");
        }
        println!("Removed {} copies.", removed.len());
    }

    Ok(())
}

pub async fn run_reconcile(service: &SyncStateService, as_json: bool) -> Result<(), CliError> {
    let removed = service
        .run(|state| state.copies().reconcile_with_filesystem())
        .await?;

    if as_json {
        print_json(&serde_json::json!({ "removed": removed }))?;
    } else {
        println!("Removed {removed} orphan blobs.");
    }

    Ok(())
}

pub async fn run_count(
    service: &SyncStateService,
    hash: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let hash = normalize_hash_arg(hash)?;
    let item = service
        .run(move |state| {
            let copies = state.copies();
            Ok(CopyCountItem {
                count: copies.reference_count(&hash)?,
                blob_exists: copies.copy_exists(&hash)?,
                hash,
            })
        })
        .await?;

    if as_json {
        print_json(&item)?;
    } else {
        println!("{}", format_copy_count(&item));
    }

    Ok(())
}

pub fn format_copy_count(item: &CopyCountItem) -> String {
    let count = item
        .count
        .map_or_else(|| "unknown".to_string(), |count| count.to_string());
    let blob = if item.blob_exists { "present" } else { "missing" };
    format!("{}  references {count}  blob {blob}", item.hash)
}
