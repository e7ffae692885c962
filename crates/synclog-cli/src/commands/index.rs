use synclog_core::SyncStateService;

use crate::commands::common::{format_known_file_line, normalize_path_arg, print_json};
use crate::error::CliError;

pub async fn run_get(service: &SyncStateService, path: &str, as_json: bool) -> Result<(), CliError> {
    let path = normalize_path_arg(path)?;
    let entry = service.run(move |state| state.index().get(&path)).await?;

    if as_json {
        print_json(&entry)?;
    } else {
        match &entry {
            Some(entry) => println!("{}", format_known_file_line(entry)),
            None => println!("Path is not indexed."),
        }
    }

    Ok(())
}

pub async fn run_clear_hashes(service: &SyncStateService, as_json: bool) -> Result<(), CliError> {
    let cleared = service.run(|state| state.index().clear_hashes()).await?;

    if as_json {
        print_json(&serde_json::json!({ "cleared": cleared }))?;
    } else {
        println!("Cleared {cleared} cached hashes.");
    }

    Ok(())
}
