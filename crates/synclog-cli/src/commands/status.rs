use synclog_core::SyncStateService;

use crate::commands::common::{format_status_lines, print_json};
use crate::error::CliError;

pub async fn run_status(service: &SyncStateService, as_json: bool) -> Result<(), CliError> {
    let status = service.run(|state| state.status()).await?;

    if as_json {
        print_json(&status)?;
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }

    Ok(())
}
