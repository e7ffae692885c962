//! synclog CLI - Inspect and maintain the local state of a sync node
//!
//! Opens the stores under a data directory and runs one read or maintenance
//! operation against them.

mod cli;
mod commands;
mod error;

use clap::Parser;
use synclog_core::SyncStateService;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, CopiesCommand, IndexCommand};
use crate::commands::common::open_service;
use crate::commands::{copies, index, resolve, status};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "synclog=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let service = open_service(cli.data_dir.as_deref()).await?;
    dispatch(&service, cli.command, cli.json).await
}

async fn dispatch(
    service: &SyncStateService,
    command: Commands,
    as_json: bool,
) -> Result<(), CliError> {
    match command {
        Commands::Status => status::run_status(service, as_json).await?,
        Commands::Resolve { path, folder } => {
            resolve::run_resolve(service, &path, folder, as_json).await?;
        }
        Commands::Conflict { path, exclude } => {
            resolve::run_conflict(service, &path, exclude, as_json).await?;
        }
        Commands::FuturePath {
            path,
            include_deleted,
        } => resolve::run_future_path(service, &path, include_deleted, as_json).await?,
        Commands::Copies { command } => match command {
            CopiesCommand::Clean => copies::run_clean(service, as_json).await?,
            CopiesCommand::Reconcile => copies::run_reconcile(service, as_json).await?,
            CopiesCommand::Count { hash } => copies::run_count(service, &hash, as_json).await?,
        },
        Commands::Index { command } => match command {
            IndexCommand::Get { path } => index::run_get(service, &path, as_json).await?,
            IndexCommand::ClearHashes => index::run_clear_hashes(service, as_json).await?,
        },
    }

    Ok(())
}
