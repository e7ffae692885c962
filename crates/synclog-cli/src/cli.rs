use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "synclog")]
#[command(about = "Inspect and maintain a synclog data directory")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory (defaults to SYNCLOG_DATA_DIR)
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show event, index and share counters
    Status,
    /// Resolve a relative path to its live node
    Resolve {
        /// Relative path inside the sync root
        path: String,
        /// Resolve as a folder (empty path is the root)
        #[arg(long)]
        folder: bool,
    },
    /// Find the confirmed node already claiming a path
    Conflict {
        /// Prospective relative path
        path: String,
        /// Node id to ignore
        #[arg(long, value_name = "ID")]
        exclude: Option<i64>,
    },
    /// Predict which folders a path names once confirmed moves apply
    FuturePath {
        /// Relative folder path
        path: String,
        /// Also match folders whose last confirmed event is a delete
        #[arg(long)]
        include_deleted: bool,
    },
    /// Copy store maintenance
    Copies {
        #[command(subcommand)]
        command: CopiesCommand,
    },
    /// Known-file index maintenance
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },
}

#[derive(Subcommand)]
pub enum CopiesCommand {
    /// Delete copies nothing references
    Clean,
    /// Delete blobs that have no database row
    Reconcile,
    /// Show the reference count of a hash
    Count {
        /// Content hash
        hash: String,
    },
}

#[derive(Subcommand)]
pub enum IndexCommand {
    /// Show the cached fingerprint of a path
    Get {
        /// Relative path inside the sync root
        path: String,
    },
    /// Forget every cached file hash
    ClearHashes,
}
