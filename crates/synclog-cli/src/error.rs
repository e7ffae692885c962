use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] synclog_core::Error),
    #[error(transparent)]
    Config(#[from] synclog_core::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Path cannot be empty")]
    EmptyPath,
    #[error("Hash cannot be empty")]
    EmptyHash,
}
