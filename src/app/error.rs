use thiserror::Error;

use crate::cache::snapshot::SnapshotError;
use crate::client::ApiError;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum EddyError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Cache snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, EddyError>;
