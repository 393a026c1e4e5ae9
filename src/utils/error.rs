use thiserror::Error;

use crate::config::ConfigError;
use crate::diff::DiffError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Diff error: {0}")]
    Diff(#[from] DiffError),

    /// A snapshot handed in for an explicit comparison could not be used.
    #[error("Diff input error: {0}")]
    DiffInput(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("System error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
