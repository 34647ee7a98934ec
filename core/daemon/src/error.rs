//! Error types for hub operations.

use std::path::PathBuf;

use ide_mocha_protocol::{AddressError, Endpoint};

/// Failures creating a folder's listener. Each one is scoped to a single folder.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidConfiguration(#[from] AddressError),

    #[error("Failed to bind {endpoint} for {folder}: {source}")]
    BindFailure {
        folder: PathBuf,
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("{endpoint} for {folder} is already served for {owner}")]
    EndpointCollision {
        folder: PathBuf,
        endpoint: Endpoint,
        owner: PathBuf,
    },

    #[error("Listener setup for {folder} did not complete: {details}")]
    TaskFailed { folder: PathBuf, details: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error(transparent)]
    Address(#[from] AddressError),
}
